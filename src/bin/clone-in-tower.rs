extern crate chrono;
extern crate clone_in_tower;
extern crate env_logger;
extern crate failure;
#[macro_use]
extern crate log;
extern crate shellexpand;
extern crate structopt;
#[macro_use]
extern crate structopt_derive;
extern crate tokio;

use std::env;
use std::io::Write;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use clone_in_tower::{Config, CloneUrlDeriver, Dispatcher, JsonFileStore, Preference, Protocol,
                     RepositoryIdentity, SettingsStore, SystemOpener};
use env_logger::Builder;
use failure::{Error, ResultExt};
use log::LevelFilter;
use structopt::StructOpt;
use tokio::sync::mpsc;

fn main() {
    let args = Args::from_args();

    let outcome = if args.example_config {
        generate_example()
    } else {
        run(&args)
    };

    if let Err(e) = outcome {
        eprintln!("Error: {}", e);

        for cause in e.iter_chain().skip(1) {
            eprintln!("\tCaused By: {}", cause);
        }

        eprintln!("{}", e.backtrace());
        process::exit(1);
    }
}

fn generate_example() -> Result<(), Error> {
    let example = Config::example();

    println!("{}", example.as_toml()?);
    Ok(())
}

fn run(args: &Args) -> Result<(), Error> {
    initialize_logging(args)?;
    let cfg = args.config()?;

    if log_enabled!(log::Level::Debug) {
        for line in format!("{:#?}", cfg).lines() {
            debug!("{}", line);
        }
    }

    let runtime = tokio::runtime::Runtime::new().context("Unable to start the async runtime")?;
    runtime.block_on(execute(args, &cfg))
}

async fn execute(args: &Args, cfg: &Config) -> Result<(), Error> {
    let store = JsonFileStore::new(cfg.storage_path()?);
    let settings = SettingsStore::new(Arc::new(store));

    if let Err(e) = settings.initialize().await {
        warn!("Couldn't load your preferences, using the defaults ({})", e);
    }

    if let Some(ref raw) = args.protocol {
        save_protocol(&settings, raw.parse()?).await?;
    }

    let dispatcher = Dispatcher::new(settings, CloneUrlDeriver::from_config(&cfg.general));

    let page_url = match args.url {
        Some(ref url) => url,
        None => {
            if args.protocol.is_none() {
                println!("protocol = {}", dispatcher.settings().protocol());
            }
            return Ok(());
        }
    };

    if args.show {
        show(&dispatcher, page_url);
    } else if !dispatcher.open_page(page_url, &SystemOpener)? {
        eprintln!("Nothing to open, {} isn't a repository page", page_url);
    }

    Ok(())
}

/// Save the preference, then wait for the store to report it back so the
/// icon we print is the one every other front end will now show.
async fn save_protocol(settings: &SettingsStore, protocol: Protocol) -> Result<(), Error> {
    let unchanged = settings.protocol() == protocol;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = settings.subscribe(&[Preference::Protocol], move |changed| {
        if let Some(value) = changed.get(&Preference::Protocol) {
            let _ = tx.send(value.clone());
        }
    });

    settings
        .set_protocol(protocol)
        .await
        .context("Unable to save the protocol preference")?;

    if !unchanged {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(value)) => debug!("The store now says {:?}", value),
            _ => warn!("The store never confirmed the new protocol"),
        }
    }
    subscription.unsubscribe();

    println!("Settings saved ({}).", settings.protocol().icon_name());
    Ok(())
}

/// Print both clone URLs, marking the preferred one, followed by the URL
/// which would be opened.
fn show(dispatcher: &Dispatcher, page_url: &str) {
    let host = dispatcher.deriver().host();
    let urls = dispatcher.clone_urls(page_url);
    let placeholder = RepositoryIdentity {
        owner: String::from("username"),
        name: String::from("repo"),
    };
    let preferred = dispatcher.settings().protocol();

    let rows = vec![
        (
            Protocol::Https,
            urls.https.clone().unwrap_or_else(|| placeholder.https_url(host)),
        ),
        (
            Protocol::Ssh,
            urls.ssh.clone().unwrap_or_else(|| placeholder.ssh_url(host)),
        ),
    ];

    for (protocol, url) in rows {
        let mark = if protocol == preferred { "x" } else { " " };
        println!("[{}] {:5} {}", mark, protocol.as_str(), url);
    }

    if let Some(launch) = dispatcher.launch_url_for_page(page_url) {
        println!();
        println!("Clone in Tower ({}): {}", preferred.icon_name(), launch);
    }
}

#[derive(Debug, Clone, PartialEq, StructOpt)]
struct Args {
    #[structopt(short = "c", long = "config", default_value = "~/.clone-in-tower.toml",
                help = "The configuration file to use.")]
    config_file: String,
    #[structopt(short = "v", long = "verbose",
                help = "Verbose output (repeat for more verbosity)")]
    verbosity: u64,
    #[structopt(long = "example-config",
                help = "Generate an example config and immediately exit.")]
    example_config: bool,
    #[structopt(short = "p", long = "protocol",
                help = "Save your preferred clone protocol (https or ssh).")]
    protocol: Option<String>,
    #[structopt(short = "s", long = "show",
                help = "Show the clone URLs instead of opening Tower.")]
    show: bool,
    #[structopt(help = "The GitHub page you are looking at.")]
    url: Option<String>,
}

impl Args {
    fn config(&self) -> Result<Config, Error> {
        let path = shellexpand::full(&self.config_file)
            .context("Unable to expand the config file's path")?;
        let cfg = Config::from_file(&*path)
            .with_context(|_| format!("Couldn't load {}", path))?;

        Ok(cfg)
    }
}

fn initialize_logging(args: &Args) -> Result<(), Error> {
    let mut builder = Builder::new();

    let level = match args.verbosity {
        0 => None,
        1 => Some(LevelFilter::Info),
        2 => Some(LevelFilter::Debug),
        _ => Some(LevelFilter::Trace),
    };

    if let Some(lvl) = level {
        builder.filter(Some("clone_in_tower"), lvl);
    }

    if let Ok(filter) = env::var("RUST_LOG") {
        builder.parse(&filter);
    }

    builder.format(|out, record| {
        let location = match record.line() {
            Some(line) => format!("{}#{}", record.target(), line),
            None => record.target().to_string(),
        };

        writeln!(
            out,
            "{} [{:5}] ({}): {}",
            Local::now().format("%H:%M:%S"),
            record.level(),
            location,
            record.args()
        )
    });

    builder.try_init()?;

    Ok(())
}
