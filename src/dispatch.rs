//! Deciding which URL to hand to Tower for the current page, and handing it
//! over.

use failure::{Error, ResultExt};
use std::process::{Command, Stdio};

use crate::clone_url::{CloneUrlDeriver, CloneUrls};
use crate::settings::SettingsStore;

/// Something which can open a URL, usually by asking the OS to.
pub trait Opener {
    /// Open `url` without waiting for whatever handles it.
    fn open(&self, url: &str) -> Result<(), Error>;
}

/// Opens URLs with the platform's own launcher (`open`, `xdg-open` or
/// `start`).
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct SystemOpener;

impl SystemOpener {
    fn command(url: &str) -> Command {
        if cfg!(target_os = "macos") {
            let mut cmd = Command::new("open");
            cmd.arg(url);
            cmd
        } else if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.args(&["/C", "start", ""]).arg(url);
            cmd
        } else {
            let mut cmd = Command::new("xdg-open");
            cmd.arg(url);
            cmd
        }
    }
}

impl Opener for SystemOpener {
    fn open(&self, url: &str) -> Result<(), Error> {
        let mut cmd = SystemOpener::command(url);
        debug!("Running {:?}", cmd);

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Unable to launch the URL handler")?;

        Ok(())
    }
}

/// Combines the current protocol preference with a [`CloneUrlDeriver`].
///
/// The settings must have been initialized before asking for a URL,
/// otherwise the default protocol is used.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    settings: SettingsStore,
    deriver: CloneUrlDeriver,
}

impl Dispatcher {
    pub fn new(settings: SettingsStore, deriver: CloneUrlDeriver) -> Dispatcher {
        Dispatcher { settings, deriver }
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn deriver(&self) -> &CloneUrlDeriver {
        &self.deriver
    }

    pub fn clone_urls(&self, page_url: &str) -> CloneUrls {
        self.deriver.clone_urls(page_url)
    }

    /// The URL which opens the page's repository in Tower, using whichever
    /// protocol is currently preferred.
    pub fn launch_url_for_page(&self, page_url: &str) -> Option<String> {
        let protocol = self.settings.protocol();
        self.deriver.application_url_for_page(page_url, protocol)
    }

    /// Open the page's repository in Tower.
    ///
    /// Returns `false` when the page isn't a repository and nothing was
    /// opened.
    pub fn open_page(&self, page_url: &str, opener: &dyn Opener) -> Result<bool, Error> {
        match self.launch_url_for_page(page_url) {
            Some(url) => {
                info!("Opening {}", url);
                opener.open(&url)?;
                Ok(true)
            }
            None => {
                debug!("{:?} isn't a repository page", page_url);
                Ok(false)
            }
        }
    }
}
