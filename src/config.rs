use failure::{Error, ResultExt};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::clone_url::{DEFAULT_HOST, DEFAULT_SCHEME};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: General,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct General {
    /// The hosting service whose pages we know how to read (e.g. a GitHub
    /// Enterprise instance).
    pub host: String,
    /// The URL scheme the desktop application is registered under.
    pub scheme: String,
    /// Where preferences are persisted between runs.
    pub storage: PathBuf,
}

impl General {
    pub const DEFAULT_STORAGE: &'static str = "~/.clone-in-tower.json";
}

impl Default for General {
    fn default() -> General {
        General {
            host: DEFAULT_HOST.to_string(),
            scheme: DEFAULT_SCHEME.to_string(),
            storage: PathBuf::from(General::DEFAULT_STORAGE),
        }
    }
}

impl Config {
    /// Load a config file, falling back to the defaults if it doesn't exist.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        let path = path.as_ref();
        debug!("Reading config from {}", path.display());

        let src = match fs::read_to_string(path) {
            Err(ref e) if e.kind() == ErrorKind::NotFound => {
                info!("{} doesn't exist, using the default config", path.display());
                return Ok(Config::default());
            }
            other => other.context("Unable to read the config file")?,
        };

        Config::parse(&src)
    }

    pub fn parse(src: &str) -> Result<Config, Error> {
        let cfg = toml::from_str(src).context("Invalid config file")?;
        Ok(cfg)
    }

    /// The path to the preferences file, with `~` and environment variables
    /// expanded.
    pub fn storage_path(&self) -> Result<PathBuf, Error> {
        let raw = self.general.storage.to_string_lossy();
        let expanded = shellexpand::full(&raw).context("Unable to expand the storage path")?;

        Ok(PathBuf::from(expanded.into_owned()))
    }

    pub fn example() -> Config {
        Config::default()
    }

    pub fn as_toml(&self) -> Result<String, Error> {
        let src = toml::to_string_pretty(self).context("Unable to serialize the config")?;
        Ok(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_fields_use_the_defaults() {
        let got = Config::parse("[general]\nhost = \"git.example.org\"\n").unwrap();

        assert_eq!(got.general.host, "git.example.org");
        assert_eq!(got.general.scheme, DEFAULT_SCHEME);
        assert_eq!(got.general.storage, PathBuf::from(General::DEFAULT_STORAGE));
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn example_round_trips_through_toml() {
        let example = Config::example();
        let src = example.as_toml().unwrap();

        assert!(src.contains("host = \"github.com\""));
        assert_eq!(Config::parse(&src).unwrap(), example);
    }

    #[test]
    fn load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[general]\nscheme = \"tower-beta\"").unwrap();

        let got = Config::from_file(file.path()).unwrap();
        assert_eq!(got.general.scheme, "tower-beta");
        assert_eq!(got.general.host, DEFAULT_HOST);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let got = Config::from_file(dir.path().join("nope.toml")).unwrap();

        assert_eq!(got, Config::default());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(Config::parse("[general\nhost = 5").is_err());
    }
}
