//! Turning the URL of a web page into clone URLs and a launchable Tower URL.
//!
//! Everything in here is a pure function of its inputs. Pages which don't
//! point at a repository are never an error, they just don't produce a URL.

use regex::Regex;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use url::Url;

use crate::config::General;
use crate::errors::UnknownProtocol;

/// The hosting service we recognise when nothing else is configured.
pub const DEFAULT_HOST: &str = "github.com";
/// The URL scheme Tower registers with the operating system.
pub const DEFAULT_SCHEME: &str = "gittower";

lazy_static! {
    // A repository name stops at the first '.', so "owner/my.repo" is read
    // as "owner/my".
    static ref REPO_PATH: Regex = Regex::new(r"^/([^/]+)/([^/|.]+)").unwrap();
    static ref GITHUB: CloneUrlDeriver = CloneUrlDeriver::default();
}

/// The transport used when cloning a repository.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Https,
    Ssh,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match *self {
            Protocol::Https => "https",
            Protocol::Ssh => "ssh",
        }
    }

    /// The name of the icon shown next to the "Clone in Tower" label.
    pub fn icon_name(&self) -> &'static str {
        match *self {
            Protocol::Https => "cloud",
            Protocol::Ssh => "terminal",
        }
    }
}

impl Default for Protocol {
    fn default() -> Protocol {
        Protocol::Https
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Protocol, UnknownProtocol> {
        match s.trim().to_ascii_lowercase().as_str() {
            "https" => Ok(Protocol::Https),
            "ssh" => Ok(Protocol::Ssh),
            _ => Err(UnknownProtocol(s.to_string())),
        }
    }
}

/// The owner and name of a repository, as seen in its page URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryIdentity {
    pub owner: String,
    pub name: String,
}

impl RepositoryIdentity {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn https_url(&self, host: &str) -> String {
        format!("https://{}/{}/{}.git", host, self.owner, self.name)
    }

    pub fn ssh_url(&self, host: &str) -> String {
        format!("git@{}:{}/{}.git", host, self.owner, self.name)
    }
}

/// The HTTPS and SSH clone URLs for a repository.
///
/// Either both URLs are present and name the same repository, or neither is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneUrls {
    pub https: Option<String>,
    pub ssh: Option<String>,
}

impl CloneUrls {
    /// The pair you get for a page which isn't a repository.
    pub fn none() -> CloneUrls {
        CloneUrls::default()
    }

    fn for_repository(repo: &RepositoryIdentity, host: &str) -> CloneUrls {
        CloneUrls {
            https: Some(repo.https_url(host)),
            ssh: Some(repo.ssh_url(host)),
        }
    }

    /// Is there something we can offer to clone?
    pub fn is_repository(&self) -> bool {
        self.https.is_some() && self.ssh.is_some()
    }

    /// Pick the URL for a particular transport.
    pub fn get(&self, protocol: Protocol) -> Option<&str> {
        let url = match protocol {
            Protocol::Https => self.https.as_ref(),
            Protocol::Ssh => self.ssh.as_ref(),
        };

        url.map(|s| s.as_str()).filter(|s| !s.is_empty())
    }
}

/// Derives clone URLs and Tower application URLs for one hosting service.
#[derive(Debug, Clone, PartialEq)]
pub struct CloneUrlDeriver {
    host: String,
    scheme: String,
}

impl CloneUrlDeriver {
    pub fn new<H, S>(host: H, scheme: S) -> CloneUrlDeriver
    where
        H: Into<String>,
        S: Into<String>,
    {
        CloneUrlDeriver {
            host: host.into(),
            scheme: scheme.into(),
        }
    }

    pub fn from_config(cfg: &General) -> CloneUrlDeriver {
        CloneUrlDeriver::new(cfg.host.clone(), cfg.scheme.clone())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Find the repository a page belongs to, if any.
    ///
    /// The URL must mention our host and be parseable, and its path must
    /// start with `/<owner>/<name>`. Anything after the name is ignored.
    pub fn repository(&self, page_url: &str) -> Option<RepositoryIdentity> {
        if page_url.is_empty() || !page_url.contains(self.host.as_str()) {
            return None;
        }

        let parsed = match Url::parse(page_url) {
            Ok(u) => u,
            Err(e) => {
                trace!("Ignoring unparseable page URL {:?}, {}", page_url, e);
                return None;
            }
        };

        let caps = REPO_PATH.captures(parsed.path())?;

        Some(RepositoryIdentity {
            owner: caps[1].to_string(),
            name: caps[2].to_string(),
        })
    }

    pub fn clone_urls(&self, page_url: &str) -> CloneUrls {
        match self.repository(page_url) {
            Some(repo) => {
                trace!("{:?} belongs to {}", page_url, repo.full_name());
                CloneUrls::for_repository(&repo, &self.host)
            }
            None => CloneUrls::none(),
        }
    }

    /// Wrap a clone URL in the application's `openRepo` URL.
    ///
    /// The whole clone URL is percent-encoded so it travels as a single path
    /// segment. Returns `None` for an empty clone URL.
    pub fn application_url(&self, clone_url: &str) -> Option<String> {
        if clone_url.is_empty() {
            return None;
        }

        Some(format!(
            "{}://openRepo/{}",
            self.scheme,
            urlencoding::encode(clone_url)
        ))
    }

    /// The application URL for a page, using the clone URL for `protocol`.
    pub fn application_url_for_page(&self, page_url: &str, protocol: Protocol) -> Option<String> {
        let urls = self.clone_urls(page_url);

        if urls.https.is_none() && urls.ssh.is_none() {
            return None;
        }

        urls.get(protocol).and_then(|url| self.application_url(url))
    }
}

impl Default for CloneUrlDeriver {
    fn default() -> CloneUrlDeriver {
        CloneUrlDeriver::new(DEFAULT_HOST, DEFAULT_SCHEME)
    }
}

/// Get the clone URLs for a page on `github.com`.
pub fn clone_urls(page_url: &str) -> CloneUrls {
    GITHUB.clone_urls(page_url)
}

/// Get the `gittower://` URL which opens `clone_url` in Tower.
pub fn application_url(clone_url: &str) -> Option<String> {
    GITHUB.application_url(clone_url)
}
