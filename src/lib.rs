//! Open the GitHub repository you are currently looking at in [Tower].
//!
//! The crate turns a web page URL into the repository's clone URLs, picks one
//! according to the user's protocol preference and wraps it in Tower's
//! `gittower://openRepo/...` application URL.
//!
//! [Tower]: https://www.git-tower.com/

extern crate async_trait;
extern crate failure;
#[macro_use]
extern crate failure_derive;
extern crate futures;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate parking_lot;
extern crate regex;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate shellexpand;
extern crate tokio;
extern crate toml;
extern crate url;
extern crate urlencoding;

#[cfg(test)]
extern crate tempfile;

pub mod clone_url;
mod config;
pub mod dispatch;
mod errors;
pub mod settings;
pub mod store;

pub use crate::clone_url::{application_url, clone_urls, CloneUrlDeriver, CloneUrls,
                           RepositoryIdentity};
pub use crate::config::{Config, General};
pub use crate::dispatch::{Dispatcher, Opener, SystemOpener};
pub use crate::errors::{StoreError, UnknownProtocol};
pub use crate::settings::{Preference, Protocol, SettingsStore, Subscription, SyncState,
                          WriteHandle};
pub use crate::store::{Changes, JsonFileStore, KeyValueStore, MemoryStore, StorageChange};
