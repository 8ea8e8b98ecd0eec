//! The errors encountered in this crate.

/// Something went wrong while talking to the external key-value store.
///
/// This is `Clone` so the one settled result of the initial sync can be
/// handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Fail)]
pub enum StoreError {
    /// Reading the persisted values failed.
    #[fail(display = "Unable to read from the store: {}", _0)]
    Read(String),
    /// Persisting a value failed.
    #[fail(display = "Unable to write to the store: {}", _0)]
    Write(String),
    /// The store stopped delivering change notifications, or a background
    /// write was cancelled before it completed.
    #[fail(display = "The store is no longer available")]
    Closed,
}

/// The name given isn't a protocol we know how to clone with.
#[derive(Debug, Clone, PartialEq, Fail)]
#[fail(display = "Unknown clone protocol \"{}\" (expected \"https\" or \"ssh\")", _0)]
pub struct UnknownProtocol(pub String);
