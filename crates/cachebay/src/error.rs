//! `ConfigurationError` and `TransportError` (`spec.md` §7).
//!
//! Hand-rolled enums implementing `Display`/`std::error::Error`: no
//! `thiserror`/`anyhow` dependency anywhere in this workspace, errors are
//! either plain enums or `Result<_, String>`. `CacheMiss` (the third
//! taxonomy member) lives in `cachebay-types::miss` since it's a semantic
//! read outcome, not an `Error` type a caller would propagate with `?`.

use std::fmt;

/// Raised synchronously from `Client::new` when the supplied
/// configuration can't be accepted (`spec.md` §7 "raised synchronously
/// when creating the engine with an invalid transport or an unknown cache
/// policy").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    MissingTransport,
    UnknownCachePolicy { policy: String },
    InvalidSuspensionTimeout,
    StorageUnavailable { reason: String },
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::MissingTransport => {
                write!(f, "cachebay configuration requires a transport")
            }
            ConfigurationError::UnknownCachePolicy { policy } => {
                write!(f, "unknown cache policy: {policy}")
            }
            ConfigurationError::InvalidSuspensionTimeout => {
                write!(f, "suspension timeout must be a positive duration")
            }
            ConfigurationError::StorageUnavailable { reason } => {
                write!(f, "storage backend unavailable: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// Surfaced to `onError` of watchers matching a signature (`spec.md` §7);
/// never invalidates the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    Http { status: Option<u16>, message: String },
    Network { message: String },
    Decode { message: String },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Http { status, message } => match status {
                Some(status) => write!(f, "transport http error ({status}): {message}"),
                None => write!(f, "transport http error: {message}"),
            },
            TransportError::Network { message } => write!(f, "transport network error: {message}"),
            TransportError::Decode { message } => write!(f, "transport decode error: {message}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    /// Serializes to the `Json` shape handed to a watcher's `onError`
    /// (`spec.md` §6), which stays untyped like the rest of the watcher
    /// callback surface so `cache-miss` and transport errors can share one
    /// channel.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TransportError::Http { status, message } => {
                serde_json::json!({"kind": "transport-http", "status": status, "message": message})
            }
            TransportError::Network { message } => {
                serde_json::json!({"kind": "transport-network", "message": message})
            }
            TransportError::Decode { message } => {
                serde_json::json!({"kind": "transport-decode", "message": message})
            }
        }
    }
}
