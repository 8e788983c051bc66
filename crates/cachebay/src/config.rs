//! `CachebayConfig`: the enumerated configuration surface from `spec.md`
//! §6, collected into a plain struct validated synchronously at
//! `Client::new` (`SPEC_FULL.md` §6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cachebay_types::{CachePolicy, KeyFn};

use crate::error::ConfigurationError;

/// Host-supplied network fetchers (`spec.md` §6 `transport: {http: fn, ws?: fn}`).
#[derive(Clone)]
pub struct Transport {
    pub http: Arc<dyn Fn(TransportRequest) -> TransportResponse + Send + Sync>,
    pub ws: Option<Arc<dyn Fn(TransportRequest) -> TransportResponse + Send + Sync>>,
}

/// An outgoing operation handed to the transport; deliberately opaque
/// (`spec.md` §1 treats the transport layer as an external collaborator).
#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub operation_name: String,
    pub document: String,
    pub variables: serde_json::Map<String, serde_json::Value>,
}

/// The transport's synchronous acknowledgement that a request was
/// accepted; the actual response arrives later through the normal
/// normalize-and-notify path, matching `spec.md` §1's "does not define
/// their internals."
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub accepted: bool,
}

#[cfg(feature = "storage")]
pub type StorageFactoryHandle = Arc<dyn cachebay_storage::StorageFactory>;

/// Engine-wide configuration (`spec.md` §6 "Configuration (enumerated)").
#[derive(Clone)]
pub struct CachebayConfig {
    pub keys: HashMap<String, KeyFn>,
    pub interfaces: HashMap<String, Vec<String>>,
    pub cache_policy: CachePolicy,
    pub suspension_timeout: Duration,
    pub hydration_timeout: Duration,
    pub transport: Option<Transport>,
    #[cfg(feature = "storage")]
    pub storage: Option<StorageFactoryHandle>,
}

impl CachebayConfig {
    pub fn new(transport: Transport) -> Self {
        Self {
            keys: HashMap::new(),
            interfaces: HashMap::new(),
            cache_policy: CachePolicy::CacheFirst,
            suspension_timeout: Duration::from_millis(30_000),
            hydration_timeout: Duration::from_millis(0),
            transport: Some(transport),
            #[cfg(feature = "storage")]
            storage: None,
        }
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn with_suspension_timeout(mut self, timeout: Duration) -> Self {
        self.suspension_timeout = timeout;
        self
    }

    pub fn with_hydration_timeout(mut self, timeout: Duration) -> Self {
        self.hydration_timeout = timeout;
        self
    }

    pub fn with_key(mut self, typename: impl Into<String>, keyer: KeyFn) -> Self {
        self.keys.insert(typename.into(), keyer);
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>, implementers: &[&str]) -> Self {
        self.interfaces.insert(
            interface.into(),
            implementers.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    #[cfg(feature = "storage")]
    pub fn with_storage(mut self, storage: StorageFactoryHandle) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validates the configuration synchronously, the way `Client::new`
    /// must (`spec.md` §7 "raised synchronously when creating the engine
    /// with an invalid transport or an unknown cache policy").
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.transport.is_none() {
            return Err(ConfigurationError::MissingTransport);
        }
        if self.suspension_timeout.is_zero() {
            return Err(ConfigurationError::InvalidSuspensionTimeout);
        }
        Ok(())
    }
}
