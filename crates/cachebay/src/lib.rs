//! cachebay: a client-side normalized cache engine for responses from a
//! typed, selection-based query language.
//!
//! The engine is organized the way `spec.md` §4 lays it out: a flat
//! [`store::Store`] of versioned records; a [`normalizer`] that writes a
//! response tree into it; [`canonical`] connection merging on top of the
//! pages the normalizer collects; a [`materializer::Materializer`] that
//! reads the store back into a response tree with structural recycling
//! ([`materialized`]); [`optimistic`] layered overlays; and
//! [`watchers`]/[`client`] tying the whole thing into the public API a
//! caller actually drives.

mod canonical;
mod config;
mod error;
mod keys;
mod materialized;
mod materializer;
mod normalizer;
mod optimistic;
mod scheduler;
mod store;
mod watchers;

mod client;

pub use cachebay_types::{
    CacheMiss, CachePolicy, ConnectionMode, Fingerprint, IdentityConfig, InterfaceRegistry, KeyFn,
    Mode, OperationKind, OperationRootKind, Plan, PageInfo, Record, RecordId, Selection,
    SelectionField, Signature, Source, Variables, VariablesKey,
};

pub use client::{Client, Disposable, QueryHandle, WatchHandle};
pub use config::{CachebayConfig, Transport, TransportRequest, TransportResponse};
pub use error::{ConfigurationError, TransportError};
pub use materialized::{FingerprintTree, MaterializedArray, MaterializedObject, MaterializedValue};
pub use materializer::{MaterializeOptions, MaterializeResult, Outcome};
pub use optimistic::{Anchor, LayerId, Modification, Optimistic, Phase, ReplayHint, WriteMode};
pub use scheduler::{immediate, Scheduler};
pub use store::{Store, StoreInspection};

#[cfg(not(target_arch = "wasm32"))]
pub use scheduler::tokio_scheduler;

#[cfg(target_arch = "wasm32")]
pub use scheduler::wasm_scheduler;
