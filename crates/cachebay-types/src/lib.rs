//! Core data model for cachebay: record ids, records, page info,
//! fingerprints, identity resolution, and the `Plan` contract consumed
//! from the (external) query compiler.
//!
//! No I/O lives here — this crate is the vocabulary `cachebay-wire`,
//! `cachebay-storage`, and `cachebay` itself are built from.

mod fingerprint;
mod identity;
mod miss;
mod page_info;
mod plan;
mod record_id;
mod signature;
mod value;

pub use fingerprint::{mix, mix_scalar, Fingerprint};
pub use identity::{normalize_id_field, IdentityConfig, InterfaceRegistry, KeyFn};
pub use miss::{CacheMiss, MissSink, Misses};
pub use page_info::PageInfo;
pub use plan::{
    ConnectionMeta, OperationKind, Plan, Selection, SelectionField, Variables,
    DEFAULT_PAGINATION_ARGS,
};
pub use record_id::{OperationRootKind, RecordId, ROOT};
pub use signature::{CachePolicy, ConnectionMode, Mode, PageClass, Signature, Source, VariablesKey};
pub use value::{fields_deep_eq, FieldValue, Record};
