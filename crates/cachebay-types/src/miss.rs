//! Cache-miss taxonomy produced by the Materializer (`spec.md` §7).
//!
//! These are semantic error kinds, not Rust error types in the
//! `std::error::Error` sense: a miss doesn't abort a read, it's
//! accumulated alongside a partial result (missing scalars become `null`
//! in the output) and only flips `source = "none"` when the chosen mode
//! can't satisfy the request at all.

use crate::RecordId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheMiss {
    EntityMissing { record_id: RecordId },
    RootLinkMissing { field_key: String },
    FieldLinkMissing { record_id: RecordId, field_key: String },
    ConnectionMissing {
        canonical_present: bool,
        page_present: bool,
    },
    PageInfoMissing { page_key: RecordId },
    EdgeNodeMissing { edge_id: RecordId },
    ScalarMissing { record_id: RecordId, field_key: String },
}

/// Collects [`CacheMiss`]es during one materialization pass.
///
/// Gated by the `diagnostics` feature, mirroring the teacher's own
/// `enabled`/`disabled` module split (`peeps/src/{enabled,disabled}.rs`):
/// with `diagnostics` on, every miss is recorded and surfaced in dev
/// tooling; with it off, the collector compiles down to a zero-sized
/// no-op so release builds pay nothing for bookkeeping nobody reads.
pub trait MissSink {
    fn record(&mut self, miss: CacheMiss);
    fn into_misses(self) -> Vec<CacheMiss>;
}

#[cfg(feature = "diagnostics")]
pub use enabled::Misses;
#[cfg(not(feature = "diagnostics"))]
pub use disabled::Misses;

#[cfg(feature = "diagnostics")]
mod enabled {
    use super::{CacheMiss, MissSink};

    #[derive(Default)]
    pub struct Misses(Vec<CacheMiss>);

    impl MissSink for Misses {
        fn record(&mut self, miss: CacheMiss) {
            self.0.push(miss);
        }

        fn into_misses(self) -> Vec<CacheMiss> {
            self.0
        }
    }
}

#[cfg(not(feature = "diagnostics"))]
mod disabled {
    use super::{CacheMiss, MissSink};

    #[derive(Default)]
    pub struct Misses;

    impl MissSink for Misses {
        #[inline(always)]
        fn record(&mut self, _miss: CacheMiss) {}

        fn into_misses(self) -> Vec<CacheMiss> {
            Vec::new()
        }
    }
}
