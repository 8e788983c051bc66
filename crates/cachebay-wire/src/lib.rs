//! Wire protocol types for cachebay: the portable dehydrate/hydrate
//! snapshot codec (`spec.md` §6, §9).

mod snapshot;

pub use snapshot::{
    dehydrate, hydrate, record_from_wire, record_to_wire, DehydrateError, WireCursorEntry,
    WireEdgeCounter, WireField, WireFieldValue, WireRecord, WireSnapshot,
};
