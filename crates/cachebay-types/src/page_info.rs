//! PageInfo: the boundary descriptor for a canonical connection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Boundary fields plus arbitrary user extras, per `spec.md` I5.
///
/// `has_previous_page`/`start_cursor` are only authoritative at the head of
/// a canonical connection; `has_next_page`/`end_cursor` only at the tail.
/// Writes outside that position must leave the corresponding field
/// untouched, which is why `Canonical` never constructs one of these
/// directly from an incoming page without consulting `prefix`/`suffix`
/// emptiness first (see `cachebay::canonical`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub has_previous_page: Option<bool>,
    pub has_next_page: Option<bool>,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
    pub extras: BTreeMap<String, Json>,
}

impl PageInfo {
    pub fn new() -> Self {
        Self::default()
    }
}
