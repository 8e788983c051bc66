//! Stable identifiers for records in the flat store.
//!
//! Mirrors the teacher's `peeps_types::new_model::EntityId(CompactString)`
//! newtype: record ids are short-lived, compared constantly (map lookups,
//! dedup, sorting for deterministic snapshots) and usually small enough to
//! live inline, so `CompactString` avoids an allocation for the common case
//! (`Typename:short-id`) while still falling back to the heap for long
//! synthetic paths.

use std::fmt;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// The synthetic root id for queries (`@`).
pub const ROOT: &str = "@";

/// A stable identifier for a record in the [`Store`](crate::Record).
///
/// See `spec.md` §3 for the full grammar:
/// - `@` — the synthetic query root.
/// - `@mutation.<op>` / `@subscription.<op>` — synthetic operation roots.
/// - `<Typename>:<id>` — an identified entity.
/// - `<parent>.<fieldKey>` — an inline container under a parent.
/// - `<pageKey>.edges.<n>` — a synthetic edge under a page.
/// - `<pageKey>.pageInfo` — a synthetic PageInfo under a page.
/// - `@connection.[<parent>.]<key>(<identityJson>)` — a canonical connection.
/// - `<canonicalKey>::cursorIndex` / `<canonicalKey>::edgeCounter` — sidecars.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(CompactString);

impl RecordId {
    pub fn root() -> Self {
        Self(CompactString::from(ROOT))
    }

    pub fn operation_root(kind: OperationRootKind, op_name: &str) -> Self {
        let prefix = match kind {
            OperationRootKind::Mutation => "@mutation.",
            OperationRootKind::Subscription => "@subscription.",
        };
        Self(compact_str::format_compact!("{prefix}{op_name}"))
    }

    pub fn entity(typename: &str, id: &str) -> Self {
        Self(compact_str::format_compact!("{typename}:{id}"))
    }

    pub fn inline(parent: &RecordId, field_key: &str) -> Self {
        Self(compact_str::format_compact!("{}.{}", parent.0, field_key))
    }

    pub fn edge(page_key: &RecordId, index: usize) -> Self {
        Self(compact_str::format_compact!("{}.edges.{}", page_key.0, index))
    }

    pub fn page_info(page_key: &RecordId) -> Self {
        Self(compact_str::format_compact!("{}.pageInfo", page_key.0))
    }

    pub fn page(parent: &RecordId, field_name: &str, stringified_args: &str) -> Self {
        if parent.is_root() {
            Self(compact_str::format_compact!(
                "{}.{}({})",
                ROOT,
                field_name,
                stringified_args
            ))
        } else {
            Self(compact_str::format_compact!(
                "{}.{}({})",
                parent.0,
                field_name,
                stringified_args
            ))
        }
    }

    pub fn canonical(
        parent: Option<&RecordId>,
        connection_key: &str,
        stringified_filters: &str,
    ) -> Self {
        match parent {
            Some(parent) if !parent.is_root() => Self(compact_str::format_compact!(
                "@connection.{}.{}({})",
                parent.0,
                connection_key,
                stringified_filters
            )),
            _ => Self(compact_str::format_compact!(
                "@connection.{}({})",
                connection_key,
                stringified_filters
            )),
        }
    }

    pub fn cursor_index_sidecar(canonical_key: &RecordId) -> Self {
        Self(compact_str::format_compact!("{}::cursorIndex", canonical_key.0))
    }

    pub fn edge_counter_sidecar(canonical_key: &RecordId) -> Self {
        Self(compact_str::format_compact!("{}::edgeCounter", canonical_key.0))
    }

    /// Root field sentinel used for dependency tracking (`@.<fieldKey>`), see I7.
    pub fn root_field_sentinel(field_key: &str) -> Self {
        Self(compact_str::format_compact!("{}.{}", ROOT, field_key))
    }

    pub fn is_root(&self) -> bool {
        self.0.as_str() == ROOT
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OperationRootKind {
    Mutation,
    Subscription,
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(CompactString::from(value))
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(CompactString::from(value))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({:?})", self.0.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_format() {
        let id = RecordId::entity("User", "u1");
        assert_eq!(id.as_str(), "User:u1");
    }

    #[test]
    fn root_is_at_sign() {
        assert_eq!(RecordId::root().as_str(), "@");
        assert!(RecordId::root().is_root());
    }

    #[test]
    fn page_key_under_root_has_no_double_dot() {
        let key = RecordId::page(&RecordId::root(), "users", "{}");
        assert_eq!(key.as_str(), "@.users({})");
    }

    #[test]
    fn page_key_under_entity_includes_parent() {
        let parent = RecordId::entity("User", "u1");
        let key = RecordId::page(&parent, "posts", r#"{"first":10}"#);
        assert_eq!(key.as_str(), r#"User:u1.posts({"first":10})"#);
    }

    #[test]
    fn canonical_key_root_vs_nested() {
        let root_key = RecordId::canonical(None, "users", "{}");
        assert_eq!(root_key.as_str(), "@connection.users({})");

        let parent = RecordId::entity("User", "u1");
        let nested_key = RecordId::canonical(Some(&parent), "posts", "{}");
        assert_eq!(nested_key.as_str(), "@connection.User:u1.posts({})");
    }

    #[test]
    fn sidecars() {
        let canon = RecordId::canonical(None, "users", "{}");
        assert_eq!(
            RecordId::cursor_index_sidecar(&canon).as_str(),
            "@connection.users({})::cursorIndex"
        );
        assert_eq!(
            RecordId::edge_counter_sidecar(&canon).as_str(),
            "@connection.users({})::edgeCounter"
        );
    }
}
