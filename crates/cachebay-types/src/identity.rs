//! Identity resolution: deriving a stable [`RecordId`] from a response
//! value, per `spec.md` §4.1.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value as Json;

use crate::RecordId;

/// A per-typename function that picks a stable id string out of a decoded
/// object, or returns `None` to fall back to the value's own `id` field
/// (and ultimately to "no identity" — `spec.md` §9 open question (c)).
pub type KeyFn = Arc<dyn Fn(&Json) -> Option<String> + Send + Sync>;

/// Interface name → set of implementer typenames, used by the Materializer
/// to decide whether a type-conditioned selection applies at runtime
/// (`spec.md` §4.1, §6 "interfaces").
#[derive(Clone, Default)]
pub struct InterfaceRegistry {
    implementers: HashMap<String, HashSet<String>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, interface: impl Into<String>, implementer_types: &[&str]) {
        let entry = self.implementers.entry(interface.into()).or_default();
        entry.extend(implementer_types.iter().map(|s| s.to_string()));
    }

    /// Returns the implementer set for `interface`, or an empty set if the
    /// interface is unknown (never `None` — callers don't need to special
    /// case unregistered interfaces).
    pub fn implementers_of(&self, interface: &str) -> &HashSet<String> {
        static EMPTY: std::sync::OnceLock<HashSet<String>> = std::sync::OnceLock::new();
        self.implementers
            .get(interface)
            .unwrap_or_else(|| EMPTY.get_or_init(HashSet::new))
    }

    /// `true` when `typename` satisfies `type_condition`, i.e. they're
    /// equal, or `type_condition` names an interface that `typename`
    /// implements.
    pub fn satisfies(&self, typename: &str, type_condition: &str) -> bool {
        typename == type_condition || self.implementers_of(type_condition).contains(typename)
    }

    /// Maps an interface typename to its canonical concrete name for a
    /// given value, if any implementer's key function resolves. Most
    /// callers just need `satisfies`; this exists for identity resolution
    /// of interface-typed fields.
    pub fn canonicalize<'a>(&self, typename: &'a str) -> &'a str {
        typename
    }
}

/// Identity configuration: per-typename key functions plus the interface
/// registry used to resolve an interface-tagged typename to its concrete
/// implementer before keying.
#[derive(Clone, Default)]
pub struct IdentityConfig {
    pub keys: HashMap<String, KeyFn>,
    pub interfaces: InterfaceRegistry,
}

impl IdentityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// `identify(value) -> recordId | null` (`spec.md` §4.1).
    ///
    /// Resolution: take the type tag; if it's an interface name, map to its
    /// canonical concrete name (a no-op in this port, since the compiled
    /// `Plan` is expected to have already resolved `__typename` to a
    /// concrete type by materialization time); pick an id via a
    /// caller-supplied keyer for that name, else the value's `id` field;
    /// return `<canonicalType>:<id>` or `None` when neither is present.
    pub fn identify(&self, value: &Json) -> Option<RecordId> {
        let typename = value.get("__typename")?.as_str()?;
        let canonical_type = self.interfaces.canonicalize(typename);

        let id = if let Some(keyer) = self.keys.get(canonical_type) {
            keyer(value)?
        } else {
            normalize_id_field(value.get("id")?)?
        };

        Some(RecordId::entity(canonical_type, &id))
    }
}

/// The Store normalizes the special `id` field to a string or `null`
/// (`spec.md` §4.2). Numbers are accepted and stringified; anything else
/// (including an explicit `null`) yields no identity.
pub fn normalize_id_field(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identify_falls_back_to_id_field() {
        let config = IdentityConfig::new();
        let value = json!({"__typename": "User", "id": "u1"});
        assert_eq!(config.identify(&value).unwrap().as_str(), "User:u1");
    }

    #[test]
    fn identify_null_when_no_id() {
        let config = IdentityConfig::new();
        let value = json!({"__typename": "User"});
        assert!(config.identify(&value).is_none());
    }

    #[test]
    fn custom_keyer_takes_priority() {
        let mut config = IdentityConfig::new();
        config.keys.insert(
            "User".into(),
            Arc::new(|v: &Json| v.get("email").and_then(|e| e.as_str()).map(str::to_string)),
        );
        let value = json!({"__typename": "User", "id": "ignored", "email": "a@x"});
        assert_eq!(config.identify(&value).unwrap().as_str(), "User:a@x");
    }

    #[test]
    fn interface_dispatch_satisfies() {
        let mut interfaces = InterfaceRegistry::new();
        interfaces.register("Post", &["AudioPost", "VideoPost"]);
        assert!(interfaces.satisfies("AudioPost", "Post"));
        assert!(!interfaces.satisfies("User", "Post"));
        assert!(interfaces.satisfies("Post", "Post"));
    }
}
