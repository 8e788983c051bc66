//! The `Plan` contract consumed from the (out-of-scope) query compiler.
//!
//! `spec.md` §1 explicitly treats the plan/document compiler as an
//! external collaborator: "the core assumes a `Plan` object is supplied
//! ... it does not define their internals." This module is therefore not
//! a compiler — it's the *shape* the core needs a compiled plan to have,
//! so `Normalizer`/`Materializer`/`Canonical` can walk it without knowing
//! anything about the source query language. `buildArgs`/`stringifyArgs`
//! are "pre-bound argument builders" per `spec.md` §1, which is why they
//! are represented as closures rather than data: the compiler is expected
//! to have already partially applied per-field argument ASTs into plain
//! functions of `variables`.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as Json};

use crate::{ConnectionMode, RecordId, Signature, VariablesKey};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// Raw GraphQL-ish variables supplied by the caller for one operation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Variables(pub JsonMap<String, Json>);

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Json> {
        self.0.get(key)
    }
}

/// Connection-specific metadata attached to a [`SelectionField`] whose
/// selection is marked `isConnection` (`spec.md` §4.4).
#[derive(Clone)]
pub struct ConnectionMeta {
    /// The connection's identity key, excluding pagination args
    /// (`spec.md` §4.3 "Keying").
    pub connection_key: String,
    /// Explicit filter-argument allowlist from the plan; when `None`, the
    /// default rule (every argument except the pagination ones) applies.
    pub connection_filters: Option<Vec<String>>,
    pub connection_mode: ConnectionMode,
}

/// One selected field within a [`Selection`].
#[derive(Clone)]
pub struct SelectionField {
    /// The key this field's value is written under in the response tree
    /// (alias if present, else field name).
    pub response_key: String,
    pub field_name: String,
    /// Present on fragment-spread fields: the concrete/interface typename
    /// this selection only applies under (`spec.md` §4.1, §6 S6).
    pub type_condition: Option<String>,
    pub build_args: Arc<dyn Fn(&Variables) -> JsonMap<String, Json> + Send + Sync>,
    pub stringify_args: Arc<dyn Fn(&Variables) -> String + Send + Sync>,
    /// `None` for a plain scalar field.
    pub selection: Option<Selection>,
    /// `Some` when this field's selection is marked as a connection.
    pub connection: Option<ConnectionMeta>,
}

impl SelectionField {
    pub fn is_connection(&self) -> bool {
        self.connection.is_some()
    }
}

pub type Selection = Vec<SelectionField>;

/// The compiled plan contract. `spec.md` §6: "plan-level `makeSignature`,
/// `makeVarsKey`, `getDependencies`."
pub trait Plan: Send + Sync {
    fn operation(&self) -> OperationKind;
    fn operation_name(&self) -> &str;
    fn root(&self) -> &Selection;

    /// Deterministic string identifying a `(plan, variables, mode)` tuple,
    /// used to fan out network results to watchers (`spec.md` GLOSSARY
    /// "Signature").
    fn make_signature(&self, is_canonical: bool, variables: &Variables) -> Signature;

    /// Cache key for the Materializer's per-plan result cache. Strict mode
    /// includes all arguments; canonical mode excludes pagination
    /// arguments (`spec.md` §4.5 "Cache keying").
    fn make_vars_key(&self, is_canonical: bool, variables: &Variables) -> VariablesKey;

    /// Precomputed dependency closure for this plan at these variables,
    /// used by watchers before a first materialization has happened
    /// (optional fast path; the Materializer also computes dependencies
    /// directly from what it touches, per I7).
    fn get_dependencies(&self, is_canonical: bool, variables: &Variables) -> HashSet<RecordId>;
}

/// Arguments pagination excludes by default when deriving a connection's
/// filter identity (`spec.md` §4.3 "Keying").
pub const DEFAULT_PAGINATION_ARGS: &[&str] =
    &["first", "last", "after", "before", "offset", "limit", "page", "cursor"];
