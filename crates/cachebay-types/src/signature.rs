//! Signature and variables-key newtypes.
//!
//! A `Signature` identifies a `(plan, variables, mode)` tuple for network
//! fan-out (`spec.md` §4.7, GLOSSARY); a `VariablesKey` identifies the same
//! tuple for the Materializer's result cache (`spec.md` §4.5). Both are
//! opaque strings produced by the compiled `Plan` (`makeSignature`,
//! `makeVarsKey`) — cachebay never constructs one itself, it only compares
//! and indexes by them.

use std::fmt;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(String);

impl Signature {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({:?})", self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariablesKey(String);

impl VariablesKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VariablesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VariablesKey({:?})", self.0)
    }
}

/// Materializer read/result mode (`spec.md` §4.5).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    Canonical,
    Strict,
}

/// Where a materialized result came from (`spec.md` §4.5 `source`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Source {
    Canonical,
    Strict,
    None,
}

/// Connection paging classification (`spec.md` §4.3 step 1, GLOSSARY).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageClass {
    Leader,
    Forward,
    Backward,
}

/// How a canonical connection accumulates pages (`spec.md` §4.3 step 2,
/// §9 open question (a)). Callers must mark this explicitly on the
/// `Plan`'s connection metadata; there is no implicit inference.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnectionMode {
    /// Each page replaces the canonical connection wholesale.
    Page,
    /// Pages splice into a single accumulated canonical connection
    /// (the common "infinite scroll" case).
    Infinite,
}

/// cachePolicy (`spec.md` §6).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CachePolicy {
    CacheAndNetwork,
    NetworkOnly,
    CacheFirst,
    CacheOnly,
}
