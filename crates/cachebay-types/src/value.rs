//! Field values and records stored by the flat cache.
//!
//! Scalars carry genuinely schema-free JSON (arbitrary response payloads),
//! so they're represented with `serde_json::Value` rather than a
//! `facet`-derived type — see `SPEC_FULL.md` §3 for why this departs from
//! the teacher's `facet_value::Value` convention.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::RecordId;

/// A single field's value inside a [`Record`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum FieldValue {
    /// A scalar or arbitrary non-entity JSON blob.
    Scalar(Json),
    /// A single link to another record (`{__ref: recordId}`).
    Ref(RecordId),
    /// An ordered list of links (`{__refs: [recordId, ...]}`).
    Refs(Vec<RecordId>),
    /// Inline (non-identifiable) nested storage.
    Inline(Record),
}

impl FieldValue {
    pub fn as_scalar(&self) -> Option<&Json> {
        match self {
            FieldValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<&RecordId> {
        match self {
            FieldValue::Ref(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_refs(&self) -> Option<&[RecordId]> {
        match self {
            FieldValue::Refs(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn as_inline(&self) -> Option<&Record> {
        match self {
            FieldValue::Inline(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_null_scalar(&self) -> bool {
        matches!(self, FieldValue::Scalar(Json::Null))
    }
}

/// A flat, unordered field map stored under a [`RecordId`].
///
/// `BTreeMap` keeps field iteration deterministic, which matters for
/// dehydrate/hydrate byte-stability (I1-I5 in `spec.md` §3) and for
/// reproducible test fixtures.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.fields.insert(key.into(), value);
    }

    /// Merges `patch` into `self` in place, reporting whether any field's
    /// content actually changed (I1/I3: no-op writes must not bump the
    /// record's version). `undefined`-shaped entries (represented by the
    /// caller simply omitting the key) must never reach here; an explicit
    /// JSON `null` is a real value and is written as such.
    pub fn merge(&mut self, patch: Record) -> bool {
        let mut changed = false;
        for (key, new_value) in patch.fields {
            match self.fields.get(&key) {
                Some(existing) if fields_deep_eq(existing, &new_value) => {}
                _ => {
                    self.fields.insert(key, new_value);
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Deep equality used to decide whether a `put` is a no-op (I1, I3, P3).
pub fn fields_deep_eq(a: &FieldValue, b: &FieldValue) -> bool {
    match (a, b) {
        (FieldValue::Scalar(x), FieldValue::Scalar(y)) => x == y,
        (FieldValue::Ref(x), FieldValue::Ref(y)) => x == y,
        (FieldValue::Refs(x), FieldValue::Refs(y)) => x == y,
        (FieldValue::Inline(x), FieldValue::Inline(y)) => x == y,
        _ => false,
    }
}
