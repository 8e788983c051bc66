//! Portable dehydrate/hydrate snapshot format (`spec.md` §6 "Persistent
//! snapshot format", §9 "Cursor index & edge counter sidecars").
//!
//! Every field here is a fixed, known shape, so (unlike
//! `cachebay_types::Record`) these types derive `facet::Facet` directly
//! and serialize through `facet-json` — the same split the teacher draws
//! between `moire-types`/`moire-wire` (facet-derived, fixed shape) and
//! `moire-web` (plain `serde_json` for schema-free API bodies). The one
//! genuinely schema-free piece, a record's scalar JSON, is carried as a
//! pre-serialized JSON text column, mirroring `moire-sqlite-facet`'s
//! `body_json`/`kind_json` text-column convention.

use facet::Facet;

use cachebay_types::{FieldValue, RecordId, Record};

#[derive(Facet, Debug, Clone)]
pub struct WireSnapshot {
    pub records: Vec<WireRecord>,
    /// Cursor-index sidecars: `(canonicalKey, cursor, position)` triples,
    /// flattened rather than nested so the format stays append-friendly
    /// for journaling.
    pub cursor_index_entries: Vec<WireCursorEntry>,
    /// Edge-counter sidecars: `(canonicalKey, nextIndex)` pairs.
    pub edge_counters: Vec<WireEdgeCounter>,
}

#[derive(Facet, Debug, Clone)]
pub struct WireRecord {
    pub id: String,
    pub version: u64,
    pub fields: Vec<WireField>,
}

#[derive(Facet, Debug, Clone)]
pub struct WireField {
    pub key: String,
    pub value: WireFieldValue,
}

#[derive(Facet, Debug, Clone)]
#[repr(u8)]
pub enum WireFieldValue {
    /// Pre-serialized JSON text for a scalar / opaque value.
    Scalar(String),
    Ref(String),
    Refs(Vec<String>),
    Inline(Vec<WireField>),
}

#[derive(Facet, Debug, Clone)]
pub struct WireCursorEntry {
    pub canonical_key: String,
    pub cursor: String,
    pub position: u64,
}

#[derive(Facet, Debug, Clone)]
pub struct WireEdgeCounter {
    pub canonical_key: String,
    pub next_index: u64,
}

#[derive(Debug)]
pub struct DehydrateError(pub String);

impl std::fmt::Display for DehydrateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dehydrate/hydrate error: {}", self.0)
    }
}

impl std::error::Error for DehydrateError {}

pub fn record_to_wire(id: &RecordId, version: u64, record: &Record) -> Result<WireRecord, DehydrateError> {
    let mut fields = Vec::with_capacity(record.fields.len());
    for (key, value) in &record.fields {
        fields.push(WireField {
            key: key.clone(),
            value: field_value_to_wire(value)?,
        });
    }
    Ok(WireRecord {
        id: id.as_str().to_string(),
        version,
        fields,
    })
}

fn field_value_to_wire(value: &FieldValue) -> Result<WireFieldValue, DehydrateError> {
    Ok(match value {
        FieldValue::Scalar(json) => {
            WireFieldValue::Scalar(serde_json::to_string(json).map_err(|e| DehydrateError(e.to_string()))?)
        }
        FieldValue::Ref(id) => WireFieldValue::Ref(id.as_str().to_string()),
        FieldValue::Refs(ids) => WireFieldValue::Refs(ids.iter().map(|id| id.as_str().to_string()).collect()),
        FieldValue::Inline(record) => {
            let mut fields = Vec::with_capacity(record.fields.len());
            for (key, value) in &record.fields {
                fields.push(WireField {
                    key: key.clone(),
                    value: field_value_to_wire(value)?,
                });
            }
            WireFieldValue::Inline(fields)
        }
    })
}

pub fn record_from_wire(wire: &WireRecord) -> Result<(RecordId, u64, Record), DehydrateError> {
    let mut record = Record::new();
    for field in &wire.fields {
        record.insert(field.key.clone(), field_value_from_wire(&field.value)?);
    }
    Ok((RecordId::from(wire.id.clone()), wire.version, record))
}

fn field_value_from_wire(value: &WireFieldValue) -> Result<FieldValue, DehydrateError> {
    Ok(match value {
        WireFieldValue::Scalar(json_text) => {
            FieldValue::Scalar(serde_json::from_str(json_text).map_err(|e| DehydrateError(e.to_string()))?)
        }
        WireFieldValue::Ref(id) => FieldValue::Ref(RecordId::from(id.clone())),
        WireFieldValue::Refs(ids) => {
            FieldValue::Refs(ids.iter().map(|id| RecordId::from(id.clone())).collect())
        }
        WireFieldValue::Inline(fields) => {
            let mut record = Record::new();
            for field in fields {
                record.insert(field.key.clone(), field_value_from_wire(&field.value)?);
            }
            FieldValue::Inline(record)
        }
    })
}

/// Serializes a [`WireSnapshot`] to its canonical `facet-json` text form.
/// Round-trips byte-exactly through [`hydrate`] (`spec.md` §6).
pub fn dehydrate(snapshot: &WireSnapshot) -> Result<String, DehydrateError> {
    facet_json::to_string(snapshot).map_err(|e| DehydrateError(e.to_string()))
}

pub fn hydrate(text: &str) -> Result<WireSnapshot, DehydrateError> {
    facet_json::from_str(text).map_err(|e| DehydrateError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachebay_types::FieldValue;
    use serde_json::json;

    #[test]
    fn record_round_trips_through_wire() {
        let mut record = Record::new();
        record.insert("email", FieldValue::Scalar(json!("a@x")));
        record.insert("best_friend", FieldValue::Ref(RecordId::entity("User", "u2")));

        let id = RecordId::entity("User", "u1");
        let wire = record_to_wire(&id, 3, &record).unwrap();
        let (back_id, back_version, back_record) = record_from_wire(&wire).unwrap();

        assert_eq!(back_id, id);
        assert_eq!(back_version, 3);
        assert_eq!(back_record, record);
    }

    #[test]
    fn snapshot_dehydrate_hydrate_round_trip() {
        let mut record = Record::new();
        record.insert("name", FieldValue::Scalar(json!("Ada")));
        let id = RecordId::entity("User", "u1");
        let wire_record = record_to_wire(&id, 1, &record).unwrap();

        let snapshot = WireSnapshot {
            records: vec![wire_record],
            cursor_index_entries: vec![WireCursorEntry {
                canonical_key: "@connection.users({})".into(),
                cursor: "c1".into(),
                position: 0,
            }],
            edge_counters: vec![WireEdgeCounter {
                canonical_key: "@connection.users({})".into(),
                next_index: 1,
            }],
        };

        let text = dehydrate(&snapshot).unwrap();
        let back = hydrate(&text).unwrap();

        assert_eq!(back.records.len(), 1);
        assert_eq!(back.cursor_index_entries.len(), 1);
        assert_eq!(back.edge_counters[0].next_index, 1);
    }
}
