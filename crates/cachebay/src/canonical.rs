//! Canonical connection merging (`spec.md` §4.3).
//!
//! Consolidates the pages the Normalizer writes into a single
//! cursor-ordered, identity-keyed connection record, maintaining a
//! `cursorIndex` sidecar and applying the PageInfo boundary-authority rule
//! (boundary fields are only authoritative at the end of the connection
//! they describe). Canonical never decides *when* to replay optimistic overlays —
//! that's sequenced by whoever drives normalization (`client::ingest`),
//! per `spec.md` §4.3 step 6.

use std::collections::HashMap;

use cachebay_types::{
    ConnectionMode, FieldValue, PageClass, PageInfo, Record, RecordId, SelectionField, Variables,
    DEFAULT_PAGINATION_ARGS,
};
use serde_json::{Map as JsonMap, Value as Json};

use crate::store::Store;

/// A page the Normalizer wrote, ready to be folded into its canonical
/// connection.
#[derive(Clone)]
pub struct PageUpdate {
    pub field: SelectionField,
    pub parent_id: RecordId,
    pub variables: Variables,
    pub page_key: RecordId,
}

/// Produces `stableJson` per `spec.md` §6: canonical JSON with keys sorted
/// ascending, `{}` for an empty object.
pub fn stable_json_stringify(args: &JsonMap<String, Json>) -> String {
    if args.is_empty() {
        return "{}".to_string();
    }
    let mut keys: Vec<&String> = args.keys().collect();
    keys.sort();
    let mut out = String::from("{");
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::to_string(key).unwrap());
        out.push(':');
        out.push_str(&serde_json::to_string(&args[*key]).unwrap());
    }
    out.push('}');
    out
}

fn is_present(value: Option<&Json>) -> bool {
    matches!(value, Some(v) if !v.is_null())
}

/// Classifies a page by its pagination arguments (`spec.md` §4.3 step 1).
pub fn classify(args: &JsonMap<String, Json>) -> PageClass {
    if is_present(args.get("after")) {
        PageClass::Forward
    } else if is_present(args.get("before")) {
        PageClass::Backward
    } else {
        PageClass::Leader
    }
}

pub(crate) fn connection_filters(field: &SelectionField, args: &JsonMap<String, Json>) -> JsonMap<String, Json> {
    let meta = field.connection.as_ref().expect("connection field has ConnectionMeta");
    match &meta.connection_filters {
        Some(allow) => args
            .iter()
            .filter(|(key, _)| allow.iter().any(|a| a == *key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        None => args
            .iter()
            .filter(|(key, _)| !DEFAULT_PAGINATION_ARGS.contains(&key.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

fn page_info_from_record(record: &Record) -> PageInfo {
    let mut page_info = PageInfo::new();
    for (key, value) in &record.fields {
        let FieldValue::Scalar(json) = value else { continue };
        match key.as_str() {
            "hasPreviousPage" => page_info.has_previous_page = json.as_bool(),
            "hasNextPage" => page_info.has_next_page = json.as_bool(),
            "startCursor" => page_info.start_cursor = json.as_str().map(str::to_string),
            "endCursor" => page_info.end_cursor = json.as_str().map(str::to_string),
            other => {
                page_info.extras.insert(other.to_string(), json.clone());
            }
        }
    }
    page_info
}

fn page_info_to_record(page_info: &PageInfo) -> Record {
    let mut record = Record::new();
    if let Some(v) = page_info.has_previous_page {
        record.insert("hasPreviousPage", FieldValue::Scalar(Json::Bool(v)));
    }
    if let Some(v) = page_info.has_next_page {
        record.insert("hasNextPage", FieldValue::Scalar(Json::Bool(v)));
    }
    if let Some(v) = &page_info.start_cursor {
        record.insert("startCursor", FieldValue::Scalar(Json::String(v.clone())));
    }
    if let Some(v) = &page_info.end_cursor {
        record.insert("endCursor", FieldValue::Scalar(Json::String(v.clone())));
    }
    for (key, value) in &page_info.extras {
        record.insert(key.clone(), FieldValue::Scalar(value.clone()));
    }
    record
}

pub(crate) fn edge_cursor(store: &Store, edge_id: &RecordId) -> Option<String> {
    store
        .get(edge_id)
        .and_then(|record| record.get("cursor").and_then(FieldValue::as_scalar).cloned())
        .and_then(|json| json.as_str().map(str::to_string))
}

pub(crate) fn read_cursor_index(store: &Store, canonical_key: &RecordId) -> HashMap<String, usize> {
    let sidecar = RecordId::cursor_index_sidecar(canonical_key);
    store
        .get(&sidecar)
        .map(|record| {
            record
                .fields
                .iter()
                .filter_map(|(cursor, value)| {
                    value
                        .as_scalar()
                        .and_then(Json::as_u64)
                        .map(|pos| (cursor.clone(), pos as usize))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn write_cursor_index(store: &Store, canonical_key: &RecordId, index: &HashMap<String, usize>) {
    let mut record = Record::new();
    for (cursor, position) in index {
        record.insert(cursor.clone(), FieldValue::Scalar(Json::from(*position as u64)));
    }
    store.put(&RecordId::cursor_index_sidecar(canonical_key), record);
}

pub(crate) fn read_edge_counter(store: &Store, canonical_key: &RecordId) -> u64 {
    store
        .get(&RecordId::edge_counter_sidecar(canonical_key))
        .and_then(|record| record.get("nextIndex").and_then(FieldValue::as_scalar).cloned())
        .and_then(|json| json.as_u64())
        .unwrap_or(0)
}

pub(crate) fn write_edge_counter(store: &Store, canonical_key: &RecordId, next_index: u64) {
    let mut record = Record::new();
    record.insert("nextIndex", FieldValue::Scalar(Json::from(next_index)));
    store.put(&RecordId::edge_counter_sidecar(canonical_key), record);
}

/// Folds a connection-shaped page into its canonical record. Returns the
/// canonical key that was written, for dependency tracking and optimistic
/// replay hints.
pub fn update_connection(store: &Store, update: &PageUpdate) -> RecordId {
    let meta = update
        .field
        .connection
        .as_ref()
        .expect("update_connection called on a non-connection field");

    let args = (update.field.build_args)(&update.variables);
    let filters = connection_filters(&update.field, &args);
    let filters_json = stable_json_stringify(&filters);
    let parent_for_key = if update.parent_id.is_root() { None } else { Some(&update.parent_id) };
    let canonical_key = RecordId::canonical(parent_for_key, &meta.connection_key, &filters_json);

    let page_class = classify(&args);

    let incoming_page = store.get(&update.page_key).unwrap_or_default();
    let incoming_edges: Vec<RecordId> = incoming_page
        .get("edges")
        .and_then(FieldValue::as_refs)
        .map(|r| r.to_vec())
        .unwrap_or_default();
    let incoming_page_info = store
        .get(&RecordId::page_info(&update.page_key))
        .map(|r| page_info_from_record(&r))
        .unwrap_or_default();

    let existing_record = store.get(&canonical_key);
    let existing_edges: Vec<RecordId> = existing_record
        .as_ref()
        .and_then(|r| r.get("edges").and_then(FieldValue::as_refs).map(|r| r.to_vec()))
        .unwrap_or_default();
    let existing_page_info = existing_record
        .as_ref()
        .and_then(|r| r.get("pageInfo").and_then(FieldValue::as_ref_id))
        .and_then(|id| store.get(id))
        .map(|r| page_info_from_record(&r))
        .unwrap_or_default();

    let (merged_edges, prefix, suffix) = if meta.connection_mode == ConnectionMode::Page {
        (incoming_edges.clone(), Vec::new(), Vec::new())
    } else {
        let cursor_index = read_cursor_index(store, &canonical_key);
        splice(page_class, &existing_edges, &incoming_edges, &cursor_index, args.get("after").and_then(Json::as_str), args.get("before").and_then(Json::as_str))
    };

    let prefix_empty = prefix.is_empty();
    let suffix_empty = suffix.is_empty();
    let merged_page_info = merge_page_info(
        &existing_page_info,
        &incoming_page_info,
        &merged_edges,
        store,
        prefix_empty,
        suffix_empty,
    );

    let mut canonical_record = Record::new();
    if let Some(typename) = incoming_page.get("__typename").and_then(FieldValue::as_scalar) {
        canonical_record.insert("__typename", FieldValue::Scalar(typename.clone()));
    } else if let Some(existing) = &existing_record {
        if let Some(typename) = existing.get("__typename").and_then(FieldValue::as_scalar) {
            canonical_record.insert("__typename", FieldValue::Scalar(typename.clone()));
        }
    }
    canonical_record.insert("edges", FieldValue::Refs(merged_edges.clone()));
    let page_info_id = RecordId::page_info(&canonical_key);
    canonical_record.insert("pageInfo", FieldValue::Ref(page_info_id.clone()));
    for (key, value) in &incoming_page.fields {
        if key == "edges" || key == "pageInfo" || key == "__typename" {
            continue;
        }
        canonical_record.insert(key.clone(), value.clone());
    }

    store.put(&canonical_key, canonical_record);
    store.put(&page_info_id, page_info_to_record(&merged_page_info));

    if meta.connection_mode == ConnectionMode::Page {
        let mut rebuilt = HashMap::new();
        for (idx, edge) in merged_edges.iter().enumerate() {
            if let Some(cursor) = edge_cursor(store, edge) {
                rebuilt.insert(cursor, idx);
            }
        }
        write_cursor_index(store, &canonical_key, &rebuilt);
    } else {
        update_cursor_index(store, &canonical_key, page_class, &existing_edges, &incoming_edges, &prefix, &suffix, &merged_edges);
    }

    tracing::debug!(canonical_key = %canonical_key, edges = merged_edges.len(), "canonical: updated connection");
    canonical_key
}

/// `spec.md` §4.3 step 3: classify-driven splice producing the merged edge
/// list plus the (possibly empty) preserved prefix/suffix, which in turn
/// decide which end of the connection this page's PageInfo boundary
/// fields are allowed to overwrite.
fn splice(
    page_class: PageClass,
    existing: &[RecordId],
    incoming: &[RecordId],
    cursor_index: &HashMap<String, usize>,
    after_cursor: Option<&str>,
    before_cursor: Option<&str>,
) -> (Vec<RecordId>, Vec<RecordId>, Vec<RecordId>) {
    match page_class {
        PageClass::Leader => (incoming.to_vec(), Vec::new(), Vec::new()),
        PageClass::Forward => {
            let prefix: Vec<RecordId> = match after_cursor.and_then(|c| cursor_index.get(c)) {
                Some(&i) if i + 1 <= existing.len() => existing[..=i].to_vec(),
                _ => existing.to_vec(),
            };
            let mut merged = prefix.clone();
            merged.extend_from_slice(incoming);
            (merged, prefix, Vec::new())
        }
        PageClass::Backward => {
            let suffix: Vec<RecordId> = match before_cursor.and_then(|c| cursor_index.get(c)) {
                Some(&i) if i <= existing.len() => existing[i..].to_vec(),
                _ => existing.to_vec(),
            };
            let mut merged = incoming.to_vec();
            merged.extend_from_slice(&suffix);
            (merged, Vec::new(), suffix)
        }
    }
}

/// `spec.md` §4.3 step 5: overlay incoming non-boundary extras onto the
/// existing PageInfo, then apply boundary overrides only at the edge of
/// the connection that this page actually owns.
fn merge_page_info(
    existing: &PageInfo,
    incoming: &PageInfo,
    merged_edges: &[RecordId],
    store: &Store,
    prefix_empty: bool,
    suffix_empty: bool,
) -> PageInfo {
    let mut result = existing.clone();
    for (key, value) in &incoming.extras {
        result.extras.insert(key.clone(), value.clone());
    }

    if prefix_empty {
        result.has_previous_page = incoming.has_previous_page.or(existing.has_previous_page);
        result.start_cursor = incoming
            .start_cursor
            .clone()
            .or_else(|| merged_edges.first().and_then(|id| edge_cursor(store, id)));
    }
    if suffix_empty {
        result.has_next_page = incoming.has_next_page.or(existing.has_next_page);
        result.end_cursor = incoming
            .end_cursor
            .clone()
            .or_else(|| merged_edges.last().and_then(|id| edge_cursor(store, id)));
    }

    result
}

/// `spec.md` §4.3 step 4: incremental maintenance for the common append /
/// prepend cases, full rebuild otherwise (leader reset, or a splice that
/// truncated part of the existing list).
fn update_cursor_index(
    store: &Store,
    canonical_key: &RecordId,
    page_class: PageClass,
    existing: &[RecordId],
    incoming: &[RecordId],
    prefix: &[RecordId],
    suffix: &[RecordId],
    merged: &[RecordId],
) {
    let pure_append = page_class == PageClass::Forward && prefix.len() == existing.len();
    let pure_prepend = page_class == PageClass::Backward && suffix.len() == existing.len();

    if pure_append {
        let mut index = read_cursor_index(store, canonical_key);
        for (offset, edge) in incoming.iter().enumerate() {
            if let Some(cursor) = edge_cursor(store, edge) {
                index.insert(cursor, existing.len() + offset);
            }
        }
        write_cursor_index(store, canonical_key, &index);
        return;
    }

    if pure_prepend {
        let mut index = read_cursor_index(store, canonical_key);
        for position in index.values_mut() {
            *position += incoming.len();
        }
        for (offset, edge) in incoming.iter().enumerate() {
            if let Some(cursor) = edge_cursor(store, edge) {
                index.insert(cursor, offset);
            }
        }
        write_cursor_index(store, canonical_key, &index);
        return;
    }

    let mut rebuilt = HashMap::new();
    for (idx, edge) in merged.iter().enumerate() {
        if let Some(cursor) = edge_cursor(store, edge) {
            rebuilt.insert(cursor, idx);
        }
    }
    write_cursor_index(store, canonical_key, &rebuilt);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::immediate;
    use cachebay_types::ConnectionMeta;
    use serde_json::json;
    use std::sync::Arc;

    fn users_field(connection_mode: ConnectionMode) -> SelectionField {
        SelectionField {
            response_key: "users".into(),
            field_name: "users".into(),
            type_condition: None,
            build_args: Arc::new(|vars: &Variables| vars.0.clone()),
            stringify_args: Arc::new(|_vars| "{}".into()),
            selection: None,
            connection: Some(ConnectionMeta {
                connection_key: "users".into(),
                connection_filters: None,
                connection_mode,
            }),
        }
    }

    fn write_page(
        store: &Store,
        page_key: &RecordId,
        edge_titles: &[(&str, &str)],
        has_next: Option<bool>,
        has_prev: Option<bool>,
    ) {
        let mut edges = Vec::new();
        for (i, (id, cursor)) in edge_titles.iter().enumerate() {
            let edge_id = RecordId::edge(page_key, i);
            let node_id = RecordId::entity("User", id);
            let mut node = Record::new();
            node.insert("__typename", FieldValue::Scalar(json!("User")));
            node.insert("title", FieldValue::Scalar(json!(format!("A{}", id.trim_start_matches('p')))));
            store.put(&node_id, node);

            let mut edge = Record::new();
            edge.insert("__typename", FieldValue::Scalar(json!("UserEdge")));
            edge.insert("node", FieldValue::Ref(node_id));
            edge.insert("cursor", FieldValue::Scalar(json!(cursor)));
            store.put(&edge_id, edge);
            edges.push(edge_id);
        }

        let mut page = Record::new();
        page.insert("edges", FieldValue::Refs(edges));
        store.put(page_key, page);

        let mut page_info = Record::new();
        if let Some(v) = has_prev {
            page_info.insert("hasPreviousPage", FieldValue::Scalar(json!(v)));
        }
        if let Some(v) = has_next {
            page_info.insert("hasNextPage", FieldValue::Scalar(json!(v)));
        }
        store.put(&RecordId::page_info(page_key), page_info);
    }

    #[test]
    fn leader_then_forward_pagination_s1() {
        let store = Store::new(immediate());
        let field = users_field(ConnectionMode::Infinite);

        let page_a = RecordId::page(&RecordId::root(), "users", r#"{"first":2}"#);
        write_page(&store, &page_a, &[("p1", "p1"), ("p2", "p2")], Some(true), Some(false));
        let mut vars_a = Variables::new();
        vars_a.0.insert("first".into(), json!(2));
        let update_a = PageUpdate {
            field: field.clone(),
            parent_id: RecordId::root(),
            variables: vars_a,
            page_key: page_a,
        };
        let canonical_key = update_connection(&store, &update_a);

        let page_b = RecordId::page(&RecordId::root(), "users", r#"{"after":"p2","first":2}"#);
        write_page(&store, &page_b, &[("p3", "p3"), ("p4", "p4")], Some(false), None);
        let mut vars_b = Variables::new();
        vars_b.0.insert("first".into(), json!(2));
        vars_b.0.insert("after".into(), json!("p2"));
        let update_b = PageUpdate {
            field: field.clone(),
            parent_id: RecordId::root(),
            variables: vars_b,
            page_key: page_b,
        };
        update_connection(&store, &update_b);

        let canonical = store.get(&canonical_key).unwrap();
        let edges = canonical.get("edges").and_then(FieldValue::as_refs).unwrap();
        assert_eq!(edges.len(), 4);

        let page_info_id = canonical.get("pageInfo").and_then(FieldValue::as_ref_id).unwrap();
        let page_info_record = store.get(page_info_id).unwrap();
        let page_info = page_info_from_record(&page_info_record);
        assert_eq!(page_info.start_cursor.as_deref(), Some("p1"));
        assert_eq!(page_info.end_cursor.as_deref(), Some("p4"));
        assert_eq!(page_info.has_next_page, Some(false));
        assert_eq!(page_info.has_previous_page, Some(true));

        let cursor_index = read_cursor_index(&store, &canonical_key);
        assert_eq!(cursor_index.get("p1"), Some(&0));
        assert_eq!(cursor_index.get("p4"), Some(&3));
    }

    #[test]
    fn backward_prepend_s2() {
        let store = Store::new(immediate());
        let field = users_field(ConnectionMode::Infinite);

        let page_a = RecordId::page(&RecordId::root(), "users", r#"{"last":2}"#);
        write_page(&store, &page_a, &[("p3", "p3"), ("p4", "p4")], None, Some(true));
        let mut vars_a = Variables::new();
        vars_a.0.insert("last".into(), json!(2));
        let canonical_key = update_connection(
            &store,
            &PageUpdate { field: field.clone(), parent_id: RecordId::root(), variables: vars_a, page_key: page_a },
        );

        let page_b = RecordId::page(&RecordId::root(), "users", r#"{"before":"p3","last":2}"#);
        write_page(&store, &page_b, &[("p1", "p1"), ("p2", "p2")], None, None);
        let mut vars_b = Variables::new();
        vars_b.0.insert("last".into(), json!(2));
        vars_b.0.insert("before".into(), json!("p3"));
        update_connection(
            &store,
            &PageUpdate { field, parent_id: RecordId::root(), variables: vars_b, page_key: page_b },
        );

        let canonical = store.get(&canonical_key).unwrap();
        let edges = canonical.get("edges").and_then(FieldValue::as_refs).unwrap();
        assert_eq!(edges.len(), 4);
        let cursor_index = read_cursor_index(&store, &canonical_key);
        assert_eq!(cursor_index.get("p1"), Some(&0));
        assert_eq!(cursor_index.get("p4"), Some(&3));
    }
}
