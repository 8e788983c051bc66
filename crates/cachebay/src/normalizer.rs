//! Walks a response tree guided by a [`Plan`](cachebay_types::Plan),
//! writing entity/edge/pageInfo/inline/scalar patches to the [`Store`]
//! and collecting connection pages for [`Canonical`](crate::canonical)
//! (`spec.md` §4.4).
//!
//! Defensive by design (`spec.md` §7 "Normalizer ignores unrecognized
//! values defensively (no throw)"): a value that doesn't match the shape
//! its selection expects is skipped with a `tracing::debug!` breadcrumb
//! rather than aborting the whole write, the same `warn!(...); continue;`
//! posture this workspace uses elsewhere for malformed input.

use cachebay_types::{FieldValue, IdentityConfig, Record, RecordId, Selection, SelectionField, Variables};
use serde_json::Value as Json;

use crate::canonical::PageUpdate;
use crate::keys::field_storage_key;
use crate::store::Store;

fn single(key: impl Into<String>, value: FieldValue) -> Record {
    let mut record = Record::new();
    record.insert(key.into(), value);
    record
}

/// Normalizes `data` (the response for `selection`) under `root`,
/// returning the connection pages collected along the way so the caller
/// can fold each into its canonical connection (`spec.md` §4.4 "After
/// traversal, call `Canonical.updateConnection` for each recorded page").
///
/// `root` is supplied by the caller rather than inferred here: queries
/// pass [`RecordId::root`], mutations/subscriptions pass their synthetic
/// operation root, and fragment writes pass the target entity id
/// (`spec.md` §4.4 "Rules").
pub fn normalize(
    store: &Store,
    identity: &IdentityConfig,
    root: &RecordId,
    selection: &Selection,
    variables: &Variables,
    data: &Json,
) -> Vec<PageUpdate> {
    let mut page_updates = Vec::new();
    write_selection(store, identity, root, selection, variables, data, &mut page_updates);
    page_updates
}

fn write_selection(
    store: &Store,
    identity: &IdentityConfig,
    parent_id: &RecordId,
    selection: &Selection,
    variables: &Variables,
    value: &Json,
    page_updates: &mut Vec<PageUpdate>,
) {
    let Json::Object(object) = value else {
        tracing::debug!(parent_id = %parent_id, "normalizer: expected an object, skipping selection");
        return;
    };
    let typename = object.get("__typename").and_then(Json::as_str);

    for field in selection {
        if let Some(type_condition) = &field.type_condition {
            match typename {
                Some(t) if identity.interfaces.satisfies(t, type_condition) => {}
                _ => continue,
            }
        }

        let Some(field_value) = object.get(&field.response_key) else {
            continue;
        };
        write_field(store, identity, parent_id, field, variables, field_value, page_updates);
    }
}

fn write_field(
    store: &Store,
    identity: &IdentityConfig,
    parent_id: &RecordId,
    field: &SelectionField,
    variables: &Variables,
    value: &Json,
    page_updates: &mut Vec<PageUpdate>,
) {
    let storage_key = field_storage_key(field, variables);

    let Some(sub_selection) = &field.selection else {
        store.put(parent_id, single(storage_key, FieldValue::Scalar(value.clone())));
        return;
    };

    if field.is_connection() {
        write_connection(store, identity, parent_id, field, sub_selection, variables, &storage_key, value, page_updates);
        return;
    }

    match value {
        Json::Null => {
            store.put(parent_id, single(storage_key, FieldValue::Scalar(Json::Null)));
        }
        Json::Array(items) => {
            write_array(store, identity, parent_id, sub_selection, variables, &storage_key, items, page_updates);
        }
        Json::Object(_) => {
            write_object(store, identity, parent_id, sub_selection, variables, &storage_key, value, page_updates, true);
        }
        _ => {
            tracing::debug!(parent_id = %parent_id, field = %field.field_name, "normalizer: scalar value under a selected field, skipping");
        }
    }
}

/// Writes an identified entity or an inline container and recurses into
/// it. `link` is false for a connection's `node` position, which is
/// linked explicitly by the edge-writing caller instead (`spec.md` §4.4
/// "Object with identity ... if the field is not the connection node
/// position, link parent → entity by `__ref`").
fn write_object(
    store: &Store,
    identity: &IdentityConfig,
    parent_id: &RecordId,
    sub_selection: &Selection,
    variables: &Variables,
    storage_key: &str,
    value: &Json,
    page_updates: &mut Vec<PageUpdate>,
    link: bool,
) -> RecordId {
    if let Some(entity_id) = identity.identify(value) {
        ensure_typename(store, &entity_id, value);
        if link {
            store.put(parent_id, single(storage_key, FieldValue::Ref(entity_id.clone())));
        }
        write_selection(store, identity, &entity_id, sub_selection, variables, value, page_updates);
        entity_id
    } else {
        let inline_id = RecordId::inline(parent_id, storage_key);
        if link {
            store.put(parent_id, single(storage_key, FieldValue::Ref(inline_id.clone())));
        }
        write_selection(store, identity, &inline_id, sub_selection, variables, value, page_updates);
        inline_id
    }
}

fn ensure_typename(store: &Store, entity_id: &RecordId, value: &Json) {
    if let Some(typename) = value.get("__typename") {
        store.put(entity_id, single("__typename", FieldValue::Scalar(typename.clone())));
    }
}

fn write_array(
    store: &Store,
    identity: &IdentityConfig,
    parent_id: &RecordId,
    sub_selection: &Selection,
    variables: &Variables,
    storage_key: &str,
    items: &[Json],
    page_updates: &mut Vec<PageUpdate>,
) {
    let mut ids = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        if !item.is_object() {
            tracing::debug!(parent_id = %parent_id, "normalizer: non-object array item under a selected field, skipping");
            continue;
        }
        let item_key = format!("{storage_key}.{index}");
        let id = write_object(store, identity, parent_id, sub_selection, variables, &item_key, item, page_updates, false);
        ids.push(id);
    }
    store.put(parent_id, single(storage_key, FieldValue::Refs(ids)));
}

fn write_connection(
    store: &Store,
    identity: &IdentityConfig,
    parent_id: &RecordId,
    field: &SelectionField,
    conn_selection: &Selection,
    variables: &Variables,
    storage_key: &str,
    value: &Json,
    page_updates: &mut Vec<PageUpdate>,
) {
    let Json::Object(object) = value else {
        tracing::debug!(parent_id = %parent_id, "normalizer: connection field value is not an object, skipping");
        return;
    };

    let stringified_args = (field.stringify_args)(variables);
    let page_key = RecordId::page(parent_id, &field.field_name, &stringified_args);

    let mut page_record = Record::new();
    for scalar_field in conn_selection
        .iter()
        .filter(|f| f.selection.is_none() && f.field_name != "__typename")
    {
        if let Some(v) = object.get(&scalar_field.response_key) {
            page_record.insert(field_storage_key(scalar_field, variables), FieldValue::Scalar(v.clone()));
        }
    }
    if let Some(typename) = object.get("__typename") {
        page_record.insert("__typename", FieldValue::Scalar(typename.clone()));
    }
    store.put(&page_key, page_record);
    store.put(parent_id, single(storage_key, FieldValue::Ref(page_key.clone())));

    page_updates.push(PageUpdate {
        field: field.clone(),
        parent_id: parent_id.clone(),
        variables: variables.clone(),
        page_key: page_key.clone(),
    });

    if let Some(page_info_value) = object.get("pageInfo") {
        if let Some(page_info_field) = conn_selection.iter().find(|f| f.field_name == "pageInfo") {
            let page_info_id = RecordId::page_info(&page_key);
            store.put(&page_key, single("pageInfo", FieldValue::Ref(page_info_id.clone())));
            let page_info_selection = page_info_field.selection.clone().unwrap_or_default();
            write_selection(store, identity, &page_info_id, &page_info_selection, variables, page_info_value, page_updates);
        }
    }

    if let Some(Json::Array(edges)) = object.get("edges") {
        if let Some(edges_field) = conn_selection.iter().find(|f| f.field_name == "edges") {
            let edge_selection = edges_field.selection.clone().unwrap_or_default();
            let node_field = edge_selection.iter().find(|f| f.field_name == "node").cloned();

            let mut edge_ids = Vec::with_capacity(edges.len());
            for (index, edge_value) in edges.iter().enumerate() {
                let edge_id = RecordId::edge(&page_key, index);
                write_selection(
                    store,
                    identity,
                    &edge_id,
                    &edge_selection.iter().filter(|f| f.field_name != "node").cloned().collect::<Vec<_>>(),
                    variables,
                    edge_value,
                    page_updates,
                );

                if let Some(node_field) = &node_field {
                    write_edge_node(store, identity, &edge_id, node_field, variables, edge_value.get("node"), page_updates);
                }

                edge_ids.push(edge_id);
            }
            store.put(&page_key, single("edges", FieldValue::Refs(edge_ids)));
        }
    }
}

fn write_edge_node(
    store: &Store,
    identity: &IdentityConfig,
    edge_id: &RecordId,
    node_field: &SelectionField,
    variables: &Variables,
    node_value: Option<&Json>,
    page_updates: &mut Vec<PageUpdate>,
) {
    match node_value {
        None | Some(Json::Null) => {
            store.put(edge_id, single("node", FieldValue::Scalar(Json::Null)));
        }
        Some(value) => {
            let node_selection = node_field.selection.clone().unwrap_or_default();
            write_object(store, identity, edge_id, &node_selection, variables, "node", value, page_updates, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::immediate;
    use cachebay_types::{ConnectionMeta, ConnectionMode};
    use serde_json::json;
    use std::sync::Arc;

    fn no_args() -> (Arc<dyn Fn(&Variables) -> serde_json::Map<String, Json> + Send + Sync>, Arc<dyn Fn(&Variables) -> String + Send + Sync>) {
        (Arc::new(|_: &Variables| serde_json::Map::new()), Arc::new(|_: &Variables| "{}".to_string()))
    }

    fn scalar_field(name: &str) -> SelectionField {
        let (build, stringify) = no_args();
        SelectionField {
            response_key: name.into(),
            field_name: name.into(),
            type_condition: None,
            build_args: build,
            stringify_args: stringify,
            selection: None,
            connection: None,
        }
    }

    fn object_field(name: &str, selection: Selection) -> SelectionField {
        let (build, stringify) = no_args();
        SelectionField {
            response_key: name.into(),
            field_name: name.into(),
            type_condition: None,
            build_args: build,
            stringify_args: stringify,
            selection: Some(selection),
            connection: None,
        }
    }

    #[test]
    fn writes_scalar_and_links_entity() {
        let store = Store::new(immediate());
        let identity = IdentityConfig::new();

        let user_selection = vec![scalar_field("id"), scalar_field("email")];
        let root_selection = vec![object_field("viewer", user_selection)];

        let data = json!({
            "viewer": {"__typename": "User", "id": "u1", "email": "a@x"}
        });

        let vars = Variables::new();
        normalize(&store, &identity, &RecordId::root(), &root_selection, &vars, &data);

        let root = store.get(&RecordId::root()).unwrap();
        assert_eq!(root.get("viewer").and_then(FieldValue::as_ref_id), Some(&RecordId::entity("User", "u1")));

        let user = store.get(&RecordId::entity("User", "u1")).unwrap();
        assert_eq!(user.get("email").and_then(FieldValue::as_scalar), Some(&json!("a@x")));
    }

    #[test]
    fn writes_connection_page_and_edges() {
        let store = Store::new(immediate());
        let identity = IdentityConfig::new();

        let node_selection = vec![scalar_field("id"), scalar_field("title")];
        let node_field = object_field("node", node_selection);
        let edge_selection = vec![node_field, scalar_field("cursor")];

        let edges_field = object_field("edges", edge_selection);
        let page_info_field = object_field("pageInfo", vec![scalar_field("hasNextPage"), scalar_field("endCursor")]);
        let mut conn_field = object_field("users", vec![edges_field, page_info_field]);
        conn_field.connection = Some(ConnectionMeta {
            connection_key: "users".into(),
            connection_filters: None,
            connection_mode: ConnectionMode::Infinite,
        });

        let root_selection = vec![conn_field];

        let data = json!({
            "users": {
                "__typename": "UserConnection",
                "edges": [
                    {"__typename": "UserEdge", "cursor": "p1", "node": {"__typename": "User", "id": "u1", "title": "A1"}},
                ],
                "pageInfo": {"hasNextPage": true, "endCursor": "p1"},
            }
        });

        let vars = Variables::new();
        let updates = normalize(&store, &identity, &RecordId::root(), &root_selection, &vars, &data);
        assert_eq!(updates.len(), 1);

        let page_key = RecordId::page(&RecordId::root(), "users", "{}");
        let page = store.get(&page_key).unwrap();
        let edges = page.get("edges").and_then(FieldValue::as_refs).unwrap();
        assert_eq!(edges.len(), 1);

        let edge = store.get(&edges[0]).unwrap();
        assert_eq!(edge.get("node").and_then(FieldValue::as_ref_id), Some(&RecordId::entity("User", "u1")));

        let user = store.get(&RecordId::entity("User", "u1")).unwrap();
        assert_eq!(user.get("title").and_then(FieldValue::as_scalar), Some(&json!("A1")));
    }
}
