//! Layered optimistic mutations (`spec.md` §4.6).
//!
//! A [`Modification`] wraps one transaction builder closure, re-invoked
//! with a different [`Phase`] at commit time and again (in `Phase::Record`)
//! by [`Optimistic::replay_optimistic`] whenever a canonical write needs
//! pending layers reasserted above it. Every op the builder performs —
//! entity patch/delete, or a connection add/remove/patch — is captured as
//! a *whole-record, clone-on-first-touch* baseline per touched id, the
//! same mechanism for every op kind: reverting a layer is just restoring
//! (or removing) each touched record to its pre-layer snapshot. The source
//! spec describes connection reverts as reversing individual splice/shift
//! steps, but since a connection op only ever touches a handful of whole
//! records (the canonical record, a new/removed edge, the cursor-index and
//! edge-counter sidecars), a per-record snapshot produces the identical
//! end state regardless of op order within the layer — see `DESIGN.md`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use cachebay_types::{FieldValue, IdentityConfig, Record, RecordId};
use parking_lot::Mutex;
use serde_json::Value as Json;

use crate::canonical::{edge_cursor, read_cursor_index, read_edge_counter, write_cursor_index, write_edge_counter};
use crate::store::Store;

pub type LayerId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// The builder is running for the first time (or being replayed) and
    /// its writes should be tracked for revert.
    Record,
    /// The builder is running as a final, non-optimistic write after its
    /// optimistic layer has been reverted; writes here are untracked.
    Commit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Merge,
    Replace,
}

/// Where a new edge is spliced relative to the connection's existing edges
/// (`spec.md` §4.6 "ADD_NODE"). `Before`/`After` anchor on another node's
/// identity, falling back to appending at the end when that node isn't
/// found in the connection.
pub enum Anchor {
    Start,
    End,
    Before(RecordId),
    After(RecordId),
}

/// A scoping hint for [`Optimistic::replay_optimistic`]: only layers that
/// touched one of these ids are re-applied (`spec.md` §4.6 "Replay").
pub struct ReplayHint<'a> {
    pub ids: &'a [RecordId],
}

type Builder = dyn Fn(&mut Transaction, Phase, Option<&Json>) + Send + Sync;

struct Layer {
    builder: Arc<Builder>,
    touched: HashMap<RecordId, Option<Record>>,
}

/// Per-layer transaction context handed to a modification's builder
/// closure. Every mutating call captures the pre-layer snapshot of each
/// record it touches the first time it's touched within this layer.
pub struct Transaction<'a> {
    store: &'a Store,
    identity: &'a IdentityConfig,
    touched: HashMap<RecordId, Option<Record>>,
}

impl<'a> Transaction<'a> {
    fn new(store: &'a Store, identity: &'a IdentityConfig) -> Self {
        Self { store, identity, touched: HashMap::new() }
    }

    fn touch(&mut self, id: &RecordId) {
        self.touched.entry(id.clone()).or_insert_with(|| self.store.get(id));
    }

    fn into_touched(self) -> HashMap<RecordId, Option<Record>> {
        self.touched
    }

    /// `patch(target, delta, {mode})` (`spec.md` §4.6 "Builder").
    pub fn patch(&mut self, target: &RecordId, delta: Record, mode: WriteMode) {
        self.touch(target);
        match mode {
            WriteMode::Merge => {
                self.store.put(target, delta);
            }
            WriteMode::Replace => {
                self.store.replace(target, delta);
            }
        }
    }

    /// `delete(target)` (`spec.md` §4.6 "Builder").
    pub fn delete(&mut self, target: &RecordId) {
        self.touch(target);
        self.store.remove(target);
    }

    /// `connection(canonicalKey) → {addNode, removeNode, patch}`
    /// (`spec.md` §4.6 "Builder"). The caller is expected to have already
    /// derived `canonical_key` the way `Canonical`/`Materializer` do
    /// (`RecordId::canonical`), since the transaction has no `Plan` to
    /// derive it from itself.
    pub fn connection(&mut self, canonical_key: RecordId) -> ConnectionEditor<'_, 'a> {
        ConnectionEditor { txn: self, canonical_key }
    }

    fn node_id_of(&self, edge_id: &RecordId) -> Option<RecordId> {
        self.store.get(edge_id).and_then(|edge| edge.get("node").and_then(FieldValue::as_ref_id).cloned())
    }
}

pub struct ConnectionEditor<'t, 'a> {
    txn: &'t mut Transaction<'a>,
    canonical_key: RecordId,
}

impl ConnectionEditor<'_, '_> {
    /// `ADD_NODE` (`spec.md` §4.6): ensures `node`'s entity exists,
    /// deduplicates by identity (updating edge scalars on a repeat add
    /// instead of inserting twice), allocates the next edge index from the
    /// connection's edge-counter sidecar, and splices the new edge into
    /// the connection at `anchor`. Returns silently if `node` has no
    /// resolvable identity (`spec.md` §7 "Optimistic builder returns
    /// silently for unresolvable targets").
    pub fn add_node(&mut self, node: &Json, edge_extra: Record, anchor: Anchor, cursor: Option<String>) {
        let Some(node_id) = self.txn.identity.identify(node) else {
            tracing::debug!("optimistic: add_node skipped, node has no resolvable identity");
            return;
        };

        self.txn.touch(&node_id);
        let mut node_record = Record::new();
        if let Some(object) = node.as_object() {
            for (key, value) in object {
                node_record.insert(key.clone(), FieldValue::Scalar(value.clone()));
            }
        }
        self.txn.store.put(&node_id, node_record);

        let canonical_key = self.canonical_key.clone();
        self.txn.touch(&canonical_key);
        let existing = self.txn.store.get(&canonical_key).unwrap_or_default();
        let mut edges: Vec<RecordId> =
            existing.get("edges").and_then(FieldValue::as_refs).map(|r| r.to_vec()).unwrap_or_default();

        if let Some(existing_edge) = edges.iter().find(|eid| self.txn.node_id_of(eid).as_ref() == Some(&node_id)).cloned() {
            if !edge_extra.fields.is_empty() {
                self.txn.touch(&existing_edge);
                self.txn.store.put(&existing_edge, edge_extra);
            }
            return;
        }

        let next_index = read_edge_counter(self.txn.store, &canonical_key);
        self.txn.touch(&RecordId::edge_counter_sidecar(&canonical_key));
        write_edge_counter(self.txn.store, &canonical_key, next_index + 1);
        let edge_id = RecordId::edge(&canonical_key, next_index as usize);
        self.txn.touch(&edge_id);

        let mut edge_record = edge_extra;
        edge_record.insert("node", FieldValue::Ref(node_id));
        if let Some(cursor) = &cursor {
            edge_record.insert("cursor", FieldValue::Scalar(Json::String(cursor.clone())));
        }
        self.txn.store.put(&edge_id, edge_record);

        let insert_at = match &anchor {
            Anchor::Start => 0,
            Anchor::End => edges.len(),
            Anchor::Before(anchor_node) => edges
                .iter()
                .position(|eid| self.txn.node_id_of(eid).as_ref() == Some(anchor_node))
                .unwrap_or(edges.len()),
            Anchor::After(anchor_node) => edges
                .iter()
                .position(|eid| self.txn.node_id_of(eid).as_ref() == Some(anchor_node))
                .map(|index| index + 1)
                .unwrap_or(edges.len()),
        };
        edges.insert(insert_at, edge_id);

        let mut canonical_patch = Record::new();
        canonical_patch.insert("edges", FieldValue::Refs(edges));
        self.txn.store.put(&canonical_key, canonical_patch);

        self.txn.touch(&RecordId::cursor_index_sidecar(&canonical_key));
        let mut index = read_cursor_index(self.txn.store, &canonical_key);
        for position in index.values_mut() {
            if *position >= insert_at {
                *position += 1;
            }
        }
        if let Some(cursor) = &cursor {
            index.insert(cursor.clone(), insert_at);
        }
        write_cursor_index(self.txn.store, &canonical_key, &index);
    }

    /// `REMOVE_NODE` (`spec.md` §4.6): locates the edge by node identity,
    /// drops it, and shifts the cursor-index sidecar's subsequent entries
    /// down by one.
    pub fn remove_node(&mut self, node_id: &RecordId) {
        let canonical_key = self.canonical_key.clone();
        self.txn.touch(&canonical_key);
        let existing = self.txn.store.get(&canonical_key).unwrap_or_default();
        let mut edges: Vec<RecordId> =
            existing.get("edges").and_then(FieldValue::as_refs).map(|r| r.to_vec()).unwrap_or_default();

        let Some(position) = edges.iter().position(|eid| self.txn.node_id_of(eid).as_ref() == Some(node_id)) else {
            return;
        };
        let removed_edge = edges.remove(position);
        self.txn.touch(&removed_edge);
        let removed_cursor = edge_cursor(self.txn.store, &removed_edge);
        self.txn.store.remove(&removed_edge);

        let mut canonical_patch = Record::new();
        canonical_patch.insert("edges", FieldValue::Refs(edges));
        self.txn.store.put(&canonical_key, canonical_patch);

        self.txn.touch(&RecordId::cursor_index_sidecar(&canonical_key));
        let mut index = read_cursor_index(self.txn.store, &canonical_key);
        if let Some(cursor) = &removed_cursor {
            index.remove(cursor);
        }
        for position_value in index.values_mut() {
            if *position_value > position {
                *position_value -= 1;
            }
        }
        write_cursor_index(self.txn.store, &canonical_key, &index);
    }

    /// `PATCH` (`spec.md` §4.6): shallow-merges `delta` onto the canonical
    /// record; `page_info_delta`, if present, merges onto the linked
    /// PageInfo record instead of the connection itself.
    pub fn patch(&mut self, delta: Record, page_info_delta: Option<Record>) {
        let canonical_key = self.canonical_key.clone();
        self.txn.touch(&canonical_key);
        self.txn.store.put(&canonical_key, delta);

        if let Some(page_info_delta) = page_info_delta {
            let page_info_id = self
                .txn
                .store
                .get(&canonical_key)
                .and_then(|record| record.get("pageInfo").and_then(FieldValue::as_ref_id).cloned());
            if let Some(page_info_id) = page_info_id {
                self.txn.touch(&page_info_id);
                self.txn.store.put(&page_info_id, page_info_delta);
            }
        }
    }
}

/// A handle returned by [`Optimistic::modify`]: `{commit(data?), revert()}`
/// (`spec.md` §6).
pub struct Modification {
    optimistic: Arc<Optimistic>,
    store: Arc<Store>,
    identity: Arc<IdentityConfig>,
    layer_id: LayerId,
}

impl Modification {
    /// Reverts the optimistic writes, then replays the original builder in
    /// `Phase::Commit` against the live store (untracked). Idempotent:
    /// reverting after a commit (or calling commit twice) is a no-op since
    /// the layer is removed on first commit (`spec.md` §4.6 "Commit").
    pub fn commit(&self, data: Option<Json>) {
        self.optimistic.commit(&self.store, &self.identity, self.layer_id, data);
    }

    /// Reverts the optimistic writes without replaying a commit
    /// (`spec.md` §4.6 "Revert"). A no-op if already committed or reverted.
    pub fn revert(&self) {
        self.optimistic.revert(&self.store, self.layer_id);
    }
}

/// The registry of pending optimistic layers (`spec.md` §4.6 "Layer").
pub struct Optimistic {
    layers: Mutex<std::collections::BTreeMap<LayerId, Layer>>,
    next_id: AtomicU64,
    self_ref: OnceLock<Weak<Optimistic>>,
}

impl Optimistic {
    pub fn new() -> Arc<Self> {
        let optimistic = Arc::new(Self {
            layers: Mutex::new(std::collections::BTreeMap::new()),
            next_id: AtomicU64::new(0),
            self_ref: OnceLock::new(),
        });
        let _ = optimistic.self_ref.set(Arc::downgrade(&optimistic));
        optimistic
    }

    /// Runs `builder` in `Phase::Record` against the live store, recording
    /// every touched record's pre-layer baseline, and registers the layer
    /// under a new monotonically increasing id (`spec.md` §4.6 "Layer",
    /// "Builder").
    pub fn modify(
        &self,
        store: &Arc<Store>,
        identity: &Arc<IdentityConfig>,
        builder: impl Fn(&mut Transaction, Phase, Option<&Json>) + Send + Sync + 'static,
    ) -> Modification {
        let builder: Arc<Builder> = Arc::new(builder);
        let layer_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;

        let mut txn = Transaction::new(store, identity);
        (builder)(&mut txn, Phase::Record, None);
        let touched = txn.into_touched();

        self.layers.lock().insert(layer_id, Layer { builder, touched });
        tracing::debug!(layer_id, "optimistic: layer recorded");

        let optimistic = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("Optimistic constructed via Optimistic::new");
        Modification { optimistic, store: store.clone(), identity: identity.clone(), layer_id }
    }

    fn commit(&self, store: &Store, identity: &IdentityConfig, layer_id: LayerId, data: Option<Json>) {
        let Some(layer) = self.layers.lock().remove(&layer_id) else { return };
        revert_layer(store, &layer);

        let mut txn = Transaction::new(store, identity);
        (layer.builder)(&mut txn, Phase::Commit, data.as_ref());
        tracing::debug!(layer_id, "optimistic: layer committed");
    }

    fn revert(&self, store: &Store, layer_id: LayerId) {
        let Some(layer) = self.layers.lock().remove(&layer_id) else { return };
        revert_layer(store, &layer);
        tracing::debug!(layer_id, "optimistic: layer reverted");
    }

    /// Re-applies every pending layer's builder in `Phase::Record`, in
    /// ascending layer id, against the current store (`spec.md` §4.6
    /// "Replay"). Called after any canonical write so pending optimistic
    /// edits reassert above the new server state. When `hint` is given,
    /// only layers whose recorded baseline already touched one of its ids
    /// are replayed.
    pub fn replay_optimistic(&self, store: &Store, identity: &IdentityConfig, hint: Option<&ReplayHint>) {
        let candidates: Vec<(LayerId, Arc<Builder>)> = {
            let layers = self.layers.lock();
            layers
                .iter()
                .filter(|(_, layer)| match hint {
                    None => true,
                    Some(hint) => hint.ids.iter().any(|id| layer.touched.contains_key(id)),
                })
                .map(|(id, layer)| (*id, layer.builder.clone()))
                .collect()
        };

        for (layer_id, builder) in candidates {
            let mut txn = Transaction::new(store, identity);
            (builder)(&mut txn, Phase::Record, None);
            let fresh_touches = txn.into_touched();

            let mut layers = self.layers.lock();
            if let Some(layer) = layers.get_mut(&layer_id) {
                for (id, baseline) in fresh_touches {
                    layer.touched.entry(id).or_insert(baseline);
                }
            }
        }
    }

    pub fn evict_all(&self) {
        self.layers.lock().clear();
    }
}

fn revert_layer(store: &Store, layer: &Layer) {
    for (id, baseline) in &layer.touched {
        match baseline {
            Some(record) => {
                store.replace(id, record.clone());
            }
            None => {
                store.remove(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::immediate;
    use serde_json::json;

    fn user_patch(name: &str) -> Record {
        let mut record = Record::new();
        record.insert("__typename", FieldValue::Scalar(json!("User")));
        record.insert("name", FieldValue::Scalar(json!(name)));
        record
    }

    #[test]
    fn revert_restores_pre_layer_snapshot() {
        let store = Store::new(immediate());
        let identity = Arc::new(IdentityConfig::new());
        let id = RecordId::entity("User", "u1");
        store.put(&id, user_patch("Ada"));

        let optimistic = Optimistic::new();
        let target = id.clone();
        let modification = optimistic.modify(&store, &identity, move |txn, phase, _data| {
            if phase == Phase::Record {
                txn.patch(&target, user_patch("Ada (editing)"), WriteMode::Merge);
            }
        });

        assert_eq!(store.get(&id).unwrap().get("name").and_then(FieldValue::as_scalar), Some(&json!("Ada (editing)")));

        modification.revert();
        assert_eq!(store.get(&id).unwrap().get("name").and_then(FieldValue::as_scalar), Some(&json!("Ada")));
    }

    #[test]
    fn commit_applies_final_write_and_drops_layer() {
        let store = Store::new(immediate());
        let identity = Arc::new(IdentityConfig::new());
        let id = RecordId::entity("User", "u1");
        store.put(&id, user_patch("Ada"));

        let optimistic = Optimistic::new();
        let target = id.clone();
        let modification = optimistic.modify(&store, &identity, move |txn, phase, data| match phase {
            Phase::Record => txn.patch(&target, user_patch("Ada (editing)"), WriteMode::Merge),
            Phase::Commit => {
                let name = data.and_then(Json::as_str).unwrap_or("Ada");
                txn.patch(&target, user_patch(name), WriteMode::Merge);
            }
        });

        modification.commit(Some(json!("Ada Lovelace")));
        assert_eq!(
            store.get(&id).unwrap().get("name").and_then(FieldValue::as_scalar),
            Some(&json!("Ada Lovelace"))
        );

        // Revert after commit is a no-op (spec.md §4.6 "Commit").
        modification.revert();
        assert_eq!(
            store.get(&id).unwrap().get("name").and_then(FieldValue::as_scalar),
            Some(&json!("Ada Lovelace"))
        );
    }

    #[test]
    fn delete_then_revert_restores_deleted_record() {
        let store = Store::new(immediate());
        let identity = Arc::new(IdentityConfig::new());
        let id = RecordId::entity("User", "u1");
        store.put(&id, user_patch("Ada"));

        let optimistic = Optimistic::new();
        let target = id.clone();
        let modification = optimistic.modify(&store, &identity, move |txn, phase, _data| {
            if phase == Phase::Record {
                txn.delete(&target);
            }
        });

        assert!(store.get(&id).is_none());
        modification.revert();
        assert_eq!(store.get(&id).unwrap().get("name").and_then(FieldValue::as_scalar), Some(&json!("Ada")));
    }

    #[test]
    fn add_node_then_revert_restores_canonical_connection() {
        let store = Store::new(immediate());
        let identity = Arc::new(IdentityConfig::new());

        let canonical_key = RecordId::canonical(None, "comments", "{}");
        let mut canonical_record = Record::new();
        canonical_record.insert("edges", FieldValue::Refs(vec![]));
        store.put(&canonical_key, canonical_record);

        let optimistic = Optimistic::new();
        let key = canonical_key.clone();
        let modification = optimistic.modify(&store, &identity, move |txn, phase, _data| {
            if phase == Phase::Record {
                let node = json!({"__typename": "Comment", "id": "tmp1", "body": "hi"});
                txn.connection(key.clone()).add_node(&node, Record::new(), Anchor::End, Some("c1".into()));
            }
        });

        let edges_after_add = store.get(&canonical_key).unwrap().get("edges").and_then(FieldValue::as_refs).unwrap().len();
        assert_eq!(edges_after_add, 1);
        assert!(store.get(&RecordId::entity("Comment", "tmp1")).is_some());

        modification.revert();
        let edges_after_revert = store.get(&canonical_key).unwrap().get("edges").and_then(FieldValue::as_refs).unwrap().len();
        assert_eq!(edges_after_revert, 0);
        assert!(store.get(&RecordId::entity("Comment", "tmp1")).is_none());
        assert!(store.get(&RecordId::edge_counter_sidecar(&canonical_key)).is_none());
    }
}
