//! The flat record store (`spec.md` §4.2).
//!
//! Holds shared mutable state behind `parking_lot::Mutex`/`RwLock`, the
//! same primitive the teacher's `peeps`/`peeps-runtime` registries use for
//! their own shared state (`peeps/src/registry/enabled.rs`). The engine's
//! *logical* execution model is single-threaded cooperative (`spec.md`
//! §5), but the lock lets a `Store` live behind an `Arc` and be handed to
//! a transport callback running on another OS thread (a Tokio task)
//! without the caller reasoning about it — the same reason `peeps`'s
//! registry takes a lock even though most of its callers are
//! single-threaded per process.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

use cachebay_types::{fields_deep_eq, normalize_id_field, FieldValue, Record, RecordId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreInspection {
    pub record_count: usize,
    pub clock: u64,
}

type OnChange = dyn Fn(&HashSet<RecordId>) + Send + Sync;

/// Flat mapping `recordId → record`, with a per-record monotonic version
/// that never decreases and a coalesced change notifier (`spec.md` §4.2).
pub struct Store {
    records: RwLock<HashMap<RecordId, (Record, u64)>>,
    clock: AtomicU64,
    pending: Mutex<HashSet<RecordId>>,
    flushing: AtomicBool,
    scheduler: Arc<dyn crate::scheduler::Scheduler>,
    on_change: RwLock<Option<Arc<OnChange>>>,
    self_ref: OnceLock<Weak<Store>>,
}

impl Store {
    pub fn new(scheduler: Arc<dyn crate::scheduler::Scheduler>) -> Arc<Self> {
        let store = Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            pending: Mutex::new(HashSet::new()),
            flushing: AtomicBool::new(false),
            scheduler,
            on_change: RwLock::new(None),
            self_ref: OnceLock::new(),
        });
        let _ = store.self_ref.set(Arc::downgrade(&store));
        store
    }

    /// Installs the callback `flush()` invokes with the batch of dirty
    /// record ids. `Client` wires this to `Watchers::on_store_change`.
    pub fn set_on_change(&self, callback: Arc<OnChange>) {
        *self.on_change.write() = Some(callback);
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.records.read().get(id).map(|(record, _)| record.clone())
    }

    pub fn version(&self, id: &RecordId) -> u64 {
        self.records.read().get(id).map(|(_, version)| *version).unwrap_or(0)
    }

    /// Merges `patch` into the current record at `id`, per `spec.md` §4.2:
    /// deep equality detects no-op writes (no version bump, no
    /// notification, when the merged record is unchanged); the special
    /// `id` field is normalized to a string or `null`; writes into root
    /// `@` also mark per-field root sentinels dirty.
    ///
    /// Returns whether any content actually changed.
    pub fn put(&self, id: &RecordId, mut patch: Record) -> bool {
        if let Some(FieldValue::Scalar(raw_id)) = patch.fields.get("id").cloned() {
            let normalized = normalize_id_field(&raw_id)
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null);
            patch.insert("id", FieldValue::Scalar(normalized));
        }

        let mut records = self.records.write();
        let changed_keys: Vec<String>;

        match records.get_mut(id) {
            Some((existing, version)) => {
                changed_keys = patch
                    .fields
                    .iter()
                    .filter(|(key, value)| match existing.get(key) {
                        Some(current) => !fields_deep_eq(current, value),
                        None => true,
                    })
                    .map(|(key, _)| key.clone())
                    .collect();

                if changed_keys.is_empty() {
                    return false;
                }

                existing.merge(patch);
                *version = self.bump();
            }
            None => {
                changed_keys = patch.fields.keys().cloned().collect();
                let version = self.bump();
                records.insert(id.clone(), (patch, version));
            }
        }
        drop(records);

        tracing::debug!(record_id = %id, fields = changed_keys.len(), "store: put");
        self.mark_dirty(id.clone());
        if id.is_root() {
            for key in &changed_keys {
                self.mark_dirty(RecordId::root_field_sentinel(key));
            }
        }
        true
    }

    /// Fully overwrites the record at `id`, unlike [`Store::put`] which
    /// merges a patch onto the existing content. Used by `Optimistic`
    /// revert (`spec.md` §4.6 "Revert"), which must also drop any key an
    /// optimistic layer added that wasn't present in the pre-layer
    /// baseline — a merge can't express a deletion.
    pub fn replace(&self, id: &RecordId, record: Record) -> bool {
        let mut records = self.records.write();
        if records.get(id).map(|(existing, _)| existing) == Some(&record) {
            return false;
        }
        let version = self.bump();
        records.insert(id.clone(), (record, version));
        drop(records);

        tracing::debug!(record_id = %id, "store: replace");
        self.mark_dirty(id.clone());
        true
    }

    /// Deletes a record and its version, per `spec.md` §4.2.
    pub fn remove(&self, id: &RecordId) -> bool {
        let removed = self.records.write().remove(id).is_some();
        if removed {
            self.bump();
            tracing::debug!(record_id = %id, "store: remove");
            self.mark_dirty(id.clone());
        }
        removed
    }

    pub fn keys(&self) -> Vec<RecordId> {
        self.records.read().keys().cloned().collect()
    }

    /// Drops every record and pending change. Versions are not retained
    /// across eviction (`spec.md` §3 "Lifecycle").
    pub fn evict_all(&self) {
        self.records.write().clear();
        self.pending.lock().clear();
        tracing::info!("store: evicted all");
    }

    pub fn inspect(&self) -> StoreInspection {
        StoreInspection {
            record_count: self.records.read().len(),
            clock: self.clock.load(Ordering::SeqCst),
        }
    }

    /// Synchronously drains pending changes to the installed `on_change`
    /// callback. Re-entrant calls (the callback itself triggering another
    /// `flush()`) are ignored (`spec.md` §4.2).
    pub fn flush(&self) {
        if self.flushing.swap(true, Ordering::SeqCst) {
            return;
        }

        let pending: HashSet<RecordId> = std::mem::take(&mut *self.pending.lock());
        if !pending.is_empty() {
            if let Some(callback) = self.on_change.read().as_ref() {
                callback(&pending);
            }
        }

        self.flushing.store(false, Ordering::SeqCst);
    }

    fn bump(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn mark_dirty(&self, id: RecordId) {
        let scheduled = {
            let mut pending = self.pending.lock();
            let was_empty = pending.is_empty();
            pending.insert(id);
            was_empty
        };
        if scheduled {
            self.schedule_flush();
        }
    }

    fn schedule_flush(&self) {
        let Some(weak) = self.self_ref.get() else { return };
        let Some(strong) = weak.upgrade() else { return };
        self.scheduler.schedule(Box::new(move || strong.flush()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::immediate;
    use serde_json::json;

    fn sample_patch(email: &str) -> Record {
        let mut record = Record::new();
        record.insert("__typename", FieldValue::Scalar(json!("User")));
        record.insert("email", FieldValue::Scalar(json!(email)));
        record
    }

    #[test]
    fn put_bumps_version_only_on_real_change() {
        let store = Store::new(immediate());
        let id = RecordId::entity("User", "u1");

        assert!(store.put(&id, sample_patch("a@x")));
        let version_after_first = store.version(&id);
        assert_eq!(version_after_first, 1);

        assert!(!store.put(&id, sample_patch("a@x")));
        assert_eq!(store.version(&id), version_after_first);

        assert!(store.put(&id, sample_patch("b@y")));
        assert_eq!(store.version(&id), version_after_first + 1);
    }

    #[test]
    fn remove_deletes_record_and_version() {
        let store = Store::new(immediate());
        let id = RecordId::entity("User", "u1");
        store.put(&id, sample_patch("a@x"));
        assert!(store.remove(&id));
        assert_eq!(store.version(&id), 0);
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn root_write_marks_field_sentinels_dirty() {
        let store = Store::new(immediate());
        let touched = Arc::new(Mutex::new(HashSet::new()));
        let sink = touched.clone();
        store.set_on_change(Arc::new(move |ids: &HashSet<RecordId>| {
            sink.lock().extend(ids.iter().cloned());
        }));

        let mut root_patch = Record::new();
        root_patch.insert("viewer", FieldValue::Ref(RecordId::entity("User", "u1")));
        store.put(&RecordId::root(), root_patch);

        let seen = touched.lock();
        assert!(seen.contains(&RecordId::root_field_sentinel("viewer")));
        assert!(seen.contains(&RecordId::root()));
    }

    #[test]
    fn flush_is_not_reentrant() {
        let store = Store::new(immediate());
        let depth = Arc::new(AtomicU64::new(0));
        let max_depth = Arc::new(AtomicU64::new(0));

        let depth_in = depth.clone();
        let max_in = max_depth.clone();
        store.set_on_change(Arc::new(move |_ids| {
            let current = depth_in.fetch_add(1, Ordering::SeqCst) + 1;
            max_in.fetch_max(current, Ordering::SeqCst);
            depth_in.fetch_sub(1, Ordering::SeqCst);
        }));

        store.put(&RecordId::entity("User", "u1"), sample_patch("a@x"));
        assert_eq!(max_depth.load(Ordering::SeqCst), 1);
    }
}
