//! Query/fragment watcher registry (`spec.md` §4.7).
//!
//! Mirrors `Store`'s own pending/flush/scheduler shape: `Store::on_change`
//! feeds `Watchers::on_store_change`, which unions the touched ids against
//! `dep_index` and coalesces the affected watcher set onto one scheduled
//! drain per microtask, exactly like `Store::mark_dirty`/`flush` coalesce
//! record-level changes onto one scheduled callback.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use cachebay_types::{IdentityConfig, Mode, Plan, RecordId, Signature, Variables, VariablesKey};
use parking_lot::Mutex;
use serde_json::Value as Json;

use crate::materialized::{recycle, FingerprintTree, MaterializedValue};
use crate::materializer::{MaterializeOptions, Materializer};
use crate::scheduler::Scheduler;
use crate::store::Store;

pub type WatcherId = u64;

pub type OnData = dyn Fn(&MaterializedValue) + Send + Sync;
pub type OnError = dyn Fn(&Json) + Send + Sync;

struct Watcher {
    plan: Arc<dyn Plan>,
    variables: Variables,
    signature: Signature,
    root_id: Option<RecordId>,
    deps: HashSet<RecordId>,
    last_data: Option<MaterializedValue>,
    last_fingerprints: Option<FingerprintTree>,
    on_data: Arc<OnData>,
    on_error: Option<Arc<OnError>>,
    /// Set by `notify_data_by_signature`/`notify_error_by_signature` so the
    /// dependency-driven drain that runs in the same microtask doesn't
    /// double-emit (`spec.md` §4.7 "Network fan-out").
    suppress_next: bool,
}

/// A live subscription handle (`spec.md` §6 `watchQuery`/`watchFragment`).
/// `unsubscribe` is synchronous and idempotent; `update` lets the caller
/// move the watcher to new variables without re-registering it.
pub struct WatchHandle {
    watchers: Arc<Watchers>,
    id: WatcherId,
}

impl WatchHandle {
    pub fn unsubscribe(&self) {
        self.watchers.unsubscribe(self.id);
    }

    pub fn update(&self, plan: Arc<dyn Plan>, variables: Variables, immediate: bool) {
        self.watchers.update(self.id, plan, variables, immediate);
    }
}

/// The registry tying `Store` change notifications to materialized-data
/// callbacks (`spec.md` §4.7).
pub struct Watchers {
    store: Arc<Store>,
    materializer: Arc<Materializer>,
    identity: Arc<IdentityConfig>,
    scheduler: Arc<dyn Scheduler>,

    watchers: Mutex<HashMap<WatcherId, Watcher>>,
    dep_index: Mutex<HashMap<RecordId, HashSet<WatcherId>>>,
    signature_index: Mutex<HashMap<Signature, HashSet<WatcherId>>>,

    pending: Mutex<HashSet<WatcherId>>,
    flushing: AtomicBool,
    next_id: AtomicU64,
    self_ref: OnceLock<Weak<Watchers>>,
}

impl Watchers {
    pub fn new(
        store: Arc<Store>,
        materializer: Arc<Materializer>,
        identity: Arc<IdentityConfig>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        let watchers = Arc::new(Self {
            store,
            materializer,
            identity,
            scheduler,
            watchers: Mutex::new(HashMap::new()),
            dep_index: Mutex::new(HashMap::new()),
            signature_index: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            flushing: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            self_ref: OnceLock::new(),
        });
        let _ = watchers.self_ref.set(Arc::downgrade(&watchers));
        watchers
    }

    /// Registers a new watcher: materializes with `preferCache=true,
    /// updateCache=true`, indexes it by dependency and signature, and
    /// (when `immediate`) calls `on_data` synchronously (`spec.md` §4.7
    /// "Registration").
    pub fn watch(
        self: &Arc<Self>,
        plan: Arc<dyn Plan>,
        variables: Variables,
        root_id: Option<RecordId>,
        mode: Mode,
        immediate: bool,
        on_data: Arc<OnData>,
        on_error: Option<Arc<OnError>>,
    ) -> WatchHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let signature = plan.make_signature(mode == Mode::Canonical, &variables);

        let result = self.materializer.materialize(
            &self.store,
            &self.identity,
            &plan,
            &variables,
            MaterializeOptions { mode, root_id: root_id.clone(), ..MaterializeOptions::default() },
        );

        if immediate {
            on_data(&result.data);
        }

        let watcher = Watcher {
            plan,
            variables,
            signature: signature.clone(),
            root_id,
            deps: result.dependencies.clone(),
            last_data: Some(result.data),
            last_fingerprints: result.fingerprints,
            on_data,
            on_error,
            suppress_next: false,
        };

        self.watchers.lock().insert(id, watcher);
        self.index_dependencies(id, &result.dependencies);
        self.signature_index.lock().entry(signature).or_default().insert(id);

        tracing::debug!(watcher_id = id, "watchers: registered");
        WatchHandle { watchers: self.clone(), id }
    }

    /// Synchronous and idempotent (`spec.md` §5 "Cancellation"): a repeat
    /// call, or one for an id that already left via eviction, is a no-op.
    pub fn unsubscribe(&self, id: WatcherId) {
        let Some(watcher) = self.watchers.lock().remove(&id) else { return };
        self.deindex_dependencies(id, &watcher.deps);

        let mut signatures = self.signature_index.lock();
        if let Some(bucket) = signatures.get_mut(&watcher.signature) {
            bucket.remove(&id);
            if bucket.is_empty() {
                signatures.remove(&watcher.signature);
                drop(signatures);
                self.evict_materializer_entry(&watcher);
            }
        }

        self.pending.lock().remove(&id);
        tracing::debug!(watcher_id = id, "watchers: unsubscribed");
    }

    /// Moves a watcher to new variables/plan, re-materializing and
    /// re-indexing it (`spec.md` §4.7 "Cache eviction for watchers").
    pub fn update(&self, id: WatcherId, plan: Arc<dyn Plan>, variables: Variables, immediate: bool) {
        let (mode, root_id, old_signature, old_deps) = {
            let watchers = self.watchers.lock();
            let Some(watcher) = watchers.get(&id) else { return };
            (
                Mode::Canonical,
                watcher.root_id.clone(),
                watcher.signature.clone(),
                watcher.deps.clone(),
            )
        };

        let new_signature = plan.make_signature(mode == Mode::Canonical, &variables);
        let result = self.materializer.materialize(
            &self.store,
            &self.identity,
            &plan,
            &variables,
            MaterializeOptions { mode, root_id: root_id.clone(), ..MaterializeOptions::default() },
        );

        self.deindex_dependencies(id, &old_deps);
        self.index_dependencies(id, &result.dependencies);

        let mut signatures = self.signature_index.lock();
        if let Some(bucket) = signatures.get_mut(&old_signature) {
            bucket.remove(&id);
            if bucket.is_empty() && old_signature != new_signature {
                signatures.remove(&old_signature);
            }
        }
        signatures.entry(new_signature.clone()).or_default().insert(id);
        drop(signatures);

        let mut watchers = self.watchers.lock();
        if let Some(watcher) = watchers.get_mut(&id) {
            let recycled = recycle(&result.data, result.fingerprints.as_ref().unwrap_or(&FingerprintTree::Leaf(cachebay_types::Fingerprint::ZERO)), watcher.last_data.as_ref(), watcher.last_fingerprints.as_ref());
            watcher.plan = plan;
            watcher.variables = variables;
            watcher.signature = new_signature;
            watcher.deps = result.dependencies;
            watcher.last_data = Some(recycled.clone());
            watcher.last_fingerprints = result.fingerprints;

            if immediate {
                let on_data = watcher.on_data.clone();
                drop(watchers);
                on_data(&recycled);
            }
        }
    }

    /// Fed by `Store::set_on_change`: folds newly-touched record ids into
    /// the pending set and schedules one coalesced drain, exactly the way
    /// `Store::mark_dirty` schedules one `flush` (`spec.md` §4.7
    /// "Invalidation broadcast").
    pub fn on_store_change(&self, touched: &HashSet<RecordId>) {
        let affected: HashSet<WatcherId> = {
            let dep_index = self.dep_index.lock();
            touched.iter().filter_map(|id| dep_index.get(id)).flatten().copied().collect()
        };
        if affected.is_empty() {
            return;
        }

        let scheduled = {
            let mut pending = self.pending.lock();
            let was_empty = pending.is_empty();
            pending.extend(affected);
            was_empty
        };
        if scheduled {
            self.schedule_drain();
        }
    }

    /// `notifyDataBySignature` (`spec.md` §4.7 "Network fan-out"): feeds
    /// already-materialized data straight to every watcher on `signature`,
    /// with recycling against each watcher's own prior snapshot, and flags
    /// them to skip the dependency-driven re-emit in the same microtask.
    pub fn notify_data_by_signature(
        &self,
        signature: &Signature,
        data: &MaterializedValue,
        fingerprints: Option<&FingerprintTree>,
    ) {
        let ids: Vec<WatcherId> = self.signature_index.lock().get(signature).cloned().unwrap_or_default().into_iter().collect();
        for id in ids {
            let mut watchers = self.watchers.lock();
            let Some(watcher) = watchers.get_mut(&id) else { continue };
            let recycled = recycle(data, fingerprints.unwrap_or(&FingerprintTree::Leaf(cachebay_types::Fingerprint::ZERO)), watcher.last_data.as_ref(), watcher.last_fingerprints.as_ref());
            let changed = !recycled.is_same_reference(watcher.last_data.as_ref().unwrap_or(&MaterializedValue::null()));
            watcher.last_data = Some(recycled.clone());
            watcher.last_fingerprints = fingerprints.cloned();
            watcher.suppress_next = true;
            let on_data = watcher.on_data.clone();
            drop(watchers);

            if changed {
                on_data(&recycled);
            }
        }
    }

    pub fn notify_error_by_signature(&self, signature: &Signature, error: &Json) {
        let ids: Vec<WatcherId> = self.signature_index.lock().get(signature).cloned().unwrap_or_default().into_iter().collect();
        for id in ids {
            let on_error = self.watchers.lock().get(&id).and_then(|w| w.on_error.clone());
            if let Some(on_error) = on_error {
                on_error(error);
            }
        }
    }

    pub fn evict_all(&self) {
        self.watchers.lock().clear();
        self.dep_index.lock().clear();
        self.signature_index.lock().clear();
        self.pending.lock().clear();
    }

    fn index_dependencies(&self, id: WatcherId, deps: &HashSet<RecordId>) {
        let mut dep_index = self.dep_index.lock();
        for dep in deps {
            dep_index.entry(dep.clone()).or_default().insert(id);
        }
    }

    fn deindex_dependencies(&self, id: WatcherId, deps: &HashSet<RecordId>) {
        let mut dep_index = self.dep_index.lock();
        for dep in deps {
            if let Some(bucket) = dep_index.get_mut(dep) {
                bucket.remove(&id);
                if bucket.is_empty() {
                    dep_index.remove(dep);
                }
            }
        }
    }

    fn evict_materializer_entry(&self, watcher: &Watcher) {
        let vars_key: VariablesKey = watcher.plan.make_vars_key(true, &watcher.variables);
        self.materializer.invalidate(&watcher.plan, Mode::Canonical, true, watcher.root_id.as_ref(), &vars_key);
    }

    fn schedule_drain(&self) {
        let Some(weak) = self.self_ref.get() else { return };
        let Some(strong) = weak.upgrade() else { return };
        self.scheduler.schedule(Box::new(move || strong.drain()));
    }

    /// Drains the pending watcher set: re-materializes each with fresh
    /// data (`preferCache=false, updateCache=true`), recycles against the
    /// watcher's prior snapshot, and emits only when identity differs,
    /// unless the watcher's network fan-out already emitted this round
    /// (`spec.md` §4.7 "Invalidation broadcast", §5 "Ordering guarantees").
    fn drain(&self) {
        if self.flushing.swap(true, Ordering::SeqCst) {
            return;
        }

        let ids: HashSet<WatcherId> = std::mem::take(&mut *self.pending.lock());
        for id in ids {
            self.redrive(id);
        }

        self.flushing.store(false, Ordering::SeqCst);
    }

    fn redrive(&self, id: WatcherId) {
        let (plan, variables, root_id, skip) = {
            let mut watchers = self.watchers.lock();
            let Some(watcher) = watchers.get_mut(&id) else { return };
            let skip = std::mem::replace(&mut watcher.suppress_next, false);
            (watcher.plan.clone(), watcher.variables.clone(), watcher.root_id.clone(), skip)
        };

        let result = self.materializer.materialize(
            &self.store,
            &self.identity,
            &plan,
            &variables,
            MaterializeOptions { mode: Mode::Canonical, root_id: root_id.clone(), prefer_cache: false, ..MaterializeOptions::default() },
        );

        let mut watchers = self.watchers.lock();
        let Some(watcher) = watchers.get_mut(&id) else { return };

        self.deindex_dependencies(id, &watcher.deps);
        watcher.deps = result.dependencies.clone();
        drop(watchers);
        self.index_dependencies(id, &result.dependencies);
        let mut watchers = self.watchers.lock();
        let Some(watcher) = watchers.get_mut(&id) else { return };

        let recycled = recycle(&result.data, result.fingerprints.as_ref().unwrap_or(&FingerprintTree::Leaf(cachebay_types::Fingerprint::ZERO)), watcher.last_data.as_ref(), watcher.last_fingerprints.as_ref());
        let changed = !recycled.is_same_reference(watcher.last_data.as_ref().unwrap_or(&MaterializedValue::null()));
        watcher.last_data = Some(recycled.clone());
        watcher.last_fingerprints = result.fingerprints;

        if skip || !changed {
            return;
        }
        let on_data = watcher.on_data.clone();
        drop(watchers);
        on_data(&recycled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize;
    use crate::scheduler::immediate;
    use cachebay_types::{FieldValue, Record};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn no_args() -> (
        Arc<dyn Fn(&Variables) -> serde_json::Map<String, Json> + Send + Sync>,
        Arc<dyn Fn(&Variables) -> String + Send + Sync>,
    ) {
        (Arc::new(|_: &Variables| serde_json::Map::new()), Arc::new(|_: &Variables| "{}".to_string()))
    }

    fn scalar_field(name: &str) -> cachebay_types::SelectionField {
        let (build, stringify) = no_args();
        cachebay_types::SelectionField {
            response_key: name.into(),
            field_name: name.into(),
            type_condition: None,
            build_args: build,
            stringify_args: stringify,
            selection: None,
            connection: None,
        }
    }

    fn object_field(name: &str, selection: cachebay_types::Selection) -> cachebay_types::SelectionField {
        let (build, stringify) = no_args();
        cachebay_types::SelectionField {
            response_key: name.into(),
            field_name: name.into(),
            type_condition: None,
            build_args: build,
            stringify_args: stringify,
            selection: Some(selection),
            connection: None,
        }
    }

    struct StubPlan {
        root: cachebay_types::Selection,
    }

    impl Plan for StubPlan {
        fn operation(&self) -> cachebay_types::OperationKind {
            cachebay_types::OperationKind::Query
        }
        fn operation_name(&self) -> &str {
            "Stub"
        }
        fn root(&self) -> &cachebay_types::Selection {
            &self.root
        }
        fn make_signature(&self, is_canonical: bool, _variables: &Variables) -> Signature {
            Signature::new(format!("Stub:{is_canonical}"))
        }
        fn make_vars_key(&self, is_canonical: bool, _variables: &Variables) -> VariablesKey {
            VariablesKey::new(format!("Stub:{is_canonical}"))
        }
        fn get_dependencies(&self, _is_canonical: bool, _variables: &Variables) -> HashSet<RecordId> {
            HashSet::new()
        }
    }

    #[test]
    fn dependency_driven_change_redrives_watcher() {
        let store = Store::new(immediate());
        let identity = Arc::new(IdentityConfig::new());
        let materializer = Arc::new(Materializer::new());
        let watchers = Watchers::new(store.clone(), materializer, identity.clone(), immediate());
        store.set_on_change(Arc::new({
            let watchers = watchers.clone();
            move |touched: &HashSet<RecordId>| watchers.on_store_change(touched)
        }));

        let user_selection = vec![scalar_field("id"), scalar_field("email")];
        let root_selection = vec![object_field("viewer", user_selection)];
        let vars = Variables::new();
        normalize(
            &store,
            &identity,
            &RecordId::root(),
            &root_selection,
            &vars,
            &json!({"viewer": {"__typename": "User", "id": "u1", "email": "a@x"}}),
        );

        let plan: Arc<dyn Plan> = Arc::new(StubPlan { root: root_selection });
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = watchers.watch(
            plan,
            vars,
            None,
            Mode::Canonical,
            true,
            Arc::new(move |data: &MaterializedValue| sink.lock().unwrap().push(data.to_json())),
            None,
        );

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap()[0]["viewer"]["email"], json!("a@x"));

        let mut patch = Record::new();
        patch.insert("email", FieldValue::Scalar(json!("b@y")));
        store.put(&RecordId::entity("User", "u1"), patch);

        let snapshots = seen.lock().unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1]["viewer"]["email"], json!("b@y"));
        drop(snapshots);

        handle.unsubscribe();
    }

    #[test]
    fn unsubscribe_is_idempotent_and_stops_delivery() {
        let store = Store::new(immediate());
        let identity = Arc::new(IdentityConfig::new());
        let materializer = Arc::new(Materializer::new());
        let watchers = Watchers::new(store.clone(), materializer, identity.clone(), immediate());
        store.set_on_change(Arc::new({
            let watchers = watchers.clone();
            move |touched: &HashSet<RecordId>| watchers.on_store_change(touched)
        }));

        let root_selection = vec![scalar_field("serverTime")];
        let plan: Arc<dyn Plan> = Arc::new(StubPlan { root: root_selection });
        let count = Arc::new(AtomicU64::new(0));
        let sink = count.clone();
        let handle = watchers.watch(
            plan,
            Variables::new(),
            None,
            Mode::Canonical,
            true,
            Arc::new(move |_data: &MaterializedValue| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );

        handle.unsubscribe();
        handle.unsubscribe();

        let mut patch = Record::new();
        patch.insert("serverTime", FieldValue::Scalar(json!("t1")));
        store.put(&RecordId::root(), patch);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
