//! Wiring: constructs the engine's components, routes `Store` change
//! notifications to `Watchers` (and, when configured, to persistent
//! storage), and exposes the public callable surface from `spec.md` §6
//! (`identify`, `read*`/`write*`/`watch*`, `modifyOptimistic`,
//! `execute*`, `dehydrate`/`hydrate`, `evictAll`/`dispose`).
//!
//! Follows the same `Arc<Self>` + `OnceLock<Weak<Self>>` shape `Store` and
//! `Watchers` use for their own self-referential callbacks (`store.rs`,
//! `watchers.rs`): `Client::new` hands the constructed `Arc<Client>` a weak
//! handle to itself before installing `Store::set_on_change`, so the
//! callback can reach back into `Client` without an ownership cycle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use cachebay_types::{
    CachePolicy, IdentityConfig, InterfaceRegistry, Mode, OperationKind, OperationRootKind, Plan,
    RecordId, Selection, Signature, Source, Variables,
};
use parking_lot::Mutex;
use serde_json::Value as Json;

use crate::canonical::update_connection;
use crate::config::{CachebayConfig, TransportRequest};
use crate::error::{ConfigurationError, TransportError};
use crate::materializer::{MaterializeOptions, Materializer};
use crate::normalizer::normalize;
use crate::optimistic::{Modification, Optimistic, Phase, ReplayHint, Transaction};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::watchers::{OnData, OnError, Watchers};

pub use crate::watchers::WatchHandle;

/// A live `executeQuery`/`executeMutation`/`executeSubscription` call
/// (`spec.md` §6). `Transport` only acknowledges acceptance synchronously
/// (`spec.md` §1 "does not define their internals"): the response body
/// arrives later, out of band, through `Client::handle_network_data` /
/// `Client::handle_network_error`, matched back to the right watchers by
/// this handle's `signature`.
#[derive(Clone, Debug)]
pub struct QueryHandle {
    pub signature: Signature,
    pub operation_name: String,
}

/// Implemented by the engine's top-level resource so a host can release
/// it deterministically (`spec.md` §6 `dispose() → void`) rather than
/// relying on `Drop` alone — matters for the storage adapter, which needs
/// its own `dispose()` called to flush/close the underlying connection.
pub trait Disposable {
    fn dispose(&self);
}

#[cfg(feature = "storage")]
type StorageSlot = Mutex<Option<Box<dyn cachebay_storage::StorageAdapter>>>;

/// The engine (`spec.md` §2 "Client"): constructs `Store`/`Canonical`/
/// `Materializer`/`Optimistic`/`Watchers` and wires `Store` change
/// notifications through to `Watchers`.
pub struct Client {
    config: CachebayConfig,
    identity: Arc<IdentityConfig>,
    store: Arc<Store>,
    optimistic: Arc<Optimistic>,
    materializer: Arc<Materializer>,
    watchers: Arc<Watchers>,
    #[cfg(feature = "storage")]
    storage: StorageSlot,
    hydrating: AtomicBool,
    self_ref: OnceLock<Weak<Client>>,
}

#[cfg(not(target_arch = "wasm32"))]
fn default_scheduler() -> Arc<dyn Scheduler> {
    crate::scheduler::tokio_scheduler()
}

#[cfg(target_arch = "wasm32")]
fn default_scheduler() -> Arc<dyn Scheduler> {
    crate::scheduler::wasm_scheduler()
}

/// The synthetic root a normalized write/materialize pass starts from for
/// this plan's operation kind (`spec.md` §3 "RecordId").
fn operation_root(plan: &Arc<dyn Plan>) -> RecordId {
    match plan.operation() {
        OperationKind::Query => RecordId::root(),
        OperationKind::Mutation => {
            RecordId::operation_root(OperationRootKind::Mutation, plan.operation_name())
        }
        OperationKind::Subscription => {
            RecordId::operation_root(OperationRootKind::Subscription, plan.operation_name())
        }
    }
}

impl Client {
    /// Constructs the engine with the default per-target scheduler
    /// (`spec.md` §9 "Microtask batching", `SPEC_FULL.md` §5).
    pub fn new(config: CachebayConfig) -> Result<Arc<Self>, ConfigurationError> {
        Self::with_scheduler(config, default_scheduler())
    }

    /// As [`Client::new`], but with an explicit scheduler — the escape
    /// hatch tests and server-side-rendering callers use to pass
    /// [`crate::scheduler::immediate`] instead of the Tokio/wasm default.
    pub fn with_scheduler(
        config: CachebayConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Arc<Self>, ConfigurationError> {
        config.validate()?;

        let mut interfaces = InterfaceRegistry::new();
        for (name, implementers) in &config.interfaces {
            let refs: Vec<&str> = implementers.iter().map(String::as_str).collect();
            interfaces.register(name.clone(), &refs);
        }
        let identity = Arc::new(IdentityConfig { keys: config.keys.clone(), interfaces });

        let store = Store::new(scheduler.clone());
        let materializer = Arc::new(Materializer::new());
        let optimistic = Optimistic::new();
        let watchers = Watchers::new(store.clone(), materializer.clone(), identity.clone(), scheduler);

        #[cfg(feature = "storage")]
        let mut storage_adapter = match &config.storage {
            Some(factory) => Some(
                factory
                    .open()
                    .map_err(|e| ConfigurationError::StorageUnavailable { reason: e.to_string() })?,
            ),
            None => None,
        };

        // Loaded before `set_on_change` is installed below, so replaying
        // persisted records doesn't re-persist them right back or fire
        // premature watcher notifications for a client nobody has
        // subscribed to yet.
        #[cfg(feature = "storage")]
        if let Some(adapter) = storage_adapter.as_mut() {
            let loaded = adapter
                .load()
                .map_err(|e| ConfigurationError::StorageUnavailable { reason: e.to_string() })?;
            let count = loaded.len();
            for (id, _version, record) in loaded {
                store.replace(&id, record);
            }
            tracing::info!(count, "client: hydrated records from storage");
        }

        let client = Arc::new(Self {
            config,
            identity,
            store: store.clone(),
            optimistic,
            materializer,
            watchers: watchers.clone(),
            #[cfg(feature = "storage")]
            storage: Mutex::new(storage_adapter),
            hydrating: AtomicBool::new(false),
            self_ref: OnceLock::new(),
        });
        let _ = client.self_ref.set(Arc::downgrade(&client));

        store.set_on_change(Arc::new({
            let weak = Arc::downgrade(&client);
            move |touched: &HashSet<RecordId>| {
                let Some(client) = weak.upgrade() else { return };
                client.watchers.on_store_change(touched);
                #[cfg(feature = "storage")]
                client.persist_touched(touched);
            }
        }));

        tracing::info!("client: constructed");
        Ok(client)
    }

    /// `identify(obj) → recordId | null` (`spec.md` §6).
    pub fn identify(&self, value: &Json) -> Option<RecordId> {
        self.identity.identify(value)
    }

    /// `readFragment({id, fragment, variables?}) → value or null`.
    pub fn read_fragment(&self, id: RecordId, fragment: &Arc<dyn Plan>, variables: Variables) -> Option<Json> {
        let result = self.materializer.materialize(
            &self.store,
            &self.identity,
            fragment,
            &variables,
            MaterializeOptions {
                mode: Mode::Canonical,
                root_id: Some(id),
                fingerprint: false,
                prefer_cache: false,
                update_cache: false,
            },
        );
        match result.source {
            Source::None => None,
            _ => Some(result.data.to_json()),
        }
    }

    /// `writeFragment({id, fragment, data, variables?})`.
    pub fn write_fragment(&self, id: RecordId, fragment: &Arc<dyn Plan>, variables: Variables, data: Json) {
        self.ingest(&id, fragment.root(), &variables, &data);
    }

    /// `watchFragment({id, fragment, variables?, onData, onError?, immediate?})`.
    pub fn watch_fragment(
        self: &Arc<Self>,
        id: RecordId,
        fragment: Arc<dyn Plan>,
        variables: Variables,
        on_data: Arc<OnData>,
        on_error: Option<Arc<OnError>>,
        immediate: bool,
    ) -> WatchHandle {
        self.watchers.watch(fragment, variables, Some(id), Mode::Canonical, immediate, on_data, on_error)
    }

    /// `readQuery({query, variables?}) → value or null`.
    pub fn read_query(&self, plan: &Arc<dyn Plan>, variables: Variables) -> Option<Json> {
        let result = self.materializer.materialize(
            &self.store,
            &self.identity,
            plan,
            &variables,
            MaterializeOptions {
                mode: Mode::Canonical,
                root_id: None,
                fingerprint: false,
                prefer_cache: false,
                update_cache: false,
            },
        );
        match result.source {
            Source::None => None,
            _ => Some(result.data.to_json()),
        }
    }

    /// `writeQuery({query, variables?, data})`.
    pub fn write_query(&self, plan: &Arc<dyn Plan>, variables: Variables, data: Json) {
        self.ingest(&RecordId::root(), plan.root(), &variables, &data);
    }

    /// `watchQuery({query, variables?, onData, onError?, immediate?})`.
    pub fn watch_query(
        self: &Arc<Self>,
        plan: Arc<dyn Plan>,
        variables: Variables,
        on_data: Arc<OnData>,
        on_error: Option<Arc<OnError>>,
        immediate: bool,
    ) -> WatchHandle {
        self.watchers.watch(plan, variables, None, Mode::Canonical, immediate, on_data, on_error)
    }

    /// `modifyOptimistic(builder) → {commit(data?), revert()}` (`spec.md` §6).
    pub fn modify_optimistic(
        &self,
        builder: impl Fn(&mut Transaction, Phase, Option<&Json>) + Send + Sync + 'static,
    ) -> Modification {
        self.optimistic.modify(&self.store, &self.identity, builder)
    }

    /// `executeQuery({...})` (`spec.md` §6): consults `cachePolicy` to
    /// decide whether the cache alone can satisfy this read, dispatching
    /// to `transport.http` only when the policy requires it. The response
    /// body arrives later through [`Client::handle_network_data`].
    pub fn execute_query(&self, plan: Arc<dyn Plan>, document: String, variables: Variables) -> QueryHandle {
        let signature = plan.make_signature(true, &variables);

        match self.config.cache_policy {
            CachePolicy::CacheOnly => {
                let result = self.materialize_for_operation(&plan, &variables, false);
                if result.source == Source::None {
                    self.watchers.notify_error_by_signature(
                        &signature,
                        &serde_json::json!({"kind": "cache-miss", "misses": result.outcome.miss.len()}),
                    );
                }
            }
            CachePolicy::CacheFirst => {
                let result = self.materialize_for_operation(&plan, &variables, false);
                if result.source == Source::None {
                    self.dispatch_transport(&plan, document, &variables);
                }
            }
            CachePolicy::CacheAndNetwork | CachePolicy::NetworkOnly => {
                self.dispatch_transport(&plan, document, &variables);
            }
        }

        QueryHandle { signature, operation_name: plan.operation_name().to_string() }
    }

    /// `executeMutation({...})` (`spec.md` §6): mutations always reach the
    /// transport; `cachePolicy` governs reads, not writes.
    pub fn execute_mutation(&self, plan: Arc<dyn Plan>, document: String, variables: Variables) -> QueryHandle {
        let signature = plan.make_signature(true, &variables);
        self.dispatch_transport(&plan, document, &variables);
        QueryHandle { signature, operation_name: plan.operation_name().to_string() }
    }

    /// `executeSubscription({...})` (`spec.md` §6): prefers `transport.ws`
    /// when the host supplied one, falling back to `transport.http`.
    pub fn execute_subscription(&self, plan: Arc<dyn Plan>, document: String, variables: Variables) -> QueryHandle {
        let signature = plan.make_signature(true, &variables);
        self.dispatch_subscription(&plan, document, &variables);
        QueryHandle { signature, operation_name: plan.operation_name().to_string() }
    }

    /// Completes an `execute*` round trip once the host's transport has
    /// resolved: normalizes `data` into the store (folding any connection
    /// pages into their canonical record and replaying optimistic layers
    /// above it), then feeds the freshly materialized result straight to
    /// every watcher registered on `handle.signature` (`spec.md` §4.7
    /// "Network fan-out").
    pub fn handle_network_data(&self, handle: &QueryHandle, plan: &Arc<dyn Plan>, variables: &Variables, data: Json) {
        let root = operation_root(plan);
        self.ingest(&root, plan.root(), variables, &data);

        let result = self.materialize_for_operation(plan, variables, true);
        self.watchers.notify_data_by_signature(&handle.signature, &result.data, result.fingerprints.as_ref());
    }

    /// Routes a transport failure to every watcher on `handle.signature`
    /// (`spec.md` §7 "TransportError ... does not invalidate the store").
    pub fn handle_network_error(&self, handle: &QueryHandle, error: TransportError) {
        self.watchers.notify_error_by_signature(&handle.signature, &error.to_json());
    }

    /// `dehydrate() → snapshot` (`spec.md` §6, §9 "Wire format"). Flattens
    /// the `cursorIndex`/`edgeCounter` sidecars (themselves ordinary
    /// `Store` records, per `canonical.rs`) into `WireSnapshot`'s
    /// dedicated fields rather than letting them ride along inside
    /// `records`, so the portable format gives them first-class shape
    /// exactly as `spec.md` §9 asks.
    pub fn dehydrate(&self) -> Result<String, cachebay_wire::DehydrateError> {
        self.store.flush();

        let mut records = Vec::new();
        let mut cursor_index_entries = Vec::new();
        let mut edge_counters = Vec::new();

        for id in self.store.keys() {
            let Some(record) = self.store.get(&id) else { continue };
            let version = self.store.version(&id);

            if let Some(canonical_key) = id.as_str().strip_suffix("::cursorIndex") {
                for (cursor, position) in &record.fields {
                    if let Some(pos) = position.as_scalar().and_then(Json::as_u64) {
                        cursor_index_entries.push(cachebay_wire::WireCursorEntry {
                            canonical_key: canonical_key.to_string(),
                            cursor: cursor.clone(),
                            position: pos,
                        });
                    }
                }
                continue;
            }

            if let Some(canonical_key) = id.as_str().strip_suffix("::edgeCounter") {
                if let Some(next_index) =
                    record.get("nextIndex").and_then(cachebay_types::FieldValue::as_scalar).and_then(Json::as_u64)
                {
                    edge_counters.push(cachebay_wire::WireEdgeCounter {
                        canonical_key: canonical_key.to_string(),
                        next_index,
                    });
                }
                continue;
            }

            records.push(cachebay_wire::record_to_wire(&id, version, &record)?);
        }

        let snapshot = cachebay_wire::WireSnapshot { records, cursor_index_entries, edge_counters };
        cachebay_wire::dehydrate(&snapshot)
    }

    /// `hydrate(snapshot)` (`spec.md` §6): replaces the store's full
    /// contents with `snapshot`'s, including sidecars. `isHydrating()`
    /// reports `true` for the duration of the call.
    pub fn hydrate(&self, snapshot: &str) -> Result<(), cachebay_wire::DehydrateError> {
        self.hydrating.store(true, Ordering::SeqCst);
        let result = self.apply_snapshot(snapshot);
        self.hydrating.store(false, Ordering::SeqCst);
        result
    }

    pub fn is_hydrating(&self) -> bool {
        self.hydrating.load(Ordering::SeqCst)
    }

    /// `evictAll() → void` (`spec.md` §6). Synchronous even with storage
    /// configured: unlike the source's IndexedDB-backed adapters, the
    /// `rusqlite` storage adapter this port uses is synchronous, so there
    /// is no async boundary to cross (`SPEC_FULL.md` §6 "Persistence").
    pub fn evict_all(&self) {
        self.store.evict_all();
        self.watchers.evict_all();
        self.optimistic.evict_all();
        self.materializer.evict_all();

        #[cfg(feature = "storage")]
        if let Some(adapter) = self.storage.lock().as_mut() {
            if let Err(err) = adapter.evict_all() {
                tracing::warn!(error = %err, "client: failed to evict persistent storage");
            }
        }

        tracing::info!("client: evicted all state");
    }

    fn materialize_for_operation(
        &self,
        plan: &Arc<dyn Plan>,
        variables: &Variables,
        update_cache: bool,
    ) -> crate::materializer::MaterializeResult {
        let root_id = match plan.operation() {
            OperationKind::Query => None,
            OperationKind::Mutation | OperationKind::Subscription => Some(operation_root(plan)),
        };
        self.materializer.materialize(
            &self.store,
            &self.identity,
            plan,
            variables,
            MaterializeOptions { mode: Mode::Canonical, root_id, fingerprint: true, prefer_cache: false, update_cache },
        )
    }

    /// Normalizes `data` under `root`, folds every connection page it
    /// collects into its canonical record, and replays pending optimistic
    /// layers scoped to the canonical keys just touched (`spec.md` §4.3
    /// step 6, §4.4 "After traversal").
    fn ingest(&self, root: &RecordId, selection: &Selection, variables: &Variables, data: &Json) {
        let page_updates = normalize(&self.store, &self.identity, root, selection, variables, data);

        let touched_connections: Vec<RecordId> =
            page_updates.iter().map(|update| update_connection(&self.store, update)).collect();

        if !touched_connections.is_empty() {
            self.optimistic.replay_optimistic(
                &self.store,
                &self.identity,
                Some(&ReplayHint { ids: &touched_connections }),
            );
        }

        self.store.flush();
    }

    fn dispatch_transport(&self, plan: &Arc<dyn Plan>, document: String, variables: &Variables) {
        let Some(transport) = &self.config.transport else { return };
        let request = TransportRequest {
            operation_name: plan.operation_name().to_string(),
            document,
            variables: variables.0.clone(),
        };
        let response = (transport.http)(request);
        if !response.accepted {
            tracing::warn!(operation = plan.operation_name(), "client: transport declined request");
        }
    }

    fn dispatch_subscription(&self, plan: &Arc<dyn Plan>, document: String, variables: &Variables) {
        let Some(transport) = &self.config.transport else { return };
        let request = TransportRequest {
            operation_name: plan.operation_name().to_string(),
            document,
            variables: variables.0.clone(),
        };
        let response = match &transport.ws {
            Some(ws) => ws(request),
            None => (transport.http)(request),
        };
        if !response.accepted {
            tracing::warn!(operation = plan.operation_name(), "client: transport declined subscription");
        }
    }

    fn apply_snapshot(&self, snapshot: &str) -> Result<(), cachebay_wire::DehydrateError> {
        let wire = cachebay_wire::hydrate(snapshot)?;
        self.store.evict_all();

        for wire_record in &wire.records {
            let (id, _version, record) = cachebay_wire::record_from_wire(wire_record)?;
            self.store.replace(&id, record);
        }

        for entry in &wire.cursor_index_entries {
            let canonical_key = RecordId::from(entry.canonical_key.clone());
            let sidecar_id = RecordId::cursor_index_sidecar(&canonical_key);
            let mut existing = self.store.get(&sidecar_id).unwrap_or_default();
            existing.insert(entry.cursor.clone(), cachebay_types::FieldValue::Scalar(Json::from(entry.position)));
            self.store.replace(&sidecar_id, existing);
        }

        for entry in &wire.edge_counters {
            let canonical_key = RecordId::from(entry.canonical_key.clone());
            let mut record = cachebay_types::Record::new();
            record.insert("nextIndex", cachebay_types::FieldValue::Scalar(Json::from(entry.next_index)));
            self.store.replace(&RecordId::edge_counter_sidecar(&canonical_key), record);
        }

        self.store.flush();
        Ok(())
    }

    #[cfg(feature = "storage")]
    fn persist_touched(&self, touched: &HashSet<RecordId>) {
        let mut guard = self.storage.lock();
        let Some(adapter) = guard.as_mut() else { return };
        for id in touched {
            match self.store.get(id) {
                Some(record) => {
                    let version = self.store.version(id);
                    if let Err(err) = adapter.put(id, version, &record) {
                        tracing::warn!(record_id = %id, error = %err, "client: failed to persist record");
                    }
                }
                None => {
                    if let Err(err) = adapter.remove(id) {
                        tracing::warn!(record_id = %id, error = %err, "client: failed to persist removal");
                    }
                }
            }
        }
    }
}

impl Disposable for Client {
    /// `dispose() → void` (`spec.md` §6): drops all in-memory state and,
    /// when storage is configured, calls its own `dispose()` so the
    /// underlying connection closes deterministically rather than on
    /// whatever schedule `Drop` happens to run.
    fn dispose(&self) {
        self.evict_all();

        #[cfg(feature = "storage")]
        if let Some(adapter) = self.storage.lock().take() {
            if let Err(err) = adapter.dispose() {
                tracing::warn!(error = %err, "client: failed to dispose persistent storage");
            }
        }

        tracing::info!("client: disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::immediate;
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
        operation: OperationKind,
        name: String,
        root: cachebay_types::Selection,
    }

    impl Plan for StubPlan {
        fn operation(&self) -> OperationKind {
            self.operation
        }
        fn operation_name(&self) -> &str {
            &self.name
        }
        fn root(&self) -> &cachebay_types::Selection {
            &self.root
        }
        fn make_signature(&self, is_canonical: bool, _variables: &Variables) -> Signature {
            Signature::new(format!("{}:{is_canonical}", self.name))
        }
        fn make_vars_key(&self, is_canonical: bool, _variables: &Variables) -> cachebay_types::VariablesKey {
            cachebay_types::VariablesKey::new(format!("{}:{is_canonical}", self.name))
        }
        fn get_dependencies(&self, _is_canonical: bool, _variables: &Variables) -> HashSet<RecordId> {
            HashSet::new()
        }
    }

    fn test_transport() -> crate::config::Transport {
        crate::config::Transport {
            http: Arc::new(|_req| crate::config::TransportResponse { accepted: true }),
            ws: None,
        }
    }

    fn test_client() -> Arc<Client> {
        let config = CachebayConfig::new(test_transport());
        Client::with_scheduler(config, immediate()).expect("valid config")
    }

    #[test]
    fn new_requires_a_transport() {
        let err = CachebayConfig { transport: None, ..CachebayConfig::new(test_transport()) }.validate();
        assert_eq!(err, Err(ConfigurationError::MissingTransport));
    }

    #[test]
    fn write_query_then_read_query_round_trips() {
        let client = test_client();
        let plan: Arc<dyn Plan> =
            Arc::new(StubPlan { operation: OperationKind::Query, name: "Viewer".into(), root: vec![object_field("viewer", vec![scalar_field("id"), scalar_field("email")])] });

        client.write_query(&plan, Variables::new(), json!({"viewer": {"__typename": "User", "id": "u1", "email": "a@x"}}));

        let data = client.read_query(&plan, Variables::new()).expect("cache hit");
        assert_eq!(data["viewer"]["email"], json!("a@x"));
    }

    #[test]
    fn write_fragment_then_read_fragment_round_trips() {
        let client = test_client();
        let fragment: Arc<dyn Plan> =
            Arc::new(StubPlan { operation: OperationKind::Query, name: "UserFragment".into(), root: vec![scalar_field("email")] });

        client.write_fragment(
            RecordId::entity("User", "u1"),
            &fragment,
            Variables::new(),
            json!({"__typename": "User", "id": "u1", "email": "a@x"}),
        );

        let data = client.read_fragment(RecordId::entity("User", "u1"), &fragment, Variables::new()).unwrap();
        assert_eq!(data["email"], json!("a@x"));
    }

    #[test]
    fn read_fragment_misses_for_unknown_entity() {
        let client = test_client();
        let fragment: Arc<dyn Plan> =
            Arc::new(StubPlan { operation: OperationKind::Query, name: "UserFragment".into(), root: vec![scalar_field("email")] });

        assert!(client.read_fragment(RecordId::entity("User", "ghost"), &fragment, Variables::new()).is_none());
    }

    #[test]
    fn watch_query_emits_on_dependency_change() {
        let client = test_client();
        let plan: Arc<dyn Plan> =
            Arc::new(StubPlan { operation: OperationKind::Query, name: "Viewer".into(), root: vec![object_field("viewer", vec![scalar_field("email")])] });

        client.write_query(&plan, Variables::new(), json!({"viewer": {"__typename": "User", "id": "u1", "email": "a@x"}}));

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = client.watch_query(
            plan.clone(),
            Variables::new(),
            Arc::new(move |data: &crate::materialized::MaterializedValue| sink.lock().unwrap().push(data.to_json())),
            None,
            true,
        );

        assert_eq!(seen.lock().unwrap().len(), 1);

        client.write_query(&plan, Variables::new(), json!({"viewer": {"__typename": "User", "id": "u1", "email": "b@y"}}));

        let snapshots = seen.lock().unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1]["viewer"]["email"], json!("b@y"));
        drop(snapshots);

        handle.unsubscribe();
    }

    #[test]
    fn handle_network_error_routes_typed_transport_error_to_watcher() {
        let client = test_client();
        let plan: Arc<dyn Plan> =
            Arc::new(StubPlan { operation: OperationKind::Query, name: "Viewer".into(), root: vec![object_field("viewer", vec![scalar_field("email")])] });

        let handle = client.execute_query(plan.clone(), "query Viewer { viewer { email } }".into(), Variables::new());

        let errors = Arc::new(StdMutex::new(Vec::new()));
        let sink = errors.clone();
        let watch = client.watch_query(
            plan,
            Variables::new(),
            Arc::new(|_data: &crate::materialized::MaterializedValue| {}),
            Some(Arc::new(move |err: &Json| sink.lock().unwrap().push(err.clone()))),
            false,
        );

        client.handle_network_error(&handle, TransportError::Http { status: Some(500), message: "boom".into() });

        let seen = errors.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["kind"], json!("transport-http"));
        assert_eq!(seen[0]["status"], json!(500));
        drop(seen);

        watch.unsubscribe();
    }

    #[test]
    fn modify_optimistic_commit_leaves_state_unchanged_from_reverted_view() {
        let client = test_client();
        let fragment: Arc<dyn Plan> =
            Arc::new(StubPlan { operation: OperationKind::Query, name: "UserFragment".into(), root: vec![scalar_field("email")] });

        client.write_fragment(
            RecordId::entity("User", "u1"),
            &fragment,
            Variables::new(),
            json!({"__typename": "User", "id": "u1", "email": "a@x"}),
        );

        let target = RecordId::entity("User", "u1");
        let modification = client.modify_optimistic(move |txn, _phase, _data| {
            let mut patch = cachebay_types::Record::new();
            patch.insert("email", cachebay_types::FieldValue::Scalar(json!("optimistic@x")));
            txn.patch(&target, patch, crate::optimistic::WriteMode::Merge);
        });

        assert_eq!(
            client.read_fragment(RecordId::entity("User", "u1"), &fragment, Variables::new()).unwrap()["email"],
            json!("optimistic@x")
        );

        modification.revert();

        assert_eq!(
            client.read_fragment(RecordId::entity("User", "u1"), &fragment, Variables::new()).unwrap()["email"],
            json!("a@x")
        );
    }

    #[test]
    fn dehydrate_hydrate_round_trips_a_fragment_write() {
        let client = test_client();
        let fragment: Arc<dyn Plan> =
            Arc::new(StubPlan { operation: OperationKind::Query, name: "UserFragment".into(), root: vec![scalar_field("email")] });

        client.write_fragment(
            RecordId::entity("User", "u1"),
            &fragment,
            Variables::new(),
            json!({"__typename": "User", "id": "u1", "email": "a@x"}),
        );

        let snapshot = client.dehydrate().expect("dehydrate succeeds");

        let other = test_client();
        other.hydrate(&snapshot).expect("hydrate succeeds");

        let data = other.read_fragment(RecordId::entity("User", "u1"), &fragment, Variables::new()).unwrap();
        assert_eq!(data["email"], json!("a@x"));
        assert!(!other.is_hydrating());
    }

    #[test]
    fn evict_all_clears_cached_state() {
        let client = test_client();
        let fragment: Arc<dyn Plan> =
            Arc::new(StubPlan { operation: OperationKind::Query, name: "UserFragment".into(), root: vec![scalar_field("email")] });

        client.write_fragment(
            RecordId::entity("User", "u1"),
            &fragment,
            Variables::new(),
            json!({"__typename": "User", "id": "u1", "email": "a@x"}),
        );
        assert!(client.read_fragment(RecordId::entity("User", "u1"), &fragment, Variables::new()).is_some());

        client.evict_all();

        assert!(client.read_fragment(RecordId::entity("User", "u1"), &fragment, Variables::new()).is_none());
    }
}
