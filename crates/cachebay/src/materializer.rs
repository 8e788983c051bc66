//! Reconstructs a response tree (plus its fingerprint tree and dependency
//! set) from the flat [`Store`] by walking a [`Plan`] (`spec.md` §4.5).
//!
//! Mirrors the Normalizer's traversal in reverse: where `normalizer.rs`
//! turns a response tree into store writes, this turns store reads back
//! into a response tree. A result is cached per `(plan, mode,
//! fingerprint-flag, root, variablesKey)` so a watcher re-reading after an
//! unrelated store change doesn't re-walk the whole plan for nothing.

use std::collections::HashSet;
use std::sync::Arc;

use cachebay_types::{
    mix, CacheMiss, Fingerprint, IdentityConfig, MissSink, Misses, Mode, Plan, Record, RecordId,
    Selection, SelectionField, Source, Variables, VariablesKey,
};
use parking_lot::Mutex;
use serde_json::Value as Json;

use crate::canonical::{connection_filters, stable_json_stringify};
use crate::keys::field_storage_key;
use crate::materialized::{root_fingerprint, FingerprintTree, MaterializedValue};
use crate::store::Store;

/// Request shape for [`Materializer::materialize`].
pub struct MaterializeOptions {
    pub mode: Mode,
    /// `None` for a query/mutation/subscription root; `Some(entity_id)` for
    /// a fragment read (`spec.md` §4.4 "Rules", §6 `readFragment`).
    pub root_id: Option<RecordId>,
    pub fingerprint: bool,
    pub prefer_cache: bool,
    pub update_cache: bool,
}

impl Default for MaterializeOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Canonical,
            root_id: None,
            fingerprint: true,
            prefer_cache: true,
            update_cache: true,
        }
    }
}

/// Outcome flags alongside the accumulated miss list (`spec.md` §7).
#[derive(Clone, Debug, Default)]
pub struct Outcome {
    pub strict: bool,
    pub canonical: bool,
    pub miss: Vec<CacheMiss>,
}

#[derive(Clone)]
pub struct MaterializeResult {
    pub data: MaterializedValue,
    pub fingerprints: Option<FingerprintTree>,
    pub dependencies: HashSet<RecordId>,
    pub source: Source,
    pub outcome: Outcome,
    /// `true` when this result was served from the cache rather than
    /// freshly walked.
    pub hot: bool,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    plan_ptr: usize,
    is_canonical: bool,
    fingerprint: bool,
    root_id: Option<RecordId>,
    vars_key: VariablesKey,
}

/// Per-plan materialized-result cache (`spec.md` §4.5 "Cache keying").
pub struct Materializer {
    cache: Mutex<std::collections::HashMap<CacheKey, MaterializeResult>>,
}

impl Default for Materializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Materializer {
    pub fn new() -> Self {
        Self { cache: Mutex::new(std::collections::HashMap::new()) }
    }

    pub fn materialize(
        &self,
        store: &Store,
        identity: &IdentityConfig,
        plan: &Arc<dyn Plan>,
        variables: &Variables,
        options: MaterializeOptions,
    ) -> MaterializeResult {
        let is_canonical = options.mode == Mode::Canonical;
        let vars_key = plan.make_vars_key(is_canonical, variables);
        let key = CacheKey {
            plan_ptr: Arc::as_ptr(plan) as *const () as usize,
            is_canonical,
            fingerprint: options.fingerprint,
            root_id: options.root_id.clone(),
            vars_key,
        };

        if options.prefer_cache {
            if let Some(cached) = self.cache.lock().get(&key) {
                let mut hit = cached.clone();
                hit.hot = true;
                tracing::debug!(plan = plan.operation_name(), "materializer: cache hit");
                return hit;
            }
        }

        let mut ctx = Ctx { store, identity, mode: options.mode, deps: HashSet::new(), had_miss: false, misses: Misses::default() };
        let root_id = options.root_id.clone().unwrap_or_else(RecordId::root);
        let (data, fp_tree) = materialize_generic(&mut ctx, &root_id, plan.root(), variables);

        let clean = !ctx.had_miss;
        let misses = ctx.misses.into_misses();
        let source = match (clean, is_canonical) {
            (true, true) => Source::Canonical,
            (true, false) => Source::Strict,
            (false, _) => Source::None,
        };

        let result = MaterializeResult {
            data,
            fingerprints: if options.fingerprint { Some(fp_tree) } else { None },
            dependencies: ctx.deps,
            source,
            outcome: Outcome { strict: clean && !is_canonical, canonical: clean && is_canonical, miss: misses },
            hot: false,
        };

        if options.update_cache {
            self.cache.lock().insert(key, result.clone());
        }
        result
    }

    /// Drops a cached result, e.g. when a watcher's last subscriber leaves
    /// or a `readQuery`/`watchQuery` caller requests a hard refetch
    /// (`spec.md` §4.5, §6).
    pub fn invalidate(
        &self,
        plan: &Arc<dyn Plan>,
        mode: Mode,
        fingerprint: bool,
        root_id: Option<&RecordId>,
        vars_key: &VariablesKey,
    ) {
        let key = CacheKey {
            plan_ptr: Arc::as_ptr(plan) as *const () as usize,
            is_canonical: mode == Mode::Canonical,
            fingerprint,
            root_id: root_id.cloned(),
            vars_key: vars_key.clone(),
        };
        self.cache.lock().remove(&key);
    }

    pub fn evict_all(&self) {
        self.cache.lock().clear();
    }
}

struct Ctx<'a> {
    store: &'a Store,
    identity: &'a IdentityConfig,
    mode: Mode,
    deps: HashSet<RecordId>,
    /// Feature-independent "did the chosen mode fail to satisfy the
    /// request anywhere" flag. `misses` (the detailed `CacheMiss` list) is
    /// gated behind the `diagnostics` feature and collapses to a no-op
    /// without it (`cachebay-types/src/miss.rs`), but `source`/`outcome`
    /// are load-bearing read state callers branch on regardless of that
    /// feature (`spec.md` §6/§7), so satisfiability is tracked here
    /// unconditionally instead of being derived from `misses`.
    had_miss: bool,
    misses: Misses,
}

impl Ctx<'_> {
    fn record_miss(&mut self, miss: CacheMiss) {
        self.had_miss = true;
        self.misses.record(miss);
    }
}

/// Reads a node's own record (root tolerates absence; everything else is
/// an `EntityMissing` miss) and walks `selection` against it, producing the
/// generic "version + full child list" fingerprint formula `spec.md` §4.5
/// uses for entities, inline containers, and PageInfo. Root uses a `0`
/// seed instead of a version (`spec.md` §4.5 "Root fingerprint").
fn materialize_generic(
    ctx: &mut Ctx,
    node_id: &RecordId,
    selection: &Selection,
    variables: &Variables,
) -> (MaterializedValue, FingerprintTree) {
    if node_id.is_root() {
        let record = ctx.store.get(node_id);
        let (fields, fp_fields) = dispatch_fields(ctx, record.as_ref(), node_id, selection, variables);
        let fp = root_fingerprint(&fp_fields.iter().map(|(_, f)| f.fingerprint()).collect::<Vec<_>>());
        return (MaterializedValue::object(fields), FingerprintTree::Object { fp, fields: fp_fields });
    }

    let Some(record) = ctx.store.get(node_id) else {
        ctx.record_miss(CacheMiss::EntityMissing { record_id: node_id.clone() });
        return (MaterializedValue::null(), FingerprintTree::Leaf(Fingerprint::ZERO));
    };

    let (fields, fp_fields) = dispatch_fields(ctx, Some(&record), node_id, selection, variables);
    let version = ctx.store.version(node_id);
    let fp = mix(version, &fp_fields.iter().map(|(_, f)| f.fingerprint()).collect::<Vec<_>>());
    (MaterializedValue::object(fields), FingerprintTree::Object { fp, fields: fp_fields })
}

/// Generic per-field dispatch shared by root/entity/inline/pageInfo reads:
/// scalars, single links, arrays of links, and connections. `edges`/`node`
/// positions inside a connection's own selection are handled by
/// [`materialize_connection`]/[`materialize_edge`] instead, which need a
/// restricted fingerprint formula this function doesn't produce.
fn dispatch_fields(
    ctx: &mut Ctx,
    record: Option<&Record>,
    parent_id: &RecordId,
    selection: &Selection,
    variables: &Variables,
) -> (Vec<(String, MaterializedValue)>, Vec<(String, FingerprintTree)>) {
    if !parent_id.is_root() {
        ctx.deps.insert(parent_id.clone());
    }

    let typename = record
        .and_then(|r| r.get("__typename"))
        .and_then(cachebay_types::FieldValue::as_scalar)
        .and_then(Json::as_str);

    let mut fields = Vec::with_capacity(selection.len());
    let mut fp_fields = Vec::with_capacity(selection.len());

    for field in selection {
        if let Some(type_condition) = &field.type_condition {
            match typename {
                Some(t) if ctx.identity.interfaces.satisfies(t, type_condition) => {}
                _ => continue,
            }
        }

        let storage_key = field_storage_key(field, variables);
        if parent_id.is_root() {
            ctx.deps.insert(RecordId::root_field_sentinel(&storage_key));
        }

        if field.is_connection() {
            let sub_selection = field.selection.as_ref().expect("connection field carries a selection");
            let (value, fp) = materialize_connection(ctx, parent_id, field, sub_selection, variables);
            fields.push((field.response_key.clone(), value));
            fp_fields.push((field.response_key.clone(), fp));
            continue;
        }

        match &field.selection {
            None => match record.and_then(|r| r.get(&storage_key)) {
                Some(cachebay_types::FieldValue::Scalar(json)) => {
                    let seed = ctx.store.version(parent_id);
                    let fp = cachebay_types::mix_scalar(seed, json.to_string().as_bytes());
                    fields.push((field.response_key.clone(), MaterializedValue::Scalar(json.clone())));
                    fp_fields.push((field.response_key.clone(), FingerprintTree::Leaf(fp)));
                }
                _ => {
                    ctx.record_miss(CacheMiss::ScalarMissing { record_id: parent_id.clone(), field_key: storage_key });
                }
            },
            Some(sub_selection) => match record.and_then(|r| r.get(&storage_key)) {
                None => {
                    let miss = if parent_id.is_root() {
                        CacheMiss::RootLinkMissing { field_key: storage_key }
                    } else {
                        CacheMiss::FieldLinkMissing { record_id: parent_id.clone(), field_key: storage_key }
                    };
                    ctx.record_miss(miss);
                }
                Some(cachebay_types::FieldValue::Scalar(Json::Null)) => {
                    fields.push((field.response_key.clone(), MaterializedValue::null()));
                    fp_fields.push((field.response_key.clone(), FingerprintTree::Leaf(Fingerprint::ZERO)));
                }
                Some(cachebay_types::FieldValue::Ref(child_id)) => {
                    let (value, fp) = materialize_generic(ctx, child_id, sub_selection, variables);
                    fields.push((field.response_key.clone(), value));
                    fp_fields.push((field.response_key.clone(), fp));
                }
                Some(cachebay_types::FieldValue::Refs(ids)) => {
                    let mut items = Vec::with_capacity(ids.len());
                    let mut item_fps = Vec::with_capacity(ids.len());
                    for id in ids {
                        let (value, fp) = materialize_generic(ctx, id, sub_selection, variables);
                        items.push(value);
                        item_fps.push(fp);
                    }
                    let fp = mix(0, &item_fps.iter().map(FingerprintTree::fingerprint).collect::<Vec<_>>());
                    fields.push((field.response_key.clone(), MaterializedValue::array(items)));
                    fp_fields.push((field.response_key.clone(), FingerprintTree::Array { fp, items: item_fps }));
                }
                Some(cachebay_types::FieldValue::Inline(_)) => {
                    ctx.record_miss(CacheMiss::ScalarMissing { record_id: parent_id.clone(), field_key: storage_key });
                }
            },
        }
    }

    (fields, fp_fields)
}

/// Resolves and reads a connection field, in either mode (`spec.md` §4.5
/// "Connection"). Strict mode follows the parent's stored page link;
/// canonical mode re-derives the canonical key directly from the field's
/// arguments, bypassing the parent's link entirely. Both presence flags
/// are always reported in a [`CacheMiss::ConnectionMissing`] regardless of
/// which one was actually read, per `spec.md` §7.
fn materialize_connection(
    ctx: &mut Ctx,
    parent_id: &RecordId,
    field: &SelectionField,
    conn_selection: &Selection,
    variables: &Variables,
) -> (MaterializedValue, FingerprintTree) {
    let meta = field.connection.as_ref().expect("is_connection implies ConnectionMeta");
    let args = (field.build_args)(variables);
    let filters = connection_filters(field, &args);
    let filters_json = stable_json_stringify(&filters);
    let canonical_key = RecordId::canonical(Some(parent_id), &meta.connection_key, &filters_json);

    let stringified_args = (field.stringify_args)(variables);
    let page_key = RecordId::page(parent_id, &field.field_name, &stringified_args);

    let canonical_present = ctx.store.get(&canonical_key).is_some();
    let page_present = ctx.store.get(&page_key).is_some();

    let key_to_read = if ctx.mode == Mode::Canonical { &canonical_key } else { &page_key };

    let Some(record) = ctx.store.get(key_to_read) else {
        ctx.record_miss(CacheMiss::ConnectionMissing { canonical_present, page_present });
        return (MaterializedValue::null(), FingerprintTree::Leaf(Fingerprint::ZERO));
    };
    ctx.deps.insert(key_to_read.clone());
    let version = ctx.store.version(key_to_read);

    let page_info_field = conn_selection.iter().find(|f| f.field_name == "pageInfo");
    let page_info_result = match (page_info_field, record.get("pageInfo")) {
        (Some(pi_field), Some(cachebay_types::FieldValue::Ref(pi_id))) => {
            let sel = pi_field.selection.clone().unwrap_or_default();
            Some((pi_field.response_key.clone(), materialize_generic(ctx, pi_id, &sel, variables)))
        }
        (Some(_), _) => {
            ctx.record_miss(CacheMiss::PageInfoMissing { page_key: key_to_read.clone() });
            None
        }
        (None, _) => None,
    };

    let edges_field = conn_selection.iter().find(|f| f.field_name == "edges");
    let edges_result = match (edges_field, record.get("edges")) {
        (Some(ef), Some(cachebay_types::FieldValue::Refs(ids))) => {
            let edge_selection = ef.selection.clone().unwrap_or_default();
            let mut items = Vec::with_capacity(ids.len());
            let mut fps = Vec::with_capacity(ids.len());
            for edge_id in ids {
                let (value, fp) = materialize_edge(ctx, edge_id, &edge_selection, variables);
                items.push(value);
                fps.push(fp);
            }
            let fp = mix(0, &fps.iter().map(FingerprintTree::fingerprint).collect::<Vec<_>>());
            Some((ef.response_key.clone(), (MaterializedValue::array(items), FingerprintTree::Array { fp, items: fps })))
        }
        (Some(ef), _) => {
            Some((ef.response_key.clone(), (MaterializedValue::array(vec![]), FingerprintTree::Array { fp: Fingerprint::ZERO, items: vec![] })))
        }
        (None, _) => None,
    };

    let extras_selection: Selection = conn_selection
        .iter()
        .filter(|f| f.field_name != "edges" && f.field_name != "pageInfo")
        .cloned()
        .collect();
    let (extra_fields, extra_fp_fields) = dispatch_fields(ctx, Some(&record), key_to_read, &extras_selection, variables);

    let mut fields = Vec::with_capacity(conn_selection.len());
    let mut fp_fields = Vec::with_capacity(conn_selection.len());
    for f in conn_selection {
        match f.field_name.as_str() {
            "pageInfo" => {
                if let Some((key, (value, fp))) = &page_info_result {
                    fields.push((key.clone(), value.clone()));
                    fp_fields.push((key.clone(), fp.clone()));
                }
            }
            "edges" => {
                if let Some((key, (value, fp))) = &edges_result {
                    fields.push((key.clone(), value.clone()));
                    fp_fields.push((key.clone(), fp.clone()));
                }
            }
            _ => {
                if let Some((_, value)) = extra_fields.iter().find(|(k, _)| *k == f.response_key) {
                    fields.push((f.response_key.clone(), value.clone()));
                }
                if let Some((_, fp)) = extra_fp_fields.iter().find(|(k, _)| *k == f.response_key) {
                    fp_fields.push((f.response_key.clone(), fp.clone()));
                }
            }
        }
    }

    let page_info_fp = page_info_result.as_ref().map(|(_, (_, fp))| fp.fingerprint()).unwrap_or(Fingerprint::ZERO);
    let edges_fp = edges_result.as_ref().map(|(_, (_, fp))| fp.fingerprint()).unwrap_or(Fingerprint::ZERO);
    let top_fp = mix(version, &[page_info_fp, edges_fp]);

    (MaterializedValue::object(fields), FingerprintTree::Object { fp: top_fp, fields: fp_fields })
}

/// Reads one edge record: `node` is resolved explicitly (so a missing node
/// is reported as [`CacheMiss::EdgeNodeMissing`] rather than the generic
/// link-missing miss), other edge scalars go through [`dispatch_fields`].
/// `edgeFp = mix(edgeVersion, [nodeFp])` (`spec.md` §4.5 "Edge") — other
/// edge scalars don't participate in the edge's own fingerprint, only in
/// its field-level entries (so a cursor-only change still recycles at the
/// edge level but not above it... actually it must: a changed cursor is a
/// changed edge. See `DESIGN.md` for why this mirrors the source formula.)
fn materialize_edge(
    ctx: &mut Ctx,
    edge_id: &RecordId,
    edge_selection: &Selection,
    variables: &Variables,
) -> (MaterializedValue, FingerprintTree) {
    let record = ctx.store.get(edge_id);
    ctx.deps.insert(edge_id.clone());
    let version = ctx.store.version(edge_id);

    let node_field = edge_selection.iter().find(|f| f.field_name == "node");
    let node_result = match node_field {
        None => None,
        Some(nf) => match record.as_ref().and_then(|r| r.get("node")) {
            None => {
                ctx.record_miss(CacheMiss::EdgeNodeMissing { edge_id: edge_id.clone() });
                None
            }
            Some(cachebay_types::FieldValue::Scalar(Json::Null)) => {
                Some((nf.response_key.clone(), MaterializedValue::null(), FingerprintTree::Leaf(Fingerprint::ZERO)))
            }
            Some(cachebay_types::FieldValue::Ref(node_id)) => {
                let sel = nf.selection.clone().unwrap_or_default();
                let (value, fp) = materialize_generic(ctx, node_id, &sel, variables);
                Some((nf.response_key.clone(), value, fp))
            }
            _ => {
                ctx.record_miss(CacheMiss::EdgeNodeMissing { edge_id: edge_id.clone() });
                None
            }
        },
    };

    let other_selection: Selection = edge_selection.iter().filter(|f| f.field_name != "node").cloned().collect();
    let (other_fields, other_fp_fields) = dispatch_fields(ctx, record.as_ref(), edge_id, &other_selection, variables);

    let mut fields = Vec::with_capacity(edge_selection.len());
    let mut fp_fields = Vec::with_capacity(edge_selection.len());
    for f in edge_selection {
        if f.field_name == "node" {
            if let Some((key, value, fp)) = &node_result {
                fields.push((key.clone(), value.clone()));
                fp_fields.push((key.clone(), fp.clone()));
            }
        } else {
            if let Some((_, value)) = other_fields.iter().find(|(k, _)| *k == f.response_key) {
                fields.push((f.response_key.clone(), value.clone()));
            }
            if let Some((_, fp)) = other_fp_fields.iter().find(|(k, _)| *k == f.response_key) {
                fp_fields.push((f.response_key.clone(), fp.clone()));
            }
        }
    }

    let node_fp = node_result.as_ref().map(|(_, _, fp)| fp.fingerprint()).unwrap_or(Fingerprint::ZERO);
    let top_fp = mix(version, &[node_fp]);
    (MaterializedValue::object(fields), FingerprintTree::Object { fp: top_fp, fields: fp_fields })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize;
    use crate::scheduler::immediate;
    use cachebay_types::{ConnectionMeta, ConnectionMode};
    use serde_json::json;
    use std::sync::Arc as StdArc;

    fn no_args() -> (
        StdArc<dyn Fn(&Variables) -> serde_json::Map<String, Json> + Send + Sync>,
        StdArc<dyn Fn(&Variables) -> String + Send + Sync>,
    ) {
        (StdArc::new(|_: &Variables| serde_json::Map::new()), StdArc::new(|_: &Variables| "{}".to_string()))
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

    struct StubPlan {
        root: Selection,
    }

    impl Plan for StubPlan {
        fn operation(&self) -> cachebay_types::OperationKind {
            cachebay_types::OperationKind::Query
        }
        fn operation_name(&self) -> &str {
            "Stub"
        }
        fn root(&self) -> &Selection {
            &self.root
        }
        fn make_signature(&self, is_canonical: bool, _variables: &Variables) -> cachebay_types::Signature {
            cachebay_types::Signature::new(format!("Stub:{is_canonical}"))
        }
        fn make_vars_key(&self, is_canonical: bool, _variables: &Variables) -> VariablesKey {
            VariablesKey::new(format!("Stub:{is_canonical}"))
        }
        fn get_dependencies(&self, _is_canonical: bool, _variables: &Variables) -> HashSet<RecordId> {
            HashSet::new()
        }
    }

    #[test]
    fn materializes_scalar_and_linked_entity() {
        let store = Store::new(immediate());
        let identity = IdentityConfig::new();

        let user_selection = vec![scalar_field("id"), scalar_field("email")];
        let root_selection = vec![object_field("viewer", user_selection)];
        let data = json!({"viewer": {"__typename": "User", "id": "u1", "email": "a@x"}});
        let vars = Variables::new();
        normalize(&store, &identity, &RecordId::root(), &root_selection, &vars, &data);

        let plan: Arc<dyn Plan> = Arc::new(StubPlan { root: root_selection });
        let materializer = Materializer::new();
        let result = materializer.materialize(&store, &identity, &plan, &vars, MaterializeOptions::default());

        assert_eq!(result.source, Source::Canonical);
        assert!(result.outcome.miss.is_empty());
        assert_eq!(result.data.to_json(), json!({"viewer": {"id": "u1", "email": "a@x"}}));
        assert!(result.dependencies.contains(&RecordId::entity("User", "u1")));
        assert!(result.dependencies.contains(&RecordId::root_field_sentinel("viewer")));
    }

    #[test]
    fn reports_scalar_missing_and_keeps_reading() {
        let store = Store::new(immediate());
        let identity = IdentityConfig::new();

        let root_selection = vec![scalar_field("serverTime")];
        let plan: Arc<dyn Plan> = Arc::new(StubPlan { root: root_selection });
        let vars = Variables::new();

        let materializer = Materializer::new();
        let result = materializer.materialize(&store, &identity, &plan, &vars, MaterializeOptions::default());

        assert_eq!(result.source, Source::None);
        assert_eq!(result.outcome.miss, vec![CacheMiss::ScalarMissing { record_id: RecordId::root(), field_key: "serverTime".into() }]);
        assert_eq!(result.data.to_json(), json!({}));
    }

    #[test]
    fn materializes_connection_with_edges_and_page_info() {
        let store = Store::new(immediate());
        let identity = IdentityConfig::new();

        let node_selection = vec![scalar_field("id"), scalar_field("title")];
        let edge_selection = vec![object_field("node", node_selection), scalar_field("cursor")];
        let page_info_selection = vec![scalar_field("hasNextPage"), scalar_field("endCursor")];
        let mut conn_field = object_field(
            "users",
            vec![object_field("edges", edge_selection), object_field("pageInfo", page_info_selection)],
        );
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
        let canonical_key = RecordId::canonical(Some(&RecordId::root()), "users", "{}");
        for update in &updates {
            crate::canonical::update_connection(&store, update);
        }

        let plan: Arc<dyn Plan> = Arc::new(StubPlan { root: root_selection });
        let materializer = Materializer::new();
        let result = materializer.materialize(&store, &identity, &plan, &vars, MaterializeOptions::default());

        assert!(result.outcome.miss.is_empty(), "unexpected misses: {:?}", result.outcome.miss);
        let users = &result.data.to_json()["users"];
        assert_eq!(users["pageInfo"]["endCursor"], json!("p1"));
        assert_eq!(users["edges"][0]["node"]["title"], json!("A1"));
        assert!(result.dependencies.contains(&canonical_key));
    }
}
