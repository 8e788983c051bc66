//! The reconstructed response tree and its parallel fingerprint tree
//! (`spec.md` §4.5, §9 "Non-enumerable fingerprint keys").
//!
//! The source spec models fingerprints as a hidden, non-enumerable key
//! riding alongside each subtree of a plain JS object/array. Rust has no
//! equivalent of an invisible property, so the fingerprint tree is kept as
//! a genuinely separate structure ([`FingerprintTree`]) shaped exactly
//! like the data tree, as `spec.md` §9 itself suggests ("keep prior
//! snapshot and its fingerprint tree per watcher").
//!
//! Structural recycling (`spec.md` §4.7) needs more than fingerprint
//! equality, though: a watcher must receive *the same object reference*
//! for an unchanged subtree. A `serde_json::Value` has no stable identity
//! to reuse, so object/array subtrees here are wrapped in `Arc`, the same
//! way `Store` shares itself by `Arc` rather than by cloning whenever a
//! value needs to be compared by identity instead of by value. `recycle`
//! then compares fingerprints and, on a match, clones the `Arc` (a
//! refcount bump, not a deep copy) instead of rebuilding the subtree.

use std::sync::Arc;

use cachebay_types::{mix, Fingerprint};
use serde_json::{Map as JsonMap, Value as Json};

#[derive(Clone, Debug)]
pub enum MaterializedValue {
    Scalar(Json),
    Object(Arc<MaterializedObject>),
    Array(Arc<MaterializedArray>),
}

#[derive(Debug, Default)]
pub struct MaterializedObject {
    pub fields: Vec<(String, MaterializedValue)>,
}

#[derive(Debug, Default)]
pub struct MaterializedArray {
    pub items: Vec<MaterializedValue>,
}

impl MaterializedValue {
    pub fn null() -> Self {
        MaterializedValue::Scalar(Json::Null)
    }

    pub fn object(fields: Vec<(String, MaterializedValue)>) -> Self {
        MaterializedValue::Object(Arc::new(MaterializedObject { fields }))
    }

    pub fn array(items: Vec<MaterializedValue>) -> Self {
        MaterializedValue::Array(Arc::new(MaterializedArray { items }))
    }

    /// Converts to a plain `serde_json::Value`, losing the `Arc` identity.
    /// Used at API boundaries (`readQuery`, `dehydrate`-adjacent tooling,
    /// `onData` callers who just want JSON) that don't care about
    /// reference-equality recycling.
    pub fn to_json(&self) -> Json {
        match self {
            MaterializedValue::Scalar(json) => json.clone(),
            MaterializedValue::Object(object) => {
                let mut map = JsonMap::with_capacity(object.fields.len());
                for (key, value) in &object.fields {
                    map.insert(key.clone(), value.to_json());
                }
                Json::Object(map)
            }
            MaterializedValue::Array(array) => {
                Json::Array(array.items.iter().map(MaterializedValue::to_json).collect())
            }
        }
    }

    /// True when `self` and `other` are the exact same allocation (an
    /// `Arc` pointer match), i.e. a watcher would see "the same object
    /// reference" for this subtree. Scalars are compared by value since
    /// they carry no identity of their own.
    pub fn is_same_reference(&self, other: &MaterializedValue) -> bool {
        match (self, other) {
            (MaterializedValue::Scalar(a), MaterializedValue::Scalar(b)) => a == b,
            (MaterializedValue::Object(a), MaterializedValue::Object(b)) => Arc::ptr_eq(a, b),
            (MaterializedValue::Array(a), MaterializedValue::Array(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Mirrors [`MaterializedValue`]'s shape so every node carries its own
/// deterministic fingerprint; arrays carry the fingerprint of the array itself
/// (`spec.md` §4.5), object/entity/edge/connection nodes carry the mixer
/// output for their record version + child fingerprints.
#[derive(Clone, Debug)]
pub enum FingerprintTree {
    Leaf(Fingerprint),
    Object {
        fp: Fingerprint,
        fields: Vec<(String, FingerprintTree)>,
    },
    Array {
        fp: Fingerprint,
        items: Vec<FingerprintTree>,
    },
}

impl FingerprintTree {
    pub fn fingerprint(&self) -> Fingerprint {
        match self {
            FingerprintTree::Leaf(fp) => *fp,
            FingerprintTree::Object { fp, .. } => *fp,
            FingerprintTree::Array { fp, .. } => *fp,
        }
    }
}

/// Walks `new_data`/`new_fp` against `prior_data`/`prior_fp` in parallel,
/// swapping in the prior `Arc` wherever a subtree's fingerprint is
/// unchanged (`spec.md` §4.7 "Recycling", §9). Arrays are recycled
/// position-by-position first; any position whose fingerprint isn't found
/// at the same index in the prior array falls back to a fingerprint
/// lookup across the whole prior array (the "fingerprint multiset" rule
/// from §9), so an append/prepend still recycles the untouched items
/// instead of reallocating the whole array.
pub fn recycle(
    new_data: &MaterializedValue,
    new_fp: &FingerprintTree,
    prior_data: Option<&MaterializedValue>,
    prior_fp: Option<&FingerprintTree>,
) -> MaterializedValue {
    let (Some(prior_data), Some(prior_fp)) = (prior_data, prior_fp) else {
        return new_data.clone();
    };

    if new_fp.fingerprint() == prior_fp.fingerprint() {
        return prior_data.clone();
    }

    match (new_data, new_fp, prior_data, prior_fp) {
        (
            MaterializedValue::Object(new_object),
            FingerprintTree::Object { fields: new_fields, .. },
            MaterializedValue::Object(prior_object),
            FingerprintTree::Object { fields: prior_fields, .. },
        ) => {
            let mut recycled_fields = Vec::with_capacity(new_fields.len());
            let mut changed = false;

            for (index, (key, child_fp)) in new_fields.iter().enumerate() {
                let prior_child = prior_fields
                    .get(index)
                    .filter(|(prior_key, _)| prior_key == key)
                    .map(|(_, fp)| fp)
                    .or_else(|| prior_fields.iter().find(|(k, _)| k == key).map(|(_, fp)| fp));

                let prior_value = prior_child.and_then(|prior_child_fp| {
                    prior_object
                        .fields
                        .iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, v)| (v, prior_child_fp))
                });

                let (child_value, _) = new_object
                    .fields
                    .iter()
                    .find(|(k, _)| k == key)
                    .expect("new_fields and new_object.fields share keys");

                let recycled_child = match prior_value {
                    Some((prior_v, prior_child_fp)) => {
                        recycle(child_value, child_fp, Some(prior_v), Some(prior_child_fp))
                    }
                    None => child_value.clone(),
                };

                if !recycled_child.is_same_reference(
                    prior_value.map(|(v, _)| v).unwrap_or(&MaterializedValue::null()),
                ) {
                    changed = true;
                }
                recycled_fields.push((key.clone(), recycled_child));
            }

            if !changed && recycled_fields.len() == prior_object.fields.len() {
                return prior_data.clone();
            }
            MaterializedValue::object(recycled_fields)
        }

        (
            MaterializedValue::Array(new_array),
            FingerprintTree::Array { items: new_items, .. },
            MaterializedValue::Array(prior_array),
            FingerprintTree::Array { items: prior_items, .. },
        ) => {
            let recycled_items: Vec<MaterializedValue> = new_items
                .iter()
                .enumerate()
                .map(|(index, child_fp)| {
                    let child_value = &new_array.items[index];

                    // Same position first (the common append/prepend-free case).
                    if let Some(prior_child_fp) = prior_items.get(index) {
                        if prior_child_fp.fingerprint() == child_fp.fingerprint() {
                            return prior_array.items[index].clone();
                        }
                    }

                    // Fall back to a fingerprint-multiset lookup so an
                    // append/prepend still recycles the shifted items.
                    if let Some(prior_index) = prior_items
                        .iter()
                        .position(|prior_child_fp| prior_child_fp.fingerprint() == child_fp.fingerprint())
                    {
                        return recycle(
                            child_value,
                            child_fp,
                            Some(&prior_array.items[prior_index]),
                            Some(&prior_items[prior_index]),
                        );
                    }

                    child_value.clone()
                })
                .collect();

            MaterializedValue::array(recycled_items)
        }

        _ => new_data.clone(),
    }
}

/// `fingerprintNodes(0, [topLevelFieldFps])` (`spec.md` §4.5 "Root
/// fingerprint").
pub fn root_fingerprint(field_fps: &[Fingerprint]) -> Fingerprint {
    mix(0, field_fps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachebay_types::Fingerprint as Fp;
    use serde_json::json;

    fn leaf(fp: u32) -> FingerprintTree {
        FingerprintTree::Leaf(Fp(fp))
    }

    #[test]
    fn recycle_reuses_reference_on_equal_fingerprint() {
        let prior = MaterializedValue::object(vec![("email".into(), MaterializedValue::Scalar(json!("a@x")))]);
        let prior_fp = FingerprintTree::Object { fp: Fp(1), fields: vec![("email".into(), leaf(7))] };

        let new = MaterializedValue::object(vec![("email".into(), MaterializedValue::Scalar(json!("a@x")))]);
        let new_fp = FingerprintTree::Object { fp: Fp(1), fields: vec![("email".into(), leaf(7))] };

        let recycled = recycle(&new, &new_fp, Some(&prior), Some(&prior_fp));
        assert!(recycled.is_same_reference(&prior));
    }

    #[test]
    fn recycle_rebuilds_on_changed_fingerprint() {
        let prior = MaterializedValue::object(vec![("email".into(), MaterializedValue::Scalar(json!("a@x")))]);
        let prior_fp = FingerprintTree::Object { fp: Fp(1), fields: vec![("email".into(), leaf(7))] };

        let new = MaterializedValue::object(vec![("email".into(), MaterializedValue::Scalar(json!("b@y")))]);
        let new_fp = FingerprintTree::Object { fp: Fp(2), fields: vec![("email".into(), leaf(9))] };

        let recycled = recycle(&new, &new_fp, Some(&prior), Some(&prior_fp));
        assert!(!recycled.is_same_reference(&prior));
        assert_eq!(recycled.to_json(), json!({"email": "b@y"}));
    }

    #[test]
    fn recycle_preserves_items_through_append() {
        let item_a = MaterializedValue::Scalar(json!("A1"));
        let item_b = MaterializedValue::Scalar(json!("A2"));
        let prior = MaterializedValue::array(vec![item_a.clone(), item_b.clone()]);
        let prior_fp = FingerprintTree::Array { fp: Fp(10), items: vec![leaf(1), leaf(2)] };

        let item_c = MaterializedValue::Scalar(json!("A3"));
        let new = MaterializedValue::array(vec![item_a.clone(), item_b.clone(), item_c.clone()]);
        let new_fp = FingerprintTree::Array { fp: Fp(11), items: vec![leaf(1), leaf(2), leaf(3)] };

        let recycled = recycle(&new, &new_fp, Some(&prior), Some(&prior_fp));
        assert_eq!(recycled.to_json(), json!(["A1", "A2", "A3"]));
    }
}
