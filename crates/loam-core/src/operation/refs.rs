//! Reference values and document normalization.
//!
//! A nested object or list inside a document is stored under its own child
//! OID. The parent holds a reference value in its place:
//!
//! ```json
//! { "@@type": "ref", "id": "todos/1#k3v9x0a2mq" }
//! ```
//!
//! [`normalize`] splits a full document into shallow per-OID objects and
//! [`denormalize`] reassembles them.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use crate::oid::{Oid, OidError};

const REF_TYPE_KEY: &str = "@@type";
const REF_TYPE: &str = "ref";
const REF_ID_KEY: &str = "id";

/// Build a reference value pointing at `oid`.
#[must_use]
pub fn object_ref(oid: &Oid) -> Value {
    json!({ REF_TYPE_KEY: REF_TYPE, REF_ID_KEY: oid.as_str() })
}

/// True if `value` has the shape of a reference.
#[must_use]
pub fn is_ref(value: &Value) -> bool {
    value.as_object().is_some_and(|m| {
        m.len() == 2
            && m.contains_key(REF_ID_KEY)
            && m.get(REF_TYPE_KEY).and_then(Value::as_str) == Some(REF_TYPE)
    })
}

/// The OID a reference points at, if `value` is a well-formed reference.
#[must_use]
pub fn ref_target(value: &Value) -> Option<Oid> {
    if !is_ref(value) {
        return None;
    }
    value
        .get(REF_ID_KEY)
        .and_then(Value::as_str)
        .and_then(|raw| Oid::parse(raw).ok())
}

/// Split `value` into shallow objects keyed by OID.
///
/// `sub_id` chooses the path segment for each nested container; it receives
/// the parent OID and the field name (objects) or element index (lists).
/// Values that are already references are kept as they are.
///
/// # Errors
///
/// Returns an [`OidError`] if `sub_id` produces an empty segment.
pub fn normalize(
    oid: &Oid,
    value: &Value,
    sub_id: &mut dyn FnMut(&Oid, &str) -> String,
) -> Result<BTreeMap<Oid, Value>, OidError> {
    let mut out = BTreeMap::new();
    normalize_into(oid, value, sub_id, &mut out)?;
    Ok(out)
}

fn normalize_into(
    oid: &Oid,
    value: &Value,
    sub_id: &mut dyn FnMut(&Oid, &str) -> String,
    out: &mut BTreeMap<Oid, Value>,
) -> Result<(), OidError> {
    let shallow = match value {
        Value::Object(map) => {
            let mut shallow = Map::with_capacity(map.len());
            for (key, field) in map {
                let slot = normalize_child(oid, key, field, sub_id, out)?;
                shallow.insert(key.clone(), slot);
            }
            Value::Object(shallow)
        }
        Value::Array(items) => {
            let mut shallow = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                shallow.push(normalize_child(oid, &index.to_string(), item, sub_id, out)?);
            }
            Value::Array(shallow)
        }
        scalar => scalar.clone(),
    };
    out.insert(oid.clone(), shallow);
    Ok(())
}

/// Normalize one field or element, returning what the parent should store.
pub(crate) fn normalize_child(
    parent: &Oid,
    key: &str,
    value: &Value,
    sub_id: &mut dyn FnMut(&Oid, &str) -> String,
    out: &mut BTreeMap<Oid, Value>,
) -> Result<Value, OidError> {
    let nested = matches!(value, Value::Array(_)) || (value.is_object() && !is_ref(value));
    if !nested {
        return Ok(value.clone());
    }
    let child = parent.child(&sub_id(parent, key))?;
    normalize_into(&child, value, sub_id, out)?;
    Ok(object_ref(&child))
}

/// Reassemble the full value rooted at `root` from shallow objects.
///
/// References to OIDs missing from `objects` (deleted or never received)
/// resolve to `null`. Only descendants of the referring OID are followed,
/// which rules out cycles.
#[must_use]
pub fn denormalize(root: &Oid, objects: &BTreeMap<Oid, Value>) -> Option<Value> {
    objects.get(root).map(|value| resolve(root, value, objects))
}

fn resolve(owner: &Oid, value: &Value, objects: &BTreeMap<Oid, Value>) -> Value {
    if let Some(target) = ref_target(value) {
        if target != *owner && target.is_descendant_of(owner) {
            return objects
                .get(&target)
                .map_or(Value::Null, |child| resolve(&target, child, objects));
        }
        return Value::Null;
    }
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(owner, v, objects)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve(owner, v, objects)).collect())
        }
        scalar => scalar.clone(),
    }
}
