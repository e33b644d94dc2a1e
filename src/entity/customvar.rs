// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flattening of custom variables into one row per JSON leaf.

use serde_json::Value;

use super::config::{Customvar, CustomvarFlat, IdMeta};
use crate::types::objectpacker::{checksum, sha1_str, Packable};

/// Walk `value` and emit `(flatname, flatvalue)` for every leaf under `name`.
///
/// Object keys join with `.`, array indices render as `[i]`. `null` and empty
/// containers produce a single `None` leaf.
pub fn flatten(name: &str, value: &Value) -> Vec<(String, Option<String>)> {
    let mut out = Vec::new();
    walk(name.to_string(), value, &mut out);
    out
}

fn walk(path: String, value: &Value, out: &mut Vec<(String, Option<String>)>) {
    match value {
        Value::Null => out.push((path, None)),
        Value::String(s) => out.push((path, Some(s.clone()))),
        Value::Bool(_) | Value::Number(_) => out.push((path, Some(value.to_string()))),
        Value::Array(items) if items.is_empty() => out.push((path, None)),
        Value::Object(map) if map.is_empty() => out.push((path, None)),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                walk(format!("{}[{}]", path, i), item, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                walk(format!("{}.{}", path, key), item, out);
            }
        }
    }
}

/// Derive the `customvar_flat` rows of a custom variable.
pub fn flatten_customvar(cv: &Customvar) -> Result<Vec<CustomvarFlat>, serde_json::Error> {
    let value: Value = serde_json::from_str(&cv.value)?;
    let env = cv.meta.environment_id.to_hex();
    let cv_id = cv.meta.id.to_hex();

    Ok(flatten(&cv.name, &value)
        .into_iter()
        .map(|(flatname, flatvalue)| {
            let id = checksum(&Packable::Seq(vec![
                env.as_str().into(),
                cv_id.as_str().into(),
                flatname.as_str().into(),
                flatvalue.as_deref().into(),
            ]));
            CustomvarFlat {
                meta: IdMeta {
                    id,
                    environment_id: cv.meta.environment_id.clone(),
                },
                customvar_id: cv.meta.id.clone(),
                flatname_checksum: sha1_str(&flatname),
                flatname,
                flatvalue,
            }
        })
        .collect())
}
