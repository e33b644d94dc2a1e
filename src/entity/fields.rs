// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashMap;
use thiserror::Error;

use crate::types::{Binary, Bool, UnixMilli};

/// Flat `string → string` view of a stream entry or a cache hash body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap(HashMap<String, String>);

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Required field, or a data error naming it.
    pub fn require(&self, key: &str) -> Result<&str, StructifyError> {
        self.get(key).ok_or_else(|| StructifyError {
            field: key.to_string(),
            value: String::new(),
            reason: "missing required field".into(),
        })
    }

    /// Flatten a JSON object body into fields.
    ///
    /// Strings are kept raw, numbers and booleans by their JSON text, `null`
    /// is omitted, nested containers are kept as JSON text.
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(body)?;
        Ok(Self::from_json_value(&value))
    }

    pub fn from_json_value(value: &serde_json::Value) -> Self {
        let mut map = Self::new();
        if let serde_json::Value::Object(obj) = value {
            for (k, v) in obj {
                match v {
                    serde_json::Value::Null => {}
                    serde_json::Value::String(s) => map.insert(k.clone(), s.clone()),
                    other => map.insert(k.clone(), other.to_string()),
                }
            }
        }
        map
    }
}

impl FromIterator<(String, String)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("can't structify field {field:?} from value {value:?}: {reason}")]
pub struct StructifyError {
    pub field: String,
    pub value: String,
    pub reason: String,
}

/// Textual parse hook for a single leaf column.
pub trait FromField: Sized {
    fn from_field(raw: &str) -> Result<Self, String>;
}

impl FromField for String {
    fn from_field(raw: &str) -> Result<Self, String> {
        Ok(raw.to_string())
    }
}

macro_rules! from_field_number {
    ($($t:ty),*) => {
        $(
            impl FromField for $t {
                fn from_field(raw: &str) -> Result<Self, String> {
                    if raw.is_empty() {
                        return Ok(<$t>::default());
                    }
                    raw.parse::<$t>().map_err(|e| e.to_string())
                }
            }
        )*
    };
}

from_field_number!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

impl FromField for Binary {
    fn from_field(raw: &str) -> Result<Self, String> {
        Binary::from_hex(raw).map_err(|e| e.to_string())
    }
}

impl FromField for UnixMilli {
    fn from_field(raw: &str) -> Result<Self, String> {
        UnixMilli::parse(raw).ok_or_else(|| "not a millisecond timestamp".to_string())
    }
}

impl FromField for Bool {
    fn from_field(raw: &str) -> Result<Self, String> {
        Bool::parse(raw).ok_or_else(|| "not a boolean".to_string())
    }
}
