// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Canonical, injective packing of small value trees.
//!
//! Every replica must derive the same id for the same logical object, so the
//! byte layout is fixed:
//!
//! | Value | Encoding |
//! |-------|----------|
//! | null | `0x00` |
//! | false / true | `0x01` / `0x02` |
//! | float64 | `0x03` + 8 bytes big-endian IEEE-754 |
//! | bytes / string | `0x04` + u64 BE length + bytes |
//! | sequence | `0x05` + u64 BE length + packed elements |
//! | mapping | `0x06` + u64 BE count + `len(key) key pack(value)` sorted by key |
//!
//! Only the kinds of [`Packable`] can be packed; anything else has no
//! conversion and is rejected at compile time.

use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

use super::Binary;

/// A value that can be canonically packed.
#[derive(Debug, Clone, PartialEq)]
pub enum Packable<'a> {
    Null,
    Bool(bool),
    Float(f64),
    Bytes(&'a [u8]),
    Seq(Vec<Packable<'a>>),
    /// Keys are raw bytes; `BTreeMap` iteration yields them sorted.
    Map(BTreeMap<&'a [u8], Packable<'a>>),
}

impl<'a> From<&'a str> for Packable<'a> {
    fn from(s: &'a str) -> Self {
        Packable::Bytes(s.as_bytes())
    }
}

impl<'a> From<&'a String> for Packable<'a> {
    fn from(s: &'a String) -> Self {
        Packable::Bytes(s.as_bytes())
    }
}

impl<'a> From<&'a [u8]> for Packable<'a> {
    fn from(b: &'a [u8]) -> Self {
        Packable::Bytes(b)
    }
}

impl From<bool> for Packable<'_> {
    fn from(b: bool) -> Self {
        Packable::Bool(b)
    }
}

impl From<f64> for Packable<'_> {
    fn from(f: f64) -> Self {
        Packable::Float(f)
    }
}

impl<'a, T: Into<Packable<'a>>> From<Option<T>> for Packable<'a> {
    fn from(v: Option<T>) -> Self {
        v.map_or(Packable::Null, Into::into)
    }
}

impl<'a> From<Vec<Packable<'a>>> for Packable<'a> {
    fn from(v: Vec<Packable<'a>>) -> Self {
        Packable::Seq(v)
    }
}

/// Append the canonical encoding of `value` to `out`.
pub fn pack_into(value: &Packable<'_>, out: &mut Vec<u8>) {
    match value {
        Packable::Null => out.push(0x00),
        Packable::Bool(false) => out.push(0x01),
        Packable::Bool(true) => out.push(0x02),
        Packable::Float(f) => {
            out.push(0x03);
            out.extend_from_slice(&f.to_bits().to_be_bytes());
        }
        Packable::Bytes(b) => {
            out.push(0x04);
            push_len(out, b.len());
            out.extend_from_slice(b);
        }
        Packable::Seq(items) => {
            out.push(0x05);
            push_len(out, items.len());
            for item in items {
                pack_into(item, out);
            }
        }
        Packable::Map(entries) => {
            out.push(0x06);
            push_len(out, entries.len());
            for (key, val) in entries {
                push_len(out, key.len());
                out.extend_from_slice(key);
                pack_into(val, out);
            }
        }
    }
}

#[inline]
fn push_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_be_bytes());
}

#[must_use]
pub fn pack(value: &Packable<'_>) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    pack_into(value, &mut out);
    out
}

/// SHA-1 over the canonical packing.
#[must_use]
pub fn checksum(value: &Packable<'_>) -> Binary {
    let digest = Sha1::digest(pack(value));
    Binary::new(digest.as_slice())
}

/// SHA-1 of a raw string, used for name checksums.
#[must_use]
pub fn sha1_str(s: &str) -> Binary {
    Binary::new(Sha1::digest(s.as_bytes()).as_slice())
}

/// Id of a named object: `sha1(pack([env_hex, name]))`.
///
/// An empty name yields an empty id, which is written as `NULL`: an object
/// without a zone or check period references nothing.
#[must_use]
pub fn object_id(environment: &Binary, name: &str) -> Binary {
    if name.is_empty() {
        return Binary::default();
    }
    let env = environment.to_hex();
    checksum(&Packable::Seq(vec![env.as_str().into(), name.into()]))
}

/// Id of a service: the object id over `host!service`.
#[must_use]
pub fn service_id(environment: &Binary, host: &str, service: &str) -> Binary {
    if host.is_empty() || service.is_empty() {
        return Binary::default();
    }
    object_id(environment, &format!("{host}!{service}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_empty_string_and_letter() {
        let packed = pack(&Packable::Seq(vec!["".into(), "a".into()]));
        let expected: Vec<u8> = vec![
            0x05, 0, 0, 0, 0, 0, 0, 0, 0x02, //
            0x04, 0, 0, 0, 0, 0, 0, 0, 0x00, //
            0x04, 0, 0, 0, 0, 0, 0, 0, 0x01, 0x61,
        ];
        assert_eq!(packed, expected);
    }

    #[test]
    fn test_pack_scalars() {
        assert_eq!(pack(&Packable::Null), vec![0x00]);
        assert_eq!(pack(&false.into()), vec![0x01]);
        assert_eq!(pack(&true.into()), vec![0x02]);

        let mut expected = vec![0x03];
        expected.extend_from_slice(&1.5f64.to_be_bytes());
        assert_eq!(pack(&1.5f64.into()), expected);
    }

    #[test]
    fn test_pack_map_sorts_keys() {
        let mut a = BTreeMap::new();
        a.insert(b"b".as_slice(), Packable::Null);
        a.insert(b"a".as_slice(), Packable::Bool(true));

        let packed = pack(&Packable::Map(a));
        assert_eq!(packed[0], 0x06);
        // count 2, then key "a" first
        assert_eq!(&packed[1..9], &2u64.to_be_bytes());
        assert_eq!(&packed[9..17], &1u64.to_be_bytes());
        assert_eq!(packed[17], b'a');
        assert_eq!(packed[18], 0x02);
    }

    #[test]
    fn test_option_none_is_null() {
        let v: Option<&str> = None;
        assert_eq!(pack(&v.into()), vec![0x00]);
    }

    #[test]
    fn test_object_id_is_stable_sha1() {
        let env = Binary::new(vec![0xab; 20]);
        let a = object_id(&env, "web01");
        let b = object_id(&env, "web01");
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
        assert_ne!(a, object_id(&env, "web02"));
    }

    #[test]
    fn test_empty_name_yields_null_id() {
        let env = Binary::new(vec![1; 20]);
        assert!(object_id(&env, "").is_empty());
        assert!(service_id(&env, "web01", "").is_empty());
    }

    #[test]
    fn test_service_id_joins_with_bang() {
        let env = Binary::new(vec![2; 20]);
        assert_eq!(service_id(&env, "web01", "ping"), object_id(&env, "web01!ping"));
    }
}
