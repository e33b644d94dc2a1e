// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Value types shared by entities, the database layer and the cache client.
//!
//! - [`Binary`]: 20-byte ids and checksums (hex on the wire, raw bytes in SQL)
//! - [`UnixMilli`]: millisecond timestamps (`0` maps to SQL `NULL`)
//! - [`Bool`]: `'y'`/`'n'` enum columns
//! - [`objectpacker`]: canonical packing used to derive ids

mod binary;
mod bool;
mod unix_milli;
pub mod objectpacker;

pub use binary::Binary;
pub use self::bool::Bool;
pub use unix_milli::UnixMilli;

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
