// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt;
use std::time::Duration;

/// Unix timestamp in milliseconds. Zero means "not set" and is written as `NULL`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnixMilli(pub i64);

impl UnixMilli {
    #[must_use]
    pub fn now() -> Self {
        Self(super::now_millis())
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn millis(&self) -> i64 {
        self.0
    }

    /// Parse either integral milliseconds or a float as sent by some producers.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return Some(Self(0));
        }
        if let Ok(ms) = raw.parse::<i64>() {
            return Some(Self(ms));
        }
        raw.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| Self(f as i64))
    }

    #[must_use]
    pub fn saturating_sub(&self, d: Duration) -> Self {
        Self(self.0.saturating_sub(d.as_millis() as i64))
    }

    #[must_use]
    pub fn saturating_add(&self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_millis() as i64))
    }
}

impl fmt::Display for UnixMilli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
