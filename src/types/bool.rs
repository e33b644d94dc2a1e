// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt;

/// Boolean stored in `ENUM('n', 'y')` columns.
///
/// Producers send `0`/`1`, JSON bodies carry `true`/`false`; both parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Bool(pub bool);

impl Bool {
    pub const TRUE: Bool = Bool(true);
    pub const FALSE: Bool = Bool(false);

    /// The enum literal written to SQL.
    #[must_use]
    pub fn as_enum(&self) -> &'static str {
        if self.0 { "y" } else { "n" }
    }

    /// Parse the textual forms seen in streams, hashes and SQL.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "1" | "true" | "y" => Some(Bool(true)),
            "0" | "false" | "n" | "" => Some(Bool(false)),
            _ => None,
        }
    }
}

impl From<bool> for Bool {
    fn from(b: bool) -> Self {
        Bool(b)
    }
}

impl fmt::Display for Bool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_enum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        for raw in ["1", "true", "y"] {
            assert_eq!(Bool::parse(raw), Some(Bool::TRUE));
        }
        for raw in ["0", "false", "n", ""] {
            assert_eq!(Bool::parse(raw), Some(Bool::FALSE));
        }
        assert_eq!(Bool::parse("yes"), None);
    }

    #[test]
    fn test_enum_literal() {
        assert_eq!(Bool::TRUE.as_enum(), "y");
        assert_eq!(Bool::FALSE.to_string(), "n");
    }
}
