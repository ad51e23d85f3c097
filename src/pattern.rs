// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of Plugstore.
//
// Plugstore is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Plugstore is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Plugstore. If not, see <https://www.gnu.org/licenses/>.

//! Key pattern matching for `find`/`count`/`keys`.
//!
//! A pattern is a key with at most one `*` wildcard: the first `*` splits it
//! into a prefix and a suffix, and any later `*` is a literal character.
//! `user:*` matches every key starting with `user:`; a pattern without `*`
//! matches exactly one key. The same parsed pattern drives both the
//! in-memory backends ([`KeyPattern::matches`]) and the SQLite backends
//! ([`KeyPattern::to_sql_like`]).

/// A parsed key pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    prefix: String,
    // `None` means the pattern had no wildcard and matches one exact key.
    suffix: Option<String>,
}

impl KeyPattern {
    /// Parse a pattern, splitting at the first `*`.
    pub fn parse(pattern: &str) -> Self {
        match pattern.split_once('*') {
            Some((prefix, suffix)) => Self {
                prefix: prefix.to_string(),
                suffix: Some(suffix.to_string()),
            },
            None => Self {
                prefix: pattern.to_string(),
                suffix: None,
            },
        }
    }

    /// Whether the pattern contains a wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.suffix.is_some()
    }

    /// Whether `key` matches this pattern.
    pub fn matches(&self, key: &str) -> bool {
        match &self.suffix {
            None => key == self.prefix,
            Some(suffix) => {
                // Prefix and suffix must not overlap within the key.
                key.len() >= self.prefix.len() + suffix.len()
                    && key.starts_with(&self.prefix)
                    && key.ends_with(suffix.as_str())
            }
        }
    }

    /// Render as a SQL `LIKE` pattern. Metacharacters in the literal parts
    /// are escaped with `\`; queries must use `ESCAPE '\'`.
    pub fn to_sql_like(&self) -> String {
        match &self.suffix {
            None => escape_like(&self.prefix),
            Some(suffix) => format!("{}%{}", escape_like(&self.prefix), escape_like(suffix)),
        }
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_pattern() {
        let p = KeyPattern::parse("user:42");
        assert!(!p.is_wildcard());
        assert!(p.matches("user:42"));
        assert!(!p.matches("user:421"));
        assert!(!p.matches("user:4"));
        assert_eq!(p.to_sql_like(), "user:42");
    }

    #[test]
    fn test_match_all() {
        let p = KeyPattern::parse("*");
        assert!(p.is_wildcard());
        assert!(p.matches(""));
        assert!(p.matches("anything"));
        assert_eq!(p.to_sql_like(), "%");
    }

    #[test]
    fn test_prefix_pattern() {
        let p = KeyPattern::parse("user:*");
        assert!(p.matches("user:"));
        assert!(p.matches("user:42"));
        assert!(!p.matches("users:42"));
        assert_eq!(p.to_sql_like(), "user:%");
    }

    #[test]
    fn test_suffix_pattern() {
        let p = KeyPattern::parse("*.json");
        assert!(p.matches("data.json"));
        assert!(p.matches(".json"));
        assert!(!p.matches("data.jsonl"));
        assert_eq!(p.to_sql_like(), "%.json");
    }

    #[test]
    fn test_infix_pattern_does_not_overlap() {
        let p = KeyPattern::parse("ab*bc");
        assert!(p.matches("abbc"));
        assert!(p.matches("abXbc"));
        // "abc" starts with "ab" and ends with "bc", but they overlap.
        assert!(!p.matches("abc"));
    }

    #[test]
    fn test_second_star_is_literal() {
        let p = KeyPattern::parse("a*b*c");
        assert!(p.matches("aXb*c"));
        assert!(!p.matches("aXbYc"));
        assert_eq!(p.to_sql_like(), "a%b*c");
    }

    #[test]
    fn test_like_metacharacters_are_escaped() {
        let p = KeyPattern::parse("odd%_*");
        assert_eq!(p.to_sql_like(), "odd\\%\\_%");

        let literal = KeyPattern::parse("back\\slash");
        assert_eq!(literal.to_sql_like(), "back\\\\slash");
    }
}
