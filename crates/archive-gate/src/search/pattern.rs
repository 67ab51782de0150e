//! Wildcard file-name patterns
//!
//! Only `*` and `?` are wildcards; every other character is literal.

use crate::{Error, Result};
use glob::{MatchOptions, Pattern};

const MAX_PATTERN_LEN: usize = 255;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A validated file-name pattern
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    raw: String,
    compiled: Pattern,
}

impl WildcardPattern {
    /// Validate and compile a pattern
    ///
    /// # Errors
    ///
    /// `Error::InvalidInput` for blank or oversized patterns, and for
    /// patterns carrying separators, `..` or control characters
    pub fn new(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::invalid("Search pattern must not be empty"));
        }
        if raw.len() > MAX_PATTERN_LEN {
            return Err(Error::invalid(format!(
                "Search pattern longer than {MAX_PATTERN_LEN} characters"
            )));
        }
        if raw.contains(['/', '\\']) || raw.contains("..") || raw.chars().any(char::is_control) {
            return Err(Error::invalid(
                "Search pattern must be a plain file-name pattern",
            ));
        }

        let mut escaped = String::with_capacity(raw.len() * 2);
        for c in raw.chars() {
            match c {
                '*' | '?' => escaped.push(c),
                other => escaped.push_str(&Pattern::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }

        let compiled = Pattern::new(&escaped)
            .map_err(|e| Error::invalid(format!("Invalid search pattern: {e}")))?;

        Ok(Self {
            raw: raw.to_string(),
            compiled,
        })
    }

    /// Pattern as supplied (trimmed)
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a single file name (no directory part)
    pub fn matches(&self, name: &str) -> bool {
        self.compiled.matches_with(name, MATCH_OPTIONS)
    }
}
