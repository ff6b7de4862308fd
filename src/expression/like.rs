//! LIKE pattern translation and literal-prefix extraction.
//!
//! Patterns use `%` (any run) and `_` (any single character); everything
//! else matches literally. The planner uses the literal prefix of a pattern
//! to derive an index span, so prefix extraction must agree exactly with the
//! compiled matcher.

use regex::Regex;

use crate::errors::{Error, Result};

/// Compiles a LIKE pattern into an anchored regex.
pub fn like_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| Error::InvalidValue {
        reason: format!("invalid LIKE pattern {pattern:?}: {e}"),
    })
}

/// Extracts the literal prefix of a LIKE pattern.
///
/// Returns `(prefix, complete)`: `complete` is true when the whole pattern
/// is literal (an exact-match predicate). An empty prefix with
/// `complete == false` means the pattern starts with a wildcard and is not
/// sargable.
pub fn like_prefix(pattern: &str) -> (String, bool) {
    let mut prefix = String::new();
    for ch in pattern.chars() {
        match ch {
            '%' | '_' => return (prefix, false),
            other => prefix.push(other),
        }
    }
    (prefix, true)
}

/// Smallest string strictly greater than every string with the given
/// prefix, in byte order. Returns `None` when no such bound exists (the
/// prefix is empty or all 0xFF).
pub fn prefix_successor(prefix: &str) -> Option<String> {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(&last) = bytes.last() {
        if last < 0xFF {
            *bytes.last_mut().unwrap() = last + 1;
            return String::from_utf8(bytes).ok();
        }
        bytes.pop();
    }
    None
}
