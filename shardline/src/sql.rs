//! Quoting and identifier validation for hand-built SQL.
//!
//! Every value and identifier interpolated into a statement goes through
//! this module. Identifiers are checked against an allow-list before use.

use crate::error::{Result, ShardingError};
use regex::Regex;
use std::sync::OnceLock;

/// Words that must be quoted when used as identifiers
pub const RESERVED_WORDS: &[&str] = &[
    "ADD", "ALTER", "AND", "AS", "ASC", "BETWEEN", "BY", "CLUSTER", "CREATE", "DELETE", "DESC",
    "DISTINCT", "DROP", "EXISTS", "FROM", "GLOBAL", "GROUP", "IF", "IN", "INDEX", "INSERT", "INTO",
    "IS", "JOIN", "KEY", "LIKE", "LIMIT", "MATCH", "NOT", "NULL", "OR", "ORDER", "REPLACE",
    "SELECT", "SET", "SHOW", "TABLE", "UPDATE", "VALUES", "WHERE",
];

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
            .expect("identifier pattern is valid")
    })
}

/// Check a table or cluster name against the allow-list
pub fn validate_identifier(name: &str) -> Result<()> {
    if identifier_regex().is_match(name) {
        Ok(())
    } else {
        Err(ShardingError::InvalidIdentifier(name.to_string()))
    }
}

/// Whether a bare word collides with the reserved list
pub fn is_reserved(word: &str) -> bool {
    RESERVED_WORDS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(word))
}

/// Render a string literal with backslash escaping
pub fn quote_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('\'');
    quoted
}

/// Render an identifier, backtick-quoting each dotted segment that needs it
pub fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(quote_segment)
        .collect::<Vec<_>>()
        .join(".")
}

fn quote_segment(segment: &str) -> String {
    let needs_quotes = segment.is_empty()
        || segment.starts_with(|c: char| c.is_ascii_digit())
        || !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        || is_reserved(segment);

    if needs_quotes {
        format!("`{}`", segment.replace('`', "``"))
    } else {
        segment.to_string()
    }
}

/// Strip surrounding backticks from an identifier taken out of a statement
pub fn unquote_identifier(name: &str) -> String {
    name.split('.')
        .map(|segment| {
            segment
                .strip_prefix('`')
                .and_then(|s| s.strip_suffix('`'))
                .map(|s| s.replace("``", "`"))
                .unwrap_or_else(|| segment.to_string())
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Render a comma separated list of string literals
pub fn quote_list<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| quote_string(v.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}
