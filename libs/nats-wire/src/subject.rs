//! Subject validation and wildcard matching.
//!
//! `*` matches exactly one dot-separated token, `>` matches one or more
//! trailing tokens. A pattern uses one kind of wildcard or the other.

use crate::error::{WireError, WireResult};

/// Single-token wildcard.
pub const SINGLE_WILDCARD: char = '*';
/// Tail wildcard.
pub const FULL_WILDCARD: char = '>';

/// Validate a protocol token (sid, queue group, header key): non-empty,
/// ASCII, no whitespace or control characters.
pub fn validate_token(field: &'static str, value: &str) -> WireResult<()> {
    if value.is_empty() {
        return Err(WireError::InvalidField {
            field,
            reason: "must not be empty".into(),
        });
    }
    if !value.is_ascii() {
        return Err(WireError::NonAscii {
            field,
            value: value.to_owned(),
        });
    }
    if value.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(WireError::InvalidField {
            field,
            reason: format!("{value:?} contains whitespace or control characters"),
        });
    }
    Ok(())
}

/// Validate a subject (or reply-to subject): a valid token whose
/// dot-separated parts are all non-empty.
pub fn validate_subject(field: &'static str, subject: &str) -> WireResult<()> {
    validate_token(field, subject)?;
    if subject.split('.').any(str::is_empty) {
        return Err(WireError::InvalidField {
            field,
            reason: format!("'{subject}' contains an empty token"),
        });
    }
    Ok(())
}

/// True if the subject contains either wildcard character.
pub fn has_wildcards(subject: &str) -> bool {
    subject.contains(SINGLE_WILDCARD) || subject.contains(FULL_WILDCARD)
}

/// True if `candidate` is matched by `pattern`.
///
/// - no wildcard: exact equality
/// - `>`: everything
/// - `prefix.>`: anything starting with `prefix.`
/// - `*` tokens: same token count, each token equal or `*`
pub fn matches(pattern: &str, candidate: &str) -> bool {
    let has_single = pattern.contains(SINGLE_WILDCARD);
    let has_full = pattern.contains(FULL_WILDCARD);

    if !has_single && !has_full {
        return pattern == candidate;
    }

    if has_full {
        if pattern == ">" {
            return true;
        }
        return match pattern.strip_suffix(FULL_WILDCARD) {
            Some(prefix) if prefix.ends_with('.') => candidate.starts_with(prefix),
            _ => pattern == candidate,
        };
    }

    let mut pattern_tokens = pattern.split('.');
    let mut candidate_tokens = candidate.split('.');
    loop {
        match (pattern_tokens.next(), candidate_tokens.next()) {
            (None, None) => return true,
            (Some(p), Some(c)) if p == "*" || p == c => continue,
            _ => return false,
        }
    }
}
