// src/response.rs

//! Pulling structured data out of free-text model responses.
//!
//! Vision models wrap their JSON in prose, markdown fences or reasoning text
//! even when told not to. [`parse_object`] ignores all of that and takes the
//! first balanced `{...}` span.

use crate::error::ResponseError;
use serde_json::{Map, Value};

/// Untyped key/value record as returned by the model.
pub type RawRecord = Map<String, Value>;

/// Return the first balanced `{...}` span in `text`.
///
/// Depth counting is purely lexical: braces inside JSON strings are counted
/// too. Returns `None` when there is no `{` or the first one never closes.
pub fn find_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth: usize = 0;

    for (idx, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + idx]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Parse the first balanced object in `text`.
pub fn parse_object(text: &str) -> Result<RawRecord, ResponseError> {
    let span = find_object_span(text).ok_or(ResponseError::NoObjectFound)?;
    serde_json::from_str::<RawRecord>(span)
        .map_err(|source| ResponseError::MalformedObject { source })
}

/// Strip one surrounding markdown code fence (with optional language tag).
///
/// Only used for report text; extraction never relies on fences.
pub fn strip_fences(text: &str) -> &str {
    let mut s = text.trim();

    if let Some(rest) = s.strip_prefix("```") {
        // Drop a language tag such as `latex` or `json` on the fence line.
        s = match rest.split_once('\n') {
            Some((tag, body)) if tag.trim().chars().all(|c| c.is_ascii_alphanumeric()) => body,
            _ => rest,
        };
    }

    s.trim_end().strip_suffix("```").unwrap_or(s).trim()
}
