//! # Tolerant Model-Output Extraction
//!
//! Models regularly wrap JSON answers in markdown code fences even when the
//! prompt forbids it. Strip the fences first, then parse strictly; anything
//! that still fails to parse is a real contract violation for the caller to
//! handle.

use serde::de::DeserializeOwned;

/// Remove markdown code fences (with or without a language tag) from raw
/// model output and trim surrounding whitespace.
pub fn strip_code_fences(raw: &str) -> String {
    // Matches an opening fence like ```json or ``` and any closing fence.
    let fence = regex::Regex::new(r"```[a-zA-Z0-9_-]*\n?");
    match fence {
        Ok(re) => re.replace_all(raw, "").trim().to_string(),
        Err(_) => raw.trim().to_string(),
    }
}

/// Parse model output as JSON after stripping fences.
pub fn parse_lenient<T: DeserializeOwned>(raw: &str) -> serde_json::Result<T> {
    serde_json::from_str(&strip_code_fences(raw))
}
