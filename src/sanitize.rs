//! Label normalization and filesystem-safe name derivation
//!
//! Free-text disease names/types arrive in whatever shape clinicians type
//! them. Two distinct treatments apply:
//!
//! - `sanitize` derives storage filenames: lowercase, `[a-z0-9_-]` only.
//! - `normalize_label` / `normalize_disease_type` clean label text for
//!   storage and comparison without changing case.

/// Sentinel disease type used when the field is left blank.
pub const DEFAULT_DISEASE_TYPE: &str = "Standard";

/// Derive a filesystem-safe token from free text.
///
/// Lower-cases, collapses whitespace runs to `_`, maps `+` to `plus` and
/// path separators/colons to `-`, then strips anything outside
/// `[a-z0-9_-]`. Returns `fallback` when the input sanitizes to empty.
pub fn sanitize(text: &str, fallback: &str) -> String {
    let lowered = text.trim().to_lowercase();

    let mut out = String::with_capacity(lowered.len());
    let mut in_whitespace = false;
    for c in lowered.chars() {
        if c.is_whitespace() {
            if !in_whitespace && !out.is_empty() {
                out.push('_');
            }
            in_whitespace = true;
            continue;
        }
        in_whitespace = false;
        match c {
            '+' => out.push_str("plus"),
            '/' | '\\' | ':' => out.push('-'),
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => out.push(c),
            _ => {}
        }
    }
    let out = out.trim_matches('_').to_string();

    if out.is_empty() {
        fallback.to_string()
    } else {
        out
    }
}

/// Collapse repeated whitespace and trim, preserving case.
///
/// Applied to disease name/type before any storage or comparison so that
/// `" oma "` and `"oma"` are the same label.
pub fn normalize_label(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize the disease-type field, substituting the sentinel default
/// when blank.
pub fn normalize_disease_type(text: &str) -> String {
    let normalized = normalize_label(text);
    if normalized.is_empty() {
        DEFAULT_DISEASE_TYPE.to_string()
    } else {
        normalized
    }
}

/// Agreement key for consensus comparison: case-folded normalized name and
/// type joined with `::`.
pub fn opinion_key(disease_name: &str, disease_type: &str) -> String {
    format!(
        "{}::{}",
        normalize_label(disease_name).to_lowercase(),
        normalize_disease_type(disease_type).to_lowercase()
    )
}
