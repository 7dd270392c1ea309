//! Identifier rules.
//!
//! Ids double as file names, so they are validated before touching disk.
//! Delegate session ids are derived, never generated: every process spawned
//! for the same delegation computes the same id from the same inputs and so
//! lands on the same record.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, TraceError};

pub const DELEGATE_ID_PREFIX: &str = "delegate";

static RE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._@+-]{0,127}$").unwrap());

static RE_LABEL_UNSAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Rejects ids that cannot safely be used as a file name.
pub fn validate_id(id: &str) -> Result<()> {
    if RE_ID.is_match(id) {
        Ok(())
    } else {
        Err(TraceError::InvalidId(id.to_string()))
    }
}

/// Deterministic id for the delegate session of `(parent_session_id, owner_label)`.
///
/// Format: `delegate-<label-slug>-<md5 prefix>`. The slug is for humans; the
/// hash is over the exact inputs, so labels that slug identically still get
/// distinct ids.
pub fn derive_delegate_session_id(parent_session_id: &str, owner_label: &str) -> String {
    let digest = md5::compute(format!("{}\u{0}{}", parent_session_id, owner_label));
    let hex = format!("{:x}", digest);

    let slug = RE_LABEL_UNSAFE
        .replace_all(&owner_label.to_lowercase(), "-")
        .trim_matches('-')
        .chars()
        .take(24)
        .collect::<String>();
    let slug = slug.trim_end_matches('-');

    if slug.is_empty() {
        format!("{}-{}", DELEGATE_ID_PREFIX, &hex[..20])
    } else {
        format!("{}-{}-{}", DELEGATE_ID_PREFIX, slug, &hex[..20])
    }
}

pub fn new_event_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

/// Clamps a payload summary to `max_bytes`, cutting on a char boundary and
/// marking the cut with an ellipsis.
pub fn truncate_summary(summary: &str, max_bytes: usize) -> String {
    const ELLIPSIS: &str = "…";

    if summary.len() <= max_bytes {
        return summary.to_string();
    }
    if max_bytes < ELLIPSIS.len() {
        return String::new();
    }

    let mut cut = max_bytes - ELLIPSIS.len();
    while !summary.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &summary[..cut], ELLIPSIS)
}
