use sha2::{Digest, Sha256};

/// Trim, lowercase and collapse internal whitespace. Used for comparison only;
/// display strings keep their original form.
pub fn normalize_text(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Deterministic dedup key over `company|title|location`, hex-encoded SHA-256
/// of the normalized UTF-8 triple.
///
/// Returns `None` when both company and title are empty: a location-only key
/// would merge unrelated postings, so such records dedup on their provider id.
pub fn canonical_id(company: &str, title: &str, location: &str) -> Option<String> {
    let company = normalize_text(company);
    let title = normalize_text(title);
    if company.is_empty() && title.is_empty() {
        return None;
    }
    let location = normalize_text(location);
    let mut hasher = Sha256::new();
    hasher.update(company.as_bytes());
    hasher.update(b"|");
    hasher.update(title.as_bytes());
    hasher.update(b"|");
    hasher.update(location.as_bytes());
    Some(hex::encode(hasher.finalize()))
}
