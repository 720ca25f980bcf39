//! Stable per-repository key used to namespace artifacts.

use sha2::{Digest, Sha256};

const FALLBACK_SLUG: &str = "project";

/// Derive `<slug>-<8 hex>` from an absolute repository path.
///
/// The slug comes from the last path component; the hash covers the whole
/// path string, so two checkouts with the same name get distinct keys.
pub fn compute_repo_key(repo: &str) -> String {
    let name = repo
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let slug = slugify(name);

    let digest = Sha256::digest(repo.as_bytes());
    let short = hex::encode(&digest[..4]);
    format!("{slug}-{short}")
}

fn slugify(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let replaced: String = lowered
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = replaced.trim_matches('-');
    if trimmed.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        trimmed.to_string()
    }
}
