//! Cache id derivation
//!
//! Maps a locator to a stable, filesystem-safe cache id. Ids longer than
//! [`MAX_CACHE_ID_LEN`] keep their trailing part, which carries the most
//! specific path and query segments. Two long locators sharing the same
//! trailing 128 characters collide; callers that need to rule this out can
//! pass [`hashed_id`] as an explicit cache id.
//!
//! Explicit ids are joined under `<root>/data`, so they must name a single
//! file there; [`is_safe_id`] rejects anything else.

use std::path::{Component, Path};

/// Maximum length of a derived cache id, in characters
pub const MAX_CACHE_ID_LEN: usize = 128;

const SCHEMES: [&str; 3] = ["http://", "https://", "file://"];
const SEPARATORS: [char; 5] = ['?', '=', ' ', '&', '/'];

/// Derive the cache id for a locator
pub fn derive_id(locator: &str) -> String {
    let mut stripped = locator.to_string();
    for scheme in SCHEMES {
        stripped = stripped.replace(scheme, "");
    }

    let mut id = String::with_capacity(stripped.len());
    for c in stripped.chars() {
        let c = if SEPARATORS.contains(&c) { '_' } else { c };
        if c == '_' && id.ends_with('_') {
            continue;
        }
        id.push(c);
    }

    let id = id.to_lowercase();
    let len = id.chars().count();
    if len <= MAX_CACHE_ID_LEN {
        log::debug!("Cache id {} <- {}", id, locator);
        return id;
    }

    log::warn!(
        "Cache id for {} is {} chars, keeping the trailing {}; set an explicit id to avoid collisions",
        locator,
        len,
        MAX_CACHE_ID_LEN
    );
    id.chars().skip(len - MAX_CACHE_ID_LEN).collect()
}

/// Whether `id` names exactly one file inside the data directory
pub fn is_safe_id(id: &str) -> bool {
    if id.is_empty() || id.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Collision-resistant cache id (BLAKE3 hex digest of the locator)
pub fn hashed_id(locator: &str) -> String {
    blake3::hash(locator.as_bytes()).to_hex().to_string()
}
