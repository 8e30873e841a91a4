//! Handle generation.

/// Handle used when a name has no ASCII alphanumerics at all.
pub const FALLBACK_HANDLE: &str = "advisor";

/// Convert a string to a URL-safe slug
pub fn slugify(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Base handle for a display name.
pub fn base_handle(name: &str) -> String {
    let slug = slugify(name);
    if slug.is_empty() {
        FALLBACK_HANDLE.to_string()
    } else {
        slug
    }
}

/// The `attempt`-th handle candidate: `base`, `base-2`, `base-3`, ...
pub fn handle_candidate(base: &str, attempt: u32) -> String {
    if attempt <= 1 {
        base.to_string()
    } else {
        format!("{}-{}", base, attempt)
    }
}
