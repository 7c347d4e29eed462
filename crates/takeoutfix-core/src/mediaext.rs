//! Media file extensions TakeoutFix recognizes and processes.

/// All media extensions the scanner treats as metadata carriers.
/// Comparisons against this list are case-insensitive.
pub const SUPPORTED: &[&str] = &[
    ".3gp", ".avi", ".dng", ".gif", ".heic", ".heif", ".jpeg", ".jpg", ".m4v", ".mov", ".mp4",
    ".png", ".tif", ".tiff", ".webp",
];

/// Final dot-separated suffix of the basename, dot included, or "" when
/// the basename has no dot. Unlike `Path::extension`, a leading-dot name
/// such as `".json"` yields `".json"`.
pub fn ext_of(name: &str) -> &str {
    let base = match name.rfind('/') {
        Some(pos) => &name[pos + 1..],
        None => name,
    };
    match base.rfind('.') {
        Some(pos) => &base[pos..],
        None => "",
    }
}

pub fn is_supported_media_extension(ext: &str) -> bool {
    !ext.is_empty() && SUPPORTED.iter().any(|s| s.eq_ignore_ascii_case(ext))
}

pub fn is_media_candidate(name: &str) -> bool {
    is_supported_media_extension(ext_of(name))
}

pub fn is_json_file(name: &str) -> bool {
    ext_of(name).eq_ignore_ascii_case(".json")
}

/// Fallback writable set used when `exiftool -listwf` cannot be queried.
/// Extensions outside the writable set get an `.xmp` sidecar instead of
/// in-place writes.
const WRITABLE_FALLBACK: &[&str] = &[
    ".3gp", ".dng", ".gif", ".heic", ".heif", ".jpeg", ".jpg", ".m4v", ".mov", ".mp4", ".png",
    ".tif", ".tiff",
];

/// Set of extensions the external tool can write metadata into, as reported
/// by `exiftool -listwf`. Queried once per run.
#[derive(Debug, Clone)]
pub struct WritableSet {
    extensions: Vec<String>,
}

impl WritableSet {
    /// Parse `-listwf` output. The listing is a run of whitespace-separated
    /// upper-case tokens (`JPG PNG HEIC ...`) surrounded by prose; any token
    /// that is not pure upper-case alphanumerics with at least one letter is
    /// discarded.
    pub fn from_listwf_output(output: &str) -> Self {
        let mut extensions: Vec<String> = output
            .split_whitespace()
            .map(|token| token.trim_matches(|c: char| " \t\r\n,;:()[]{}".contains(c)))
            .filter(|token| is_writable_token(token))
            .map(|token| format!(".{}", token.to_ascii_lowercase()))
            .collect();
        extensions.sort();
        extensions.dedup();
        Self { extensions }
    }

    pub fn fallback() -> Self {
        Self {
            extensions: WRITABLE_FALLBACK.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn contains(&self, ext: &str) -> bool {
        let normalized = normalize_extension(ext);
        !normalized.is_empty() && self.extensions.iter().any(|e| *e == normalized)
    }
}

fn normalize_extension(ext: &str) -> String {
    let trimmed = ext.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('.') {
        trimmed
    } else {
        format!(".{trimmed}")
    }
}

fn is_writable_token(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    let mut has_letter = false;
    for c in token.chars() {
        match c {
            'A'..='Z' => has_letter = true,
            '0'..='9' => {}
            _ => return false,
        }
    }
    has_letter
}
