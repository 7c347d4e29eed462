//! Filename canonicalization for Takeout's naming quirks.
//!
//! Takeout mangles sidecar names in several independent ways: the
//! `.supplemental-metadata` marker is truncated at arbitrary lengths, stems
//! are capped at 46 bytes, duplicate names grow a `(N)` index, rename
//! collisions grow a 5-character random suffix, edited variants carry
//! `-edited`, and Pixel Motion Photo sidecars are named after the still
//! image rather than the `.mp4`. This module folds all of that into
//! comparable lookup keys.

use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::mediaext;

pub const SUPPLEMENTAL_FULL: &str = ".supplemental-metadata";

/// Sidecar stems are truncated to this many bytes by Takeout.
pub const STEM_TRUNCATION_BYTES: usize = 46;

static NUMBER_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(\d+\)").unwrap());
static TRAILING_NUMBER_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d+)\)$").unwrap());
static RANDOM_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-[a-z0-9]{5}$").unwrap());

/// Normalized lookup key for a JSON sidecar basename, or "" when the name is
/// not a `.json` file at all.
pub fn normalize_json_key(name: &str) -> String {
    normalize_json_key_with(name, true)
}

pub fn normalize_json_key_with(name: &str, strip_random_suffix: bool) -> String {
    let name: String = name.nfc().collect::<String>().to_lowercase();
    let Some(stem) = name.strip_suffix(".json") else {
        return String::new();
    };
    let stem = strip_trailing_number_suffix(stem);
    let stem = strip_supplemental_suffix(stem);
    normalize_name_key(stem, strip_random_suffix)
}

/// Normalized lookup key for a media basename.
pub fn normalize_media_key(name: &str) -> String {
    normalize_media_key_with(name, true)
}

pub fn normalize_media_key_with(name: &str, strip_random_suffix: bool) -> String {
    let name: String = name.nfc().collect::<String>().to_lowercase();
    let ext = mediaext::ext_of(&name);
    let stem = &name[..name.len() - ext.len()];
    normalize_name_key(stem, strip_random_suffix)
}

fn normalize_name_key(name: &str, strip_random_suffix: bool) -> String {
    let mut name = name.replacen("-edited", "", 1);
    if strip_random_suffix {
        name = RANDOM_SUFFIX_RE.replace(&name, "").into_owned();
    }
    let name = strip_trailing_number_suffix(&name);
    let name = strip_known_media_extension(name);
    strip_trailing_number_suffix(name).to_string()
}

/// Strip the longest truncation of `.supplemental-metadata` (down to two
/// bytes, i.e. `.s`) from the end of a lowercased stem.
pub fn strip_supplemental_suffix(name: &str) -> &str {
    for len in (2..=SUPPLEMENTAL_FULL.len()).rev() {
        if name.ends_with(&SUPPLEMENTAL_FULL[..len]) {
            return &name[..name.len() - len];
        }
    }
    name
}

/// True when `s` is a valid (possibly truncated) supplemental marker.
pub fn is_supplemental_marker(s: &str) -> bool {
    let lower = s.to_lowercase();
    lower.len() >= 2
        && lower.len() <= SUPPLEMENTAL_FULL.len()
        && SUPPLEMENTAL_FULL.starts_with(&lower)
}

fn strip_trailing_number_suffix(name: &str) -> &str {
    match TRAILING_NUMBER_SUFFIX_RE.find(name) {
        Some(m) => &name[..m.start()],
        None => name,
    }
}

/// Strip a trailing whitelisted media extension, twice, to cover Takeout's
/// occasional double extensions (`VID.mp4.mov`).
fn strip_known_media_extension(name: &str) -> &str {
    let mut name = name;
    for _ in 0..2 {
        let mut found = false;
        for ext in mediaext::SUPPORTED {
            if let Some(stripped) = name.strip_suffix(ext) {
                name = stripped;
                found = true;
                break;
            }
        }
        if !found {
            break;
        }
    }
    name
}

/// Explicit dedup index of a media basename: the `(N)` just before the final
/// extension. `(0)` counts as a real index.
pub fn media_dedup_index(name: &str) -> Option<u32> {
    let base = basename(name);
    let ext = mediaext::ext_of(base);
    let stem = &base[..base.len() - ext.len()];
    trailing_dedup_index(stem)
}

/// Recovered dedup index of a JSON sidecar basename. The legacy position
/// (`...supplemental-metadata(N).json`) takes priority; otherwise the index
/// may hide in the media stem (`name(N).ext.supplemental-metadata.json`).
pub fn json_dedup_index(name: &str) -> Option<u32> {
    let base = basename(name).to_lowercase();
    let stem = base.strip_suffix(".json").unwrap_or(&base);
    if let Some(index) = trailing_dedup_index(stem) {
        return Some(index);
    }
    let stem = strip_supplemental_suffix(stem);
    let stem = strip_known_media_extension(stem);
    trailing_dedup_index(stem)
}

fn trailing_dedup_index(name: &str) -> Option<u32> {
    TRAILING_NUMBER_SUFFIX_RE
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Remove a random 5-character collision suffix from the stem, keeping the
/// extension. Returns the input unchanged when no suffix is present.
pub fn remove_random_suffix(name: &str) -> String {
    let ext = mediaext::ext_of(name);
    let stem = &name[..name.len() - ext.len()];
    let stripped = RANDOM_SUFFIX_RE.replace(stem, "");
    format!("{stripped}{ext}")
}

/// True when the stem (extension removed) ends in `-[a-z0-9]{5}`.
pub fn has_random_suffix_stem(name: &str) -> bool {
    let ext = mediaext::ext_of(name);
    let stem = &name[..name.len() - ext.len()];
    RANDOM_SUFFIX_RE.is_match(stem)
}

/// Truncate to at most `max` bytes, backing off to a char boundary.
pub fn truncate_to_boundary(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while end > 0 && !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// All normalized keys under which a media basename may find its sidecar in
/// the global index: the name itself, `-edited` removed, the dedup index
/// moved behind the extension, the 46-byte prefix with and without the
/// index, and the MP4 cross-extension stems. The random-suffix variant is
/// generated only when the caller has established the fallback condition
/// (a `-xxxxx` stem plus a same-directory sibling without it).
pub fn media_lookup_keys(name: &str, strip_random_suffix: bool) -> Vec<String> {
    let mut keys = Vec::new();
    let mut add = |candidate: &str| {
        let key = normalize_media_key_with(candidate, strip_random_suffix);
        if !key.is_empty() {
            keys.push(key);
        }
    };

    add(name);
    if strip_random_suffix {
        add(&remove_random_suffix(name));
    }

    if name.to_lowercase().contains("-edited") {
        add(&name.replacen("-edited", "", 1));
    }

    if let Some(m) = NUMBER_SUFFIX_RE.find(name) {
        let index = m.as_str().to_string();
        add(&format!("{}{}", name.replacen(&index, "", 1), index));
    }

    if name.len() > STEM_TRUNCATION_BYTES {
        let prefix = truncate_to_boundary(name, STEM_TRUNCATION_BYTES);
        add(prefix);
        if let Some(m) = NUMBER_SUFFIX_RE.find(name) {
            add(&format!("{}{}", prefix, m.as_str()));
        }
    }

    let ext = mediaext::ext_of(name);
    if ext.eq_ignore_ascii_case(".mp4") {
        let stem = &name[..name.len() - ext.len()];
        for still in [".jpg", ".jpeg", ".heic"] {
            add(&format!("{stem}{still}"));
        }
    }

    keys.sort();
    keys.dedup();
    keys
}

/// Media extension a sidecar name encodes as its target (`IMG.jpg.…json` →
/// `.jpg`), lowercased, or None when the stem carries no recognizable media
/// extension.
pub fn json_target_ext(name: &str) -> Option<String> {
    let base = basename(name).to_lowercase();
    let stem = base.strip_suffix(".json")?;
    let stem = strip_trailing_number_suffix(stem);
    let stem = strip_supplemental_suffix(stem);
    let ext = mediaext::ext_of(stem);
    if mediaext::is_supported_media_extension(ext) {
        Some(ext.to_string())
    } else {
        None
    }
}

fn basename(name: &str) -> &str {
    match name.rfind('/') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}
