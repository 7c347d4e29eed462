//! The Media↔JSON resolver.
//!
//! Walks an extracted Takeout tree and decides, for every media file, which
//! single sidecar JSON describes it, which media are genuinely missing a
//! sidecar, and which pairings are truly ambiguous. Resolution runs in two
//! stages: a directory-local stage built on stem rewrites, then a global
//! stage over normalized keys for everything the local stage could not
//! settle. One sidecar may serve several media files only when all of them
//! are byte-identical.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use walkdir::WalkDir;

use crate::fingerprint::FingerprintCache;
use crate::mediaext;
use crate::normalize;

/// Resolver output. Every discovered media RelPath lands in exactly one of
/// `pairs`, `missing` or `ambiguous`; `unused_json` never intersects
/// `pairs` values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pairing {
    pub pairs: BTreeMap<String, String>,
    pub missing: Vec<String>,
    pub ambiguous: BTreeMap<String, Vec<String>>,
    pub unused_json: Vec<String>,
}

impl Pairing {
    pub fn media_found(&self) -> usize {
        self.pairs.len() + self.missing.len() + self.ambiguous.len()
    }
}

/// Scan a Takeout root and match media files with their sidecars across all
/// nested folders.
pub fn scan_takeout(root: &Path) -> anyhow::Result<Pairing> {
    let mut json_by_dir: HashMap<String, BTreeSet<String>> = HashMap::new();
    let mut media_by_dir: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut all_json: Vec<String> = Vec::new();

    for entry in WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walked entry is under root");
        let rel = rel.to_string_lossy().replace('\\', "/");
        let (dir, base) = split_rel(&rel);

        if mediaext::is_json_file(base) {
            json_by_dir
                .entry(dir.to_string())
                .or_default()
                .insert(base.to_string());
            all_json.push(rel.clone());
        } else if mediaext::is_media_candidate(base) {
            media_by_dir
                .entry(dir.to_string())
                .or_default()
                .push(base.to_string());
        }
    }

    for media in media_by_dir.values_mut() {
        media.sort();
    }
    all_json.sort();

    let mut pairing = Pairing::default();
    let mut used_json: HashSet<String> = HashSet::new();
    let mut json_assignments: HashMap<String, Vec<String>> = HashMap::new();
    let mut cache = FingerprintCache::new(root);
    let mut unresolved: Vec<String> = Vec::new();

    // Local stage: propose one sidecar per media within each directory, then
    // settle intra-directory conflicts.
    let empty_json: BTreeSet<String> = BTreeSet::new();
    for (dir, media_files) in &media_by_dir {
        let dir_json = json_by_dir.get(dir).unwrap_or(&empty_json);
        let dir_media: HashSet<&str> = media_files.iter().map(String::as_str).collect();

        let mut candidate_by_media: HashMap<String, String> = HashMap::new();
        let mut claims_by_json: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for media in media_files {
            let media_rel = join_rel(dir, media);
            match local_json_for_media(media, dir_json, &dir_media) {
                Some(json) => {
                    let json_rel = join_rel(dir, &json);
                    candidate_by_media.insert(media_rel.clone(), json_rel.clone());
                    claims_by_json.entry(json_rel).or_default().push(media_rel);
                }
                None => unresolved.push(media_rel),
            }
        }

        let mut shared: HashSet<String> = HashSet::new();
        let mut winner: HashMap<String, String> = HashMap::new();
        for (json_rel, claims) in &claims_by_json {
            if claims.len() <= 1 {
                continue;
            }
            if can_share_across_claims(json_rel, claims, &json_assignments, &mut cache) {
                shared.insert(json_rel.clone());
            } else if let Some(win) = unique_claimant_by_target_ext(json_rel, claims) {
                winner.insert(json_rel.clone(), win);
            }
        }

        for media in media_files {
            let media_rel = join_rel(dir, media);
            let Some(json_rel) = candidate_by_media.get(&media_rel) else {
                continue;
            };
            let claims = &claims_by_json[json_rel];
            if claims.len() > 1 {
                if shared.contains(json_rel) {
                    assign(&mut pairing, &mut used_json, &mut json_assignments, &media_rel, json_rel);
                    continue;
                }
                match winner.get(json_rel) {
                    Some(win) if *win == media_rel => {}
                    _ => {
                        unresolved.push(media_rel);
                        continue;
                    }
                }
            }
            if used_json.contains(json_rel)
                && !can_share_with_existing(&media_rel, json_rel, &json_assignments, &mut cache)
            {
                unresolved.push(media_rel);
                continue;
            }
            assign(&mut pairing, &mut used_json, &mut json_assignments, &media_rel, json_rel);
        }
    }

    // Global stage: everything unresolved is re-indexed by normalized key
    // across the whole tree.
    let mut global_index: HashMap<String, Vec<String>> = HashMap::new();
    for json_rel in &all_json {
        let (_, base) = split_rel(json_rel);
        let key = normalize::normalize_json_key(base);
        if !key.is_empty() {
            global_index.entry(key).or_default().push(json_rel.clone());
        }
    }

    unresolved.sort();
    let mut candidates_by_media: HashMap<String, Vec<String>> = HashMap::new();
    let mut candidate_usage: HashMap<String, usize> = HashMap::new();
    let mut claims_by_candidate: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for media_rel in &unresolved {
        let (dir, base) = split_rel(media_rel);
        let dir_media: HashSet<&str> = media_by_dir
            .get(dir)
            .map(|files| files.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let allow_random_suffix = should_use_random_suffix_fallback(base, &dir_media);
        let keys = normalize::media_lookup_keys(base, allow_random_suffix);
        let mut unique: BTreeSet<String> = BTreeSet::new();
        for key in &keys {
            if let Some(matches) = global_index.get(key) {
                unique.extend(matches.iter().cloned());
            }
        }
        let candidates =
            apply_global_candidate_rules(media_rel, unique.into_iter().collect::<Vec<_>>());

        if candidates.len() == 1 {
            let candidate = candidates[0].clone();
            *candidate_usage.entry(candidate.clone()).or_default() += 1;
            claims_by_candidate
                .entry(candidate)
                .or_default()
                .push(media_rel.clone());
        }
        candidates_by_media.insert(media_rel.clone(), candidates);
    }

    let mut shared: HashSet<String> = HashSet::new();
    let mut winner: HashMap<String, String> = HashMap::new();
    for (candidate, claims) in &claims_by_candidate {
        if claims.len() <= 1 {
            continue;
        }
        if can_share_across_claims(candidate, claims, &json_assignments, &mut cache) {
            shared.insert(candidate.clone());
        } else if let Some(win) = unique_claimant_by_target_ext(candidate, claims) {
            winner.insert(candidate.clone(), win);
        } else if let Some(win) = unique_same_dir_claimant(candidate, claims) {
            winner.insert(candidate.clone(), win);
        }
    }

    for media_rel in &unresolved {
        let candidates = &candidates_by_media[media_rel];
        match candidates.len() {
            0 => pairing.missing.push(media_rel.clone()),
            1 => {
                let candidate = &candidates[0];
                if shared.contains(candidate) {
                    assign(&mut pairing, &mut used_json, &mut json_assignments, media_rel, candidate);
                    continue;
                }
                if candidate_usage[candidate] > 1 {
                    match winner.get(candidate) {
                        Some(win) if win == media_rel => {}
                        _ => {
                            pairing
                                .ambiguous
                                .insert(media_rel.clone(), candidates.clone());
                            continue;
                        }
                    }
                }
                // Candidates are precomputed before assignment; keep this
                // guard so rule changes cannot reintroduce double claiming.
                if used_json.contains(candidate)
                    && !can_share_with_existing(media_rel, candidate, &json_assignments, &mut cache)
                {
                    pairing
                        .ambiguous
                        .insert(media_rel.clone(), candidates.clone());
                    continue;
                }
                assign(&mut pairing, &mut used_json, &mut json_assignments, media_rel, candidate);
            }
            _ => {
                pairing
                    .ambiguous
                    .insert(media_rel.clone(), candidates.clone());
            }
        }
    }

    for json_rel in &all_json {
        if !used_json.contains(json_rel) {
            pairing.unused_json.push(json_rel.clone());
        }
    }
    pairing.missing.sort();
    pairing.unused_json.sort();

    Ok(pairing)
}

fn assign(
    pairing: &mut Pairing,
    used_json: &mut HashSet<String>,
    json_assignments: &mut HashMap<String, Vec<String>>,
    media_rel: &str,
    json_rel: &str,
) {
    pairing
        .pairs
        .insert(media_rel.to_string(), json_rel.to_string());
    used_json.insert(json_rel.to_string());
    json_assignments
        .entry(json_rel.to_string())
        .or_default()
        .push(media_rel.to_string());
}

/// Directory-local candidate lookup: the ordered ladder of stem rewrites.
fn local_json_for_media(
    media: &str,
    dir_json: &BTreeSet<String>,
    dir_media: &HashSet<&str>,
) -> Option<String> {
    if let Some(json) = json_by_stem(media, media, dir_json) {
        return Some(json);
    }

    let ext = mediaext::ext_of(media);
    let stem = &media[..media.len() - ext.len()];
    if let Some(json) = json_by_stem(media, stem, dir_json) {
        return Some(json);
    }

    if media.to_lowercase().contains("-edited") {
        return local_json_for_media(&media.replacen("-edited", "", 1), dir_json, dir_media);
    }

    // Takeout's older convention put the dedup index after the extension.
    if let Some(m) = find_number_suffix(media) {
        let rewritten = format!("{}{}", media.replacen(&m, "", 1), m);
        if let Some(json) = json_by_stem(media, &rewritten, dir_json) {
            return Some(json);
        }
    }

    if media.len() > normalize::STEM_TRUNCATION_BYTES {
        let prefix = normalize::truncate_to_boundary(media, normalize::STEM_TRUNCATION_BYTES);
        if let Some(m) = find_number_suffix(media) {
            let stem = format!("{prefix}{m}");
            if let Some(json) = json_by_stem(media, &stem, dir_json) {
                return Some(json);
            }
        }
        if let Some(json) = json_by_stem(media, prefix, dir_json) {
            return Some(json);
        }
    }

    // Pixel Motion Photos: the sidecar is named after the still image.
    if ext.eq_ignore_ascii_case(".mp4") {
        let base = &media[..media.len() - ext.len()];
        for still in [".jpg", ".jpeg", ".heic"] {
            if let Some(json) = json_by_stem(media, &format!("{base}{still}"), dir_json) {
                return Some(json);
            }
            let upper = still.to_uppercase();
            if let Some(json) = json_by_stem(media, &format!("{base}{upper}"), dir_json) {
                return Some(json);
            }
        }
    }

    if let Some(json) = json_by_normalized_key(media, dir_json, false) {
        return Some(json);
    }

    if should_use_random_suffix_fallback(media, dir_media) {
        if let Some(json) = json_by_normalized_key(media, dir_json, true) {
            return Some(json);
        }
    }

    None
}

fn json_by_stem(media: &str, stem: &str, dir_json: &BTreeSet<String>) -> Option<String> {
    let direct = format!("{stem}.json");
    if let Some(json) = dir_json.iter().find(|j| j.eq_ignore_ascii_case(&direct)) {
        return Some(json.clone());
    }

    let candidates = supplemental_json_by_stem(stem, dir_json);
    let candidates = filter_by_dedup_index(media, candidates);
    match candidates.len() {
        1 => Some(candidates.into_iter().next().unwrap()),
        _ => None,
    }
}

fn supplemental_json_by_stem(stem: &str, dir_json: &BTreeSet<String>) -> Vec<String> {
    let lower_stem = stem.to_lowercase();
    let mut unique: BTreeSet<String> = BTreeSet::new();
    for json in dir_json {
        let lower = json.to_lowercase();
        let Some(base) = lower.strip_suffix(".json") else {
            continue;
        };
        let base = strip_trailing_index(base);
        if base.len() <= lower_stem.len() || !base.starts_with(&lower_stem) {
            continue;
        }
        let suffix = &base[lower_stem.len()..];
        if suffix.starts_with('.') && normalize::is_supplemental_marker(suffix) {
            unique.insert(json.clone());
        }
    }
    unique.into_iter().collect()
}

fn json_by_normalized_key(
    media: &str,
    dir_json: &BTreeSet<String>,
    strip_random_suffix: bool,
) -> Option<String> {
    let media_key = normalize::normalize_media_key_with(media, strip_random_suffix);
    let mut matches: Vec<String> = dir_json
        .iter()
        .filter(|json| {
            let key = normalize::normalize_json_key_with(json, strip_random_suffix);
            !key.is_empty() && key == media_key
        })
        .cloned()
        .collect();
    matches.sort();
    let matches = filter_by_dedup_index(media, matches);
    match matches.len() {
        1 => Some(matches.into_iter().next().unwrap()),
        _ => None,
    }
}

/// Duplicate-index rule: media carrying an explicit `(N)` (including `(0)`)
/// only accepts sidecars recovering the same index; base media prefers base
/// sidecars but keeps the full set when no base sidecar exists.
fn filter_by_dedup_index(media: &str, candidates: Vec<String>) -> Vec<String> {
    if candidates.is_empty() {
        return candidates;
    }
    let media_index = normalize::media_dedup_index(media);
    let mut filtered: Vec<String> = candidates
        .iter()
        .filter(|candidate| {
            let json_index = normalize::json_dedup_index(candidate);
            match media_index {
                Some(idx) => json_index == Some(idx),
                None => json_index.is_none(),
            }
        })
        .cloned()
        .collect();

    if filtered.is_empty() {
        if media_index.is_some() {
            return Vec::new();
        }
        return candidates;
    }
    filtered.sort();
    filtered
}

fn should_use_random_suffix_fallback(media: &str, dir_media: &HashSet<&str>) -> bool {
    if dir_media.is_empty() || !normalize::has_random_suffix_stem(media) {
        return false;
    }
    let sibling = normalize::remove_random_suffix(media);
    sibling != media && dir_media.contains(sibling.as_str())
}

fn apply_global_candidate_rules(media_rel: &str, candidates: Vec<String>) -> Vec<String> {
    let filtered = filter_by_dedup_index(media_rel, candidates);
    if filtered.len() <= 1 {
        return filtered;
    }

    let media_dir = dir_of(media_rel);
    let same_dir: Vec<String> = filtered
        .iter()
        .filter(|candidate| dir_of(candidate) == media_dir)
        .cloned()
        .collect();
    if same_dir.len() == 1 {
        return same_dir;
    }

    // Same-dir narrowing that finds none or several keeps the set unchanged;
    // ambiguity handling decides later.
    filtered
}

fn unique_claimant_by_target_ext(json_rel: &str, claims: &[String]) -> Option<String> {
    let target = normalize::json_target_ext(json_rel)?;
    let mut matching = claims
        .iter()
        .filter(|claim| mediaext::ext_of(claim).eq_ignore_ascii_case(&target));
    match (matching.next(), matching.next()) {
        (Some(win), None) => Some(win.clone()),
        _ => None,
    }
}

fn unique_same_dir_claimant(json_rel: &str, claims: &[String]) -> Option<String> {
    let json_dir = dir_of(json_rel);
    let mut same_dir = claims.iter().filter(|claim| dir_of(claim) == json_dir);
    match (same_dir.next(), same_dir.next()) {
        (Some(win), None) => Some(win.clone()),
        _ => None,
    }
}

fn can_share_across_claims(
    json_rel: &str,
    claims: &[String],
    json_assignments: &HashMap<String, Vec<String>>,
    cache: &mut FingerprintCache,
) -> bool {
    if claims.len() <= 1 {
        return false;
    }
    let mut combined: Vec<String> = json_assignments
        .get(json_rel)
        .cloned()
        .unwrap_or_default();
    combined.extend(claims.iter().cloned());
    cache.all_identical(&combined)
}

fn can_share_with_existing(
    media_rel: &str,
    json_rel: &str,
    json_assignments: &HashMap<String, Vec<String>>,
    cache: &mut FingerprintCache,
) -> bool {
    let Some(existing) = json_assignments.get(json_rel) else {
        return false;
    };
    if existing.is_empty() {
        return false;
    }
    let mut combined = existing.clone();
    combined.push(media_rel.to_string());
    cache.all_identical(&combined)
}

fn find_number_suffix(name: &str) -> Option<String> {
    static RE: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"\(\d+\)").unwrap());
    RE.find(name).map(|m| m.as_str().to_string())
}

fn strip_trailing_index(name: &str) -> &str {
    static RE: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"\(\d+\)$").unwrap());
    match RE.find(name) {
        Some(m) => &name[..m.start()],
        None => name,
    }
}

fn split_rel(rel: &str) -> (&str, &str) {
    match rel.rfind('/') {
        Some(pos) => (&rel[..pos], &rel[pos + 1..]),
        None => (".", rel),
    }
}

fn dir_of(rel: &str) -> &str {
    split_rel(rel).0
}

fn join_rel(dir: &str, base: &str) -> String {
    if dir == "." {
        base.to_string()
    } else {
        format!("{dir}/{base}")
    }
}
