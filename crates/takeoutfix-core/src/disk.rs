//! Disk-space projection for extraction.
//!
//! Two figures are planned from the validator output: the space needed when
//! all archives stay on disk, and the peak when each ZIP is deleted right
//! after its own extraction (low-space mode). Both carry a 10% margin,
//! rounded up and saturating.

use std::path::Path;

use serde::Serialize;

use crate::zipcheck::ArchiveIntegrity;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SpaceCheck {
    pub available_bytes: u64,
    pub required_bytes: u64,
    pub required_with_delete_bytes: u64,
    pub enough: bool,
    pub enough_with_delete: bool,
}

pub fn check_disk_space(path: &Path, archives: &[ArchiveIntegrity]) -> anyhow::Result<SpaceCheck> {
    let available = fs2::available_space(path)?;
    let (required, required_with_delete) = estimate_required_bytes(archives);
    Ok(SpaceCheck {
        available_bytes: available,
        required_bytes: required,
        required_with_delete_bytes: required_with_delete,
        enough: available >= required,
        enough_with_delete: available >= required_with_delete,
    })
}

/// Returns `(required_normal, required_with_delete)`. Corrupt archives are
/// excluded. Delete-mode tracks the running net footprint: each archive adds
/// its uncompressed bytes to the peak before its own ZIP bytes are freed.
fn estimate_required_bytes(archives: &[ArchiveIntegrity]) -> (u64, u64) {
    let mut normal_base: u64 = 0;
    let mut delete_mode_peak: i128 = 0;
    let mut prefix_net: i128 = 0;

    for archive in archives {
        if archive.is_corrupt() {
            continue;
        }
        normal_base = normal_base.saturating_add(archive.uncompressed_bytes);

        let current_peak = prefix_net + archive.uncompressed_bytes as i128;
        if current_peak > delete_mode_peak {
            delete_mode_peak = current_peak;
        }
        prefix_net += archive.uncompressed_bytes as i128 - archive.archive.size_bytes as i128;
    }

    let delete_mode_peak = delete_mode_peak.max(0).min(u64::MAX as i128) as u64;
    (add_margin(normal_base), add_margin(delete_mode_peak))
}

/// `v + ceil(v / 10)`, saturating at `u64::MAX`.
fn add_margin(v: u64) -> u64 {
    let mut extra = v / 10;
    if v % 10 != 0 {
        extra += 1;
    }
    v.saturating_add(extra)
}

pub fn format_bytes(b: u64) -> String {
    const UNIT: u64 = 1024;
    if b < UNIT {
        return format!("{b} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = b / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}iB", b as f64 / div as f64, ['K', 'M', 'G', 'T', 'P', 'E'][exp])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zipcheck::{fingerprint, ZipArchiveInfo};
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn archive(zip_bytes: u64, uncompressed: u64, corrupt: bool) -> ArchiveIntegrity {
        let mtime = SystemTime::UNIX_EPOCH;
        ArchiveIntegrity {
            archive: ZipArchiveInfo {
                name: "t.zip".to_string(),
                path: PathBuf::from("t.zip"),
                size_bytes: zip_bytes,
                mtime,
                fingerprint: fingerprint(zip_bytes, mtime),
            },
            file_count: 1,
            uncompressed_bytes: uncompressed,
            error: corrupt.then(|| "bad".to_string()),
        }
    }

    #[test]
    fn planner_arithmetic() {
        // archives [(Z=10, U=100), (Z=95, U=100)]:
        // normal = 200 + 10% = 220
        // delete-mode peak = max(100, 100 - 10 + 100) = 190, + margin = 209
        let archives = [archive(10, 100, false), archive(95, 100, false)];
        let (normal, with_delete) = estimate_required_bytes(&archives);
        assert_eq!(normal, 220);
        assert_eq!(with_delete, 209);
    }

    #[test]
    fn delete_mode_never_exceeds_normal() {
        let cases: &[&[(u64, u64)]] = &[
            &[(10, 100), (95, 100)],
            &[(50, 50)],
            &[(100, 10), (100, 10), (100, 10)],
            &[(1, 1000), (999, 2), (3, 500)],
        ];
        for case in cases {
            let archives: Vec<_> = case.iter().map(|&(z, u)| archive(z, u, false)).collect();
            let (normal, with_delete) = estimate_required_bytes(&archives);
            assert!(with_delete <= normal, "case {case:?}");
        }
    }

    #[test]
    fn corrupt_archives_are_excluded() {
        let archives = [archive(10, 100, false), archive(10, 1_000_000, true)];
        let (normal, _) = estimate_required_bytes(&archives);
        assert_eq!(normal, 110);
    }

    #[test]
    fn margin_rounds_up_and_saturates() {
        assert_eq!(add_margin(0), 0);
        assert_eq!(add_margin(10), 11);
        assert_eq!(add_margin(11), 13); // 11 + ceil(1.1) = 11 + 2
        assert_eq!(add_margin(u64::MAX), u64::MAX);
    }

    #[test]
    fn compressed_larger_than_uncompressed_stays_non_negative() {
        let archives = [archive(1000, 10, false), archive(1000, 10, false)];
        let (_, with_delete) = estimate_required_bytes(&archives);
        // peak is the first archive's uncompressed size
        assert_eq!(with_delete, add_margin(10));
    }

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }
}
