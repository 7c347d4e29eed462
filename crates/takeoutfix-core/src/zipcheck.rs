//! Archive discovery and streaming integrity validation.
//!
//! Every entry of every archive is decompressed through a sink before any
//! extraction is attempted, so corrupt downloads are caught while the user
//! can still re-fetch them. Uncompressed sizes are summed for the disk-space
//! planner.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

/// A top-level `.zip` found in the working directory.
#[derive(Debug, Clone)]
pub struct ZipArchiveInfo {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub mtime: SystemTime,
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct ArchiveIntegrity {
    pub archive: ZipArchiveInfo,
    pub file_count: u32,
    pub uncompressed_bytes: u64,
    pub error: Option<String>,
}

impl ArchiveIntegrity {
    pub fn is_corrupt(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Default)]
pub struct IntegritySummary {
    /// Per-archive results, in input order.
    pub checked: Vec<ArchiveIntegrity>,
    pub total_uncompressed: u64,
    pub total_zip_bytes: u64,
}

impl IntegritySummary {
    pub fn corrupt_names(&self) -> Vec<String> {
        self.checked
            .iter()
            .filter(|c| c.is_corrupt())
            .map(|c| c.archive.name.clone())
            .collect()
    }
}

/// Cheap order-preserving archive identity: `{size}:{mtime_ns}`.
pub fn fingerprint(size: u64, mtime: SystemTime) -> String {
    let nanos = mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i128)
        .unwrap_or(0);
    format!("{size}:{nanos}")
}

/// Non-recursive scan of `dir` for `.zip` files, sorted case-insensitively
/// by name.
pub fn discover_top_level_zips(dir: &Path) -> anyhow::Result<Vec<ZipArchiveInfo>> {
    let mut zips = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !crate::mediaext::ext_of(&name).eq_ignore_ascii_case(".zip") {
            continue;
        }
        let metadata = entry.metadata()?;
        let mtime = metadata.modified()?;
        let size = metadata.len();
        zips.push(ZipArchiveInfo {
            fingerprint: fingerprint(size, mtime),
            name,
            path: entry.path(),
            size_bytes: size,
            mtime,
        });
    }
    zips.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(zips)
}

/// Validate all archives on a worker pool, preserving input order in the
/// result.
pub fn validate_all(zips: &[ZipArchiveInfo]) -> IntegritySummary {
    if zips.is_empty() {
        return IntegritySummary::default();
    }

    let bar = ProgressBar::new(zips.len() as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40}] {pos}/{len} validating {msg}")
            .unwrap(),
    );

    let checked: Vec<ArchiveIntegrity> = zips
        .par_iter()
        .map(|z| {
            bar.set_message(z.name.clone());
            let result = validate_zip(z);
            bar.inc(1);
            result
        })
        .collect();
    bar.finish_and_clear();

    let mut summary = IntegritySummary {
        checked,
        ..Default::default()
    };
    for check in &summary.checked {
        summary.total_zip_bytes += check.archive.size_bytes;
        if !check.is_corrupt() {
            summary.total_uncompressed += check.uncompressed_bytes;
        }
    }
    summary
}

/// Stream every entry of one archive through a sink. The first I/O or
/// decompression error marks the archive corrupt; counts up to that point
/// are kept.
pub fn validate_zip(z: &ZipArchiveInfo) -> ArchiveIntegrity {
    let mut result = ArchiveIntegrity {
        archive: z.clone(),
        file_count: 0,
        uncompressed_bytes: 0,
        error: None,
    };

    let file = match File::open(&z.path) {
        Ok(file) => file,
        Err(err) => {
            result.error = Some(format!("open zip: {err}"));
            return result;
        }
    };
    let mut archive = match zip::ZipArchive::new(file) {
        Ok(archive) => archive,
        Err(err) => {
            result.error = Some(format!("open zip: {err}"));
            return result;
        }
    };

    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(err) => {
                result.error = Some(format!("open entry #{index}: {err}"));
                return result;
            }
        };
        if entry.is_dir() {
            continue;
        }
        result.file_count += 1;
        result.uncompressed_bytes += entry.size();
        if let Err(err) = io::copy(&mut entry, &mut io::sink()) {
            result.error = Some(format!("read entry {}: {err}", entry.name()));
            return result;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn discovery_sorts_case_insensitively_and_skips_non_zip() {
        let dir = TempDir::new().unwrap();
        write_zip(&dir.path().join("b.zip"), &[("x", b"1")]);
        write_zip(&dir.path().join("A.ZIP"), &[("x", b"1")]);
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let zips = discover_top_level_zips(dir.path()).unwrap();
        let names: Vec<_> = zips.iter().map(|z| z.name.as_str()).collect();
        assert_eq!(names, ["A.ZIP", "b.zip"]);
        assert!(zips[0].fingerprint.contains(':'));
    }

    #[test]
    fn valid_archive_sums_uncompressed_sizes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.zip");
        write_zip(&path, &[("a.jpg", b"hello"), ("sub/b.jpg", b"world!!")]);

        let zips = discover_top_level_zips(dir.path()).unwrap();
        let summary = validate_all(&zips);
        assert_eq!(summary.checked.len(), 1);
        let check = &summary.checked[0];
        assert!(!check.is_corrupt());
        assert_eq!(check.file_count, 2);
        assert_eq!(check.uncompressed_bytes, 12);
        assert_eq!(summary.total_uncompressed, 12);
    }

    #[test]
    fn corrupt_archive_is_flagged_and_excluded_from_totals() {
        let dir = TempDir::new().unwrap();
        write_zip(&dir.path().join("good.zip"), &[("a.jpg", b"fine")]);
        fs::write(dir.path().join("bad.zip"), b"this is not a zip file").unwrap();

        let zips = discover_top_level_zips(dir.path()).unwrap();
        let summary = validate_all(&zips);
        assert_eq!(summary.checked.len(), 2);
        // input order preserved
        assert_eq!(summary.checked[0].archive.name, "bad.zip");
        assert!(summary.checked[0].is_corrupt());
        assert!(!summary.checked[1].is_corrupt());
        assert_eq!(summary.corrupt_names(), vec!["bad.zip"]);
        assert_eq!(summary.total_uncompressed, 4);
    }

    #[test]
    fn truncated_archive_fails_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.zip");
        write_zip(&path, &[("a.jpg", &vec![7u8; 64 * 1024])]);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let zips = discover_top_level_zips(dir.path()).unwrap();
        let summary = validate_all(&zips);
        assert!(summary.checked[0].is_corrupt());
    }
}
