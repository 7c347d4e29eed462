//! Run reporting.
//!
//! Problems accumulate per category with a capped sample list; the final
//! report is printed as a summary and persisted as a JSON artifact under
//! `.takeoutfix/reports/` so runs can be compared after the fact.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::disk::SpaceCheck;

const MAX_PROBLEM_SAMPLES: usize = 5;

/// Problem categories that block deferred ZIP deletion and force a
/// partial-success exit.
pub const HARD_PROBLEM_CATEGORIES: &[&str] = &["extension errors", "metadata errors"];

#[derive(Debug, Clone, Default)]
pub struct Problems {
    entries: BTreeMap<String, ProblemEntry>,
}

#[derive(Debug, Clone, Default)]
struct ProblemEntry {
    count: u64,
    samples: Vec<String>,
}

impl Problems {
    pub fn add(&mut self, category: &str, sample: impl Into<String>) {
        self.add_n(category, 1, &[sample.into()]);
    }

    pub fn add_n(&mut self, category: &str, count: u64, samples: &[String]) {
        let entry = self.entries.entry(category.to_string()).or_default();
        entry.count += count;
        let room = MAX_PROBLEM_SAMPLES.saturating_sub(entry.samples.len());
        entry
            .samples
            .extend(samples.iter().take(room).cloned());
    }

    pub fn merge(&mut self, other: &Problems) {
        for (category, entry) in &other.entries {
            self.add_n(category, entry.count, &entry.samples);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, category: &str) -> u64 {
        self.entries.get(category).map(|e| e.count).unwrap_or(0)
    }

    pub fn has_hard_problems(&self) -> bool {
        HARD_PROBLEM_CATEGORIES
            .iter()
            .any(|category| self.count(category) > 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64, &[String])> {
        self.entries
            .iter()
            .map(|(category, entry)| (category.as_str(), entry.count, entry.samples.as_slice()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "PARTIAL_SUCCESS")]
    PartialSuccess,
    #[serde(rename = "FAILED")]
    Failed,
}

/// Everything one run learned about itself.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub exit_code: i32,
    pub workdir: PathBuf,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,

    pub archives_found: usize,
    pub archives_valid: usize,
    pub archives_corrupt: usize,
    pub corrupt_names: Vec<String>,

    pub disk: SpaceCheck,
    pub auto_delete: bool,

    pub extracted_archives: u64,
    pub skipped_archives: u64,
    pub extracted_files: u64,
    pub deleted_zips: u64,
    pub delete_errors: Vec<String>,

    pub media_found: u64,
    pub metadata_applied: u64,
    pub filename_date_applied: u64,
    pub renamed_extensions: u64,
    pub xmp_sidecars: u64,
    pub missing_json: u64,
    pub ambiguous_media: u64,

    pub json_removed: u64,
    pub json_kept_due_to_errors: u64,
    pub json_kept_unused: u64,

    pub zip_scan_duration: Duration,
    pub zip_validate_duration: Duration,
    pub disk_check_duration: Duration,
    pub extract_duration: Duration,
    pub process_duration: Duration,
    pub total_duration: Duration,

    pub problems: Problems,
}

impl RunReport {
    pub fn new(workdir: &Path) -> Self {
        let now = Local::now();
        Self {
            status: RunStatus::Failed,
            exit_code: 0,
            workdir: workdir.to_path_buf(),
            started_at: now,
            finished_at: now,
            archives_found: 0,
            archives_valid: 0,
            archives_corrupt: 0,
            corrupt_names: Vec::new(),
            disk: SpaceCheck::default(),
            auto_delete: false,
            extracted_archives: 0,
            skipped_archives: 0,
            extracted_files: 0,
            deleted_zips: 0,
            delete_errors: Vec::new(),
            media_found: 0,
            metadata_applied: 0,
            filename_date_applied: 0,
            renamed_extensions: 0,
            xmp_sidecars: 0,
            missing_json: 0,
            ambiguous_media: 0,
            json_removed: 0,
            json_kept_due_to_errors: 0,
            json_kept_unused: 0,
            zip_scan_duration: Duration::ZERO,
            zip_validate_duration: Duration::ZERO,
            disk_check_duration: Duration::ZERO,
            extract_duration: Duration::ZERO,
            process_duration: Duration::ZERO,
            total_duration: Duration::ZERO,
            problems: Problems::default(),
        }
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    status: RunStatus,
    exit_code: i32,
    workdir: String,
    started_at_local: String,
    finished_at_local: String,
    duration_ms: u128,
    archives: JsonArchives<'a>,
    disk: JsonDisk,
    extraction: JsonExtraction<'a>,
    metadata: JsonMetadata,
    json_cleanup: JsonCleanup,
    timings_ms: JsonTimings,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    problems: Vec<JsonProblem>,
}

#[derive(Serialize)]
struct JsonArchives<'a> {
    found: usize,
    valid: usize,
    corrupt: usize,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    corrupt_names: &'a [String],
}

#[derive(Serialize)]
struct JsonDisk {
    available_bytes: u64,
    required_bytes: u64,
    required_with_delete_bytes: u64,
    enough: bool,
    enough_with_delete: bool,
    auto_delete: bool,
}

#[derive(Serialize)]
struct JsonExtraction<'a> {
    extracted_archives: u64,
    skipped_archives: u64,
    extracted_files: u64,
    deleted_zips: u64,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    delete_errors: &'a [String],
}

#[derive(Serialize)]
struct JsonMetadata {
    media_found: u64,
    metadata_applied: u64,
    filename_date_applied: u64,
    renamed_extensions: u64,
    xmp_sidecars: u64,
    missing_json: u64,
    ambiguous_media: u64,
}

#[derive(Serialize)]
struct JsonCleanup {
    removed: u64,
    kept_due_to_errors: u64,
    kept_unused: u64,
}

#[derive(Serialize)]
struct JsonTimings {
    zip_scan: u128,
    zip_validate: u128,
    disk_check: u128,
    extract: u128,
    process: u128,
    total: u128,
}

#[derive(Serialize)]
struct JsonProblem {
    category: String,
    count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    samples: Vec<String>,
}

/// Write the JSON artifact under `{workdir}/.takeoutfix/reports/` and return
/// its path.
pub fn write_report_json(report: &RunReport) -> anyhow::Result<PathBuf> {
    let report_dir = report.workdir.join(".takeoutfix").join("reports");
    fs::create_dir_all(&report_dir)?;

    let file_name = format!("report-{}.json", report.finished_at.format("%Y%m%d-%H%M%S"));
    let path = report_dir.join(file_name);

    let payload = JsonReport {
        status: report.status,
        exit_code: report.exit_code,
        workdir: report.workdir.to_string_lossy().into_owned(),
        started_at_local: report.started_at.to_rfc3339(),
        finished_at_local: report.finished_at.to_rfc3339(),
        duration_ms: report.total_duration.as_millis(),
        archives: JsonArchives {
            found: report.archives_found,
            valid: report.archives_valid,
            corrupt: report.archives_corrupt,
            corrupt_names: &report.corrupt_names,
        },
        disk: JsonDisk {
            available_bytes: report.disk.available_bytes,
            required_bytes: report.disk.required_bytes,
            required_with_delete_bytes: report.disk.required_with_delete_bytes,
            enough: report.disk.enough,
            enough_with_delete: report.disk.enough_with_delete,
            auto_delete: report.auto_delete,
        },
        extraction: JsonExtraction {
            extracted_archives: report.extracted_archives,
            skipped_archives: report.skipped_archives,
            extracted_files: report.extracted_files,
            deleted_zips: report.deleted_zips,
            delete_errors: &report.delete_errors,
        },
        metadata: JsonMetadata {
            media_found: report.media_found,
            metadata_applied: report.metadata_applied,
            filename_date_applied: report.filename_date_applied,
            renamed_extensions: report.renamed_extensions,
            xmp_sidecars: report.xmp_sidecars,
            missing_json: report.missing_json,
            ambiguous_media: report.ambiguous_media,
        },
        json_cleanup: JsonCleanup {
            removed: report.json_removed,
            kept_due_to_errors: report.json_kept_due_to_errors,
            kept_unused: report.json_kept_unused,
        },
        timings_ms: JsonTimings {
            zip_scan: report.zip_scan_duration.as_millis(),
            zip_validate: report.zip_validate_duration.as_millis(),
            disk_check: report.disk_check_duration.as_millis(),
            extract: report.extract_duration.as_millis(),
            process: report.process_duration.as_millis(),
            total: report.total_duration.as_millis(),
        },
        problems: report
            .problems
            .iter()
            .map(|(category, count, samples)| JsonProblem {
                category: category.to_string(),
                count,
                samples: samples.to_vec(),
            })
            .collect(),
    };

    let data = serde_json::to_vec_pretty(&payload)?;
    fs::write(&path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn samples_are_capped_at_five() {
        let mut problems = Problems::default();
        for i in 0..8 {
            problems.add("metadata errors", format!("file-{i}.jpg"));
        }
        let (category, count, samples) = problems.iter().next().unwrap();
        assert_eq!(category, "metadata errors");
        assert_eq!(count, 8);
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[0], "file-0.jpg");
    }

    #[test]
    fn hard_problem_detection() {
        let mut problems = Problems::default();
        problems.add("filename date warnings", "a.jpg");
        assert!(!problems.has_hard_problems());
        problems.add("extension errors", "b.jpg");
        assert!(problems.has_hard_problems());
    }

    #[test]
    fn merge_accumulates_counts_and_caps_samples() {
        let mut a = Problems::default();
        a.add_n("metadata errors", 3, &["x.jpg".to_string(), "y.jpg".to_string()]);
        let mut b = Problems::default();
        b.add_n(
            "metadata errors",
            4,
            &["z1.jpg".to_string(), "z2.jpg".to_string(), "z3.jpg".to_string(), "z4.jpg".to_string()],
        );
        a.merge(&b);
        let (_, count, samples) = a.iter().next().unwrap();
        assert_eq!(count, 7);
        assert_eq!(samples.len(), 5);
    }

    #[test]
    fn report_json_schema_and_mode() {
        let dir = TempDir::new().unwrap();
        let mut report = RunReport::new(dir.path());
        report.status = RunStatus::Success;
        report.media_found = 3;
        report.metadata_applied = 3;
        report.problems.add("create date warnings", "a.jpg");

        let path = write_report_json(&report).unwrap();
        assert!(path.starts_with(dir.path().join(".takeoutfix/reports")));

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["status"], "SUCCESS");
        assert_eq!(value["metadata"]["media_found"], 3);
        assert_eq!(value["json_cleanup"]["removed"], 0);
        assert_eq!(value["problems"][0]["category"], "create date warnings");
        assert!(value["timings_ms"]["total"].is_number());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }
}
