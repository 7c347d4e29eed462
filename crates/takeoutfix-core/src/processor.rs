//! Per-media processing.
//!
//! Paired media run through a two-step tool invocation: extension repair,
//! then metadata apply. Work is split into contiguous chunks over a pool of
//! workers; each worker owns one keep-alive session for its lifetime and
//! falls back to one-shot subprocesses if that session dies. A sidecar is
//! deleted only when every media file claiming it succeeded.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, warn};

use crate::exifcmd::ToolResolver;
use crate::extension_fix;
use crate::mediaext::WritableSet;
use crate::metadata::{self, RunError, RunFn};
use crate::report::Problems;
use crate::resolver;
use crate::session::Session;

#[derive(Debug, Default, Clone)]
pub struct ProcessSummary {
    pub media_found: u64,
    pub metadata_applied: u64,
    pub filename_date_applied: u64,
    pub renamed_extensions: u64,
    pub xmp_sidecars: u64,
    pub create_date_warnings: u64,
    pub missing_json: u64,
    pub ambiguous_media: u64,
    pub unused_json: u64,
    pub json_removed: u64,
    pub json_kept_due_to_errors: u64,
}

#[derive(Debug, Default)]
pub struct ProcessReport {
    pub summary: ProcessSummary,
    pub problems: Problems,
}

struct MediaOutcome {
    json_rel: String,
    media_path: PathBuf,
    fixed_path: PathBuf,
    renamed: bool,
    fix_error: Option<String>,
    apply: Option<metadata::ApplyOutcome>,
    apply_error: Option<String>,
}

/// Resolve pairs under `root` and push every paired media through the
/// two-step tool invocation.
pub fn run(root: &Path, resolver: &dyn ToolResolver) -> anyhow::Result<ProcessReport> {
    let mut report = ProcessReport::default();

    let pairing = resolver::scan_takeout(root).context("scan takeout")?;
    report.summary.missing_json = pairing.missing.len() as u64;
    report.summary.ambiguous_media = pairing.ambiguous.len() as u64;
    report.summary.unused_json = pairing.unused_json.len() as u64;
    report.summary.media_found = pairing.media_found() as u64;

    let jobs: Vec<(String, String)> = pairing
        .pairs
        .iter()
        .map(|(media, json)| (media.clone(), json.clone()))
        .collect();

    let mut json_pair_count: std::collections::BTreeMap<&str, u64> = Default::default();
    for (_, json) in &jobs {
        *json_pair_count.entry(json.as_str()).or_default() += 1;
    }
    let mut json_success_count: std::collections::BTreeMap<String, u64> = Default::default();

    if !jobs.is_empty() {
        let tool = resolver
            .resolve()
            .context("metadata tool disappeared mid-run")?;
        let writable = query_writable_set(&tool);

        let outcomes = run_pool(root, &tool, &writable, &jobs);

        for outcome in &outcomes {
            if let Some(err) = &outcome.fix_error {
                debug!(media = %outcome.media_path.display(), error = %err, "extension repair failed");
                report
                    .problems
                    .add("extension errors", outcome.media_path.display().to_string());
                continue;
            }
            if outcome.renamed {
                report.summary.renamed_extensions += 1;
            }
            if let Some(err) = &outcome.apply_error {
                debug!(media = %outcome.fixed_path.display(), error = %err, "metadata apply failed");
                report
                    .problems
                    .add("metadata errors", outcome.fixed_path.display().to_string());
                continue;
            }

            let apply = outcome.apply.as_ref().expect("success carries an outcome");
            *json_success_count.entry(outcome.json_rel.clone()).or_default() += 1;
            report.summary.metadata_applied += 1;
            if apply.used_filename_date {
                report.summary.filename_date_applied += 1;
            }
            if apply.used_xmp_sidecar {
                report.summary.xmp_sidecars += 1;
            }
            if apply.create_date_warned {
                report.summary.create_date_warnings += 1;
                report
                    .problems
                    .add("create date warnings", outcome.fixed_path.display().to_string());
            }
            if apply.filename_date_warned {
                report
                    .problems
                    .add("filename date warnings", outcome.fixed_path.display().to_string());
            }
        }
    }

    // A sidecar survives when any of its claimants failed.
    for (json_rel, pair_count) in &json_pair_count {
        if json_success_count.get(*json_rel).copied().unwrap_or(0) != *pair_count {
            report.summary.json_kept_due_to_errors += 1;
            continue;
        }
        let path = root.join(json_rel);
        match fs::remove_file(&path) {
            Ok(()) => report.summary.json_removed += 1,
            Err(err) => {
                warn!(json = %path.display(), error = %err, "could not remove sidecar");
                report
                    .problems
                    .add("json remove errors", path.display().to_string());
            }
        }
    }

    Ok(report)
}

fn run_pool(
    root: &Path,
    tool: &Path,
    writable: &WritableSet,
    jobs: &[(String, String)],
) -> Vec<MediaOutcome> {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(jobs.len())
        .max(1);
    let chunk_size = jobs.len().div_ceil(workers);

    let bar = ProgressBar::new(jobs.len() as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40}] {pos}/{len} applying metadata")
            .unwrap(),
    );

    let chunk_results: Vec<Vec<MediaOutcome>> = std::thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .chunks(chunk_size)
            .map(|chunk| {
                let bar = &bar;
                scope.spawn(move || {
                    let mut session = Session::start(tool).ok();
                    let mut results = Vec::with_capacity(chunk.len());
                    for (media_rel, json_rel) in chunk {
                        results.push(process_one(root, tool, writable, &mut session, media_rel, json_rel));
                        bar.inc(1);
                    }
                    if let Some(session) = session {
                        let _ = session.close();
                    }
                    results
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    bar.finish_and_clear();

    chunk_results.into_iter().flatten().collect()
}

fn process_one(
    root: &Path,
    tool: &Path,
    writable: &WritableSet,
    session: &mut Option<Session>,
    media_rel: &str,
    json_rel: &str,
) -> MediaOutcome {
    let media_path = root.join(media_rel);
    let json_path = root.join(json_rel);

    let mut outcome = MediaOutcome {
        json_rel: json_rel.to_string(),
        media_path: media_path.clone(),
        fixed_path: media_path.clone(),
        renamed: false,
        fix_error: None,
        apply: None,
        apply_error: None,
    };

    match with_session_fallback(session, tool, |run| extension_fix::fix_with_runner(&media_path, run)) {
        Ok(fix) => {
            outcome.fixed_path = fix.path;
            outcome.renamed = fix.renamed;
        }
        Err(err) => {
            outcome.fix_error = Some(err.to_string());
            return outcome;
        }
    }

    let fixed_path = outcome.fixed_path.clone();
    match with_session_fallback(session, tool, |run| {
        metadata::apply_with_runner(&fixed_path, &json_path, writable, run)
    }) {
        Ok(apply) => outcome.apply = Some(apply),
        Err(err) => outcome.apply_error = Some(err.to_string()),
    }

    outcome
}

/// Run an operation through the worker's session; on failure, close the
/// session and repeat the whole operation with one-shot subprocesses. After
/// a session dies the worker stays in one-shot mode.
fn with_session_fallback<T>(
    session: &mut Option<Session>,
    tool: &Path,
    op: impl Fn(&mut RunFn) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    if session.is_some() {
        let result = {
            let live = session.as_ref().expect("checked above");
            let mut runner = |args: &[String]| run_via_session(live, args);
            op(&mut runner)
        };
        match result {
            Ok(value) => return Ok(value),
            Err(_) => {
                if let Some(dead) = session.take() {
                    let _ = dead.close();
                }
            }
        }
    }

    let mut runner = |args: &[String]| run_one_shot(tool, args);
    op(&mut runner)
}

fn run_via_session(session: &Session, args: &[String]) -> Result<String, RunError> {
    session.run(args).map_err(|err| RunError {
        output: err.output().to_string(),
        message: err.to_string(),
    })
}

fn run_one_shot(tool: &Path, args: &[String]) -> Result<String, RunError> {
    let output = Command::new(tool).args(args).output().map_err(|err| RunError {
        output: String::new(),
        message: format!("spawn {}: {err}", tool.display()),
    })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(combined)
    } else {
        let status = output.status.code().unwrap_or(-1);
        Err(RunError {
            message: format!("exiftool exited with status {status}"),
            output: combined,
        })
    }
}

fn query_writable_set(tool: &Path) -> WritableSet {
    match run_one_shot(tool, &["-listwf".to_string()]) {
        Ok(output) => {
            let set = WritableSet::from_listwf_output(&output);
            if set.is_empty() {
                WritableSet::fallback()
            } else {
                set
            }
        }
        Err(err) => {
            warn!(error = %err.message, "could not query writable extensions, using built-in set");
            WritableSet::fallback()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::exifcmd::FixedResolver;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const STUB: &str = r#"#!/bin/sh
case "$1" in
  -listwf) echo "JPG JPEG PNG HEIC MP4"; exit 0 ;;
esac
if [ "$1" != "-stay_open" ]; then
  for a in "$@"; do
    case "$a" in *always-fails*) echo "Error: cannot write" >&2; exit 1 ;; esac
  done
  case "$1" in
    -p) echo ".jpg" ;;
    *) echo "1 image files updated" ;;
  esac
  exit 0
fi
buf=""
while IFS= read -r line; do
  case "$line" in
    -execute)
      case "$buf" in
        *always-fails*) printf 'Error: cannot write\n__TAKEOUTFIX_STATUS__:1\n{ready}\n' ;;
        *) printf '.jpg\n__TAKEOUTFIX_STATUS__:0\n{ready}\n' ;;
      esac
      buf="" ;;
    -stay_open) IFS= read -r _; exit 0 ;;
    *) buf="$buf $line" ;;
  esac
done
"#;

    fn install_stub(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("exiftool");
        fs::write(&path, STUB).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn processes_pairs_and_removes_their_sidecars() {
        let dir = TempDir::new().unwrap();
        let tool = install_stub(&dir);
        let root = dir.path().join("tree");
        write(&root, "Photos/a.jpg", b"a");
        write(&root, "Photos/a.jpg.supplemental-metadata.json", br#"{"photoTakenTime":{"timestamp":"1719835200"}}"#);
        write(&root, "Photos/orphan.jpg", b"o");

        let report = run(&root, &FixedResolver(tool)).unwrap();
        assert_eq!(report.summary.media_found, 2);
        assert_eq!(report.summary.metadata_applied, 1);
        assert_eq!(report.summary.missing_json, 1);
        assert_eq!(report.summary.json_removed, 1);
        assert!(!report.problems.has_hard_problems());
        assert!(!root.join("Photos/a.jpg.supplemental-metadata.json").exists());
    }

    #[test]
    fn failing_media_keeps_its_sidecar() {
        let dir = TempDir::new().unwrap();
        let tool = install_stub(&dir);
        let root = dir.path().join("tree");
        write(&root, "P/good.jpg", b"g");
        write(&root, "P/good.jpg.supplemental-metadata.json", br#"{"photoTakenTime":{"timestamp":"1719835200"}}"#);
        write(&root, "P/always-fails.jpg", b"b");
        write(&root, "P/always-fails.jpg.supplemental-metadata.json", br#"{"photoTakenTime":{"timestamp":"1719835200"}}"#);

        let report = run(&root, &FixedResolver(tool)).unwrap();
        assert_eq!(report.summary.metadata_applied, 1);
        assert_eq!(report.summary.json_removed, 1);
        assert_eq!(report.summary.json_kept_due_to_errors, 1);
        assert!(report.problems.has_hard_problems());
        assert!(root.join("P/always-fails.jpg.supplemental-metadata.json").exists());
        assert!(!root.join("P/good.jpg.supplemental-metadata.json").exists());
    }

    #[test]
    fn shared_sidecar_needs_every_claimant_to_succeed() {
        let dir = TempDir::new().unwrap();
        let tool = install_stub(&dir);
        let root = dir.path().join("tree");
        write(&root, "A/dup.jpg", b"same");
        write(&root, "B/dup.jpg", b"same");
        write(&root, "J/dup.jpg.supplemental-metadata.json", br#"{"photoTakenTime":{"timestamp":"1719835200"}}"#);

        let report = run(&root, &FixedResolver(tool)).unwrap();
        assert_eq!(report.summary.metadata_applied, 2);
        assert_eq!(report.summary.json_removed, 1);
        assert!(!root.join("J/dup.jpg.supplemental-metadata.json").exists());
    }

    #[test]
    fn empty_tree_reports_nothing() {
        let dir = TempDir::new().unwrap();
        let tool = install_stub(&dir);
        let root = dir.path().join("tree");
        fs::create_dir_all(&root).unwrap();

        let report = run(&root, &FixedResolver(tool)).unwrap();
        assert_eq!(report.summary.media_found, 0);
        assert_eq!(report.summary.json_removed, 0);
        assert!(report.problems.is_empty());
    }
}
