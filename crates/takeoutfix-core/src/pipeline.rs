//! The run pipeline.
//!
//! Stages run in a fixed order: tool preflight, archive discovery,
//! integrity validation, resume-state consultation, disk-space planning,
//! extraction, resolution and per-media processing, sidecar cleanup, and
//! finally deferred ZIP deletion. Preflight failures exit 2, runtime
//! failures exit 3, and hard per-media problems downgrade the run to a
//! partial success (also exit 3) while preserving every ZIP and failing
//! sidecar.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;
use tracing::{error, info, warn};

use crate::disk;
use crate::exifcmd::{install_hints, ToolResolver};
use crate::extract;
use crate::processor;
use crate::report::{write_report_json, RunReport, RunStatus};
use crate::resolver;
use crate::state::{state_path, ArchiveState, RunState};
use crate::zipcheck;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PREFLIGHT_FAIL: i32 = 2;
pub const EXIT_RUNTIME_FAIL: i32 = 3;

/// Extracted media tree inside the workdir.
pub const EXTRACT_DIR: &str = "takeoutfix-extracted";

/// Run the whole pipeline. The returned report carries the process exit
/// code; report-writing failures are logged but never change it.
pub fn run(workdir: &Path, resolver: &dyn ToolResolver) -> RunReport {
    let started = Instant::now();
    let mut report = RunReport::new(workdir);

    let code = run_stages(workdir, resolver, &mut report);
    report.exit_code = code;
    report.finished_at = Local::now();
    report.total_duration = started.elapsed();
    if report.status == RunStatus::Failed && code == EXIT_SUCCESS {
        report.status = RunStatus::Success;
    }

    print_summary(&report);
    match write_report_json(&report) {
        Ok(path) => info!(report = %path.display(), "run report written"),
        Err(err) => error!(error = %err, "could not write run report"),
    }
    report
}

fn run_stages(workdir: &Path, resolver: &dyn ToolResolver, report: &mut RunReport) -> i32 {
    info!(workdir = %workdir.display(), "starting takeoutfix");

    // Stage 1: the metadata tool must be resolvable before anything else.
    if let Err(err) = resolver.resolve() {
        error!("{err}");
        for hint in install_hints() {
            info!("install hint: {hint}");
        }
        report.problems.add("missing dependencies", err.to_string());
        return EXIT_PREFLIGHT_FAIL;
    }

    let dest = workdir.join(EXTRACT_DIR);

    // Stage 2: discover archives; without any, look for an existing tree.
    let t = Instant::now();
    let zips = match zipcheck::discover_top_level_zips(workdir) {
        Ok(zips) => zips,
        Err(err) => {
            report.problems.add("zip scan errors", err.to_string());
            report.zip_scan_duration = t.elapsed();
            return EXIT_RUNTIME_FAIL;
        }
    };
    report.zip_scan_duration = t.elapsed();
    report.archives_found = zips.len();

    let media_root = if zips.is_empty() {
        match usable_media_root(workdir, &dest) {
            Some(root) => {
                info!(root = %root.display(), "no archives found, re-processing existing data");
                root
            }
            None => {
                error!("no ZIP archives found and no extracted data");
                return EXIT_PREFLIGHT_FAIL;
            }
        }
    } else {
        // Stage 3: every archive must stream cleanly end to end.
        info!(archives = zips.len(), "validating archive integrity");
        let t = Instant::now();
        let integrity = zipcheck::validate_all(&zips);
        report.zip_validate_duration = t.elapsed();
        report.corrupt_names = integrity.corrupt_names();
        report.archives_corrupt = report.corrupt_names.len();
        report.archives_valid = integrity.checked.len() - report.archives_corrupt;
        if report.archives_corrupt > 0 {
            error!(names = ?report.corrupt_names, "corrupt archives found, stopping");
            let names = report.corrupt_names.clone();
            report
                .problems
                .add_n("corrupt zips", names.len() as u64, &names);
            return EXIT_PREFLIGHT_FAIL;
        }

        // Stage 4: resume state decides what is still pending.
        let state_file = state_path(workdir);
        let mut state = match RunState::load(&state_file) {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "state file unreadable, starting from scratch");
                report.problems.add("state load errors", err.to_string());
                RunState::new()
            }
        };

        let pending: Vec<_> = integrity
            .checked
            .iter()
            .filter(|check| {
                !state.should_skip_extraction(&check.archive.name, &check.archive.fingerprint)
            })
            .cloned()
            .collect();

        // Stage 5: plan disk space for the pending set only.
        let mut low_space = false;
        if !pending.is_empty() {
            let t = Instant::now();
            let space = match disk::check_disk_space(workdir, &pending) {
                Ok(space) => space,
                Err(err) => {
                    report.problems.add("disk check errors", err.to_string());
                    report.disk_check_duration = t.elapsed();
                    return EXIT_RUNTIME_FAIL;
                }
            };
            report.disk_check_duration = t.elapsed();
            report.disk = space;
            info!(
                available = %disk::format_bytes(space.available_bytes),
                required = %disk::format_bytes(space.required_bytes),
                required_with_delete = %disk::format_bytes(space.required_with_delete_bytes),
                "disk space planned"
            );

            if !space.enough_with_delete {
                error!("not enough disk space even with delete-after-extract");
                report.problems.add(
                    "insufficient disk space",
                    format!(
                        "available {}, required {}",
                        disk::format_bytes(space.available_bytes),
                        disk::format_bytes(space.required_with_delete_bytes)
                    ),
                );
                return EXIT_PREFLIGHT_FAIL;
            }
            if !space.enough {
                warn!("not enough space for normal mode, deleting each ZIP after extraction");
                low_space = true;
            }
        }
        report.auto_delete = low_space;

        // Stage 6: extract pending archives in order, persisting state after
        // each one.
        let mut deferred_zips: Vec<(String, PathBuf)> = Vec::new();
        let t = Instant::now();
        for check in &integrity.checked {
            let archive = &check.archive;
            if state.should_skip_extraction(&archive.name, &archive.fingerprint) {
                report.skipped_archives += 1;
                info!(archive = %archive.name, "already extracted, skipping");
                continue;
            }

            match extract::extract_archive(&archive.path, &dest) {
                Ok(files) => {
                    report.extracted_archives += 1;
                    report.extracted_files += files;
                    info!(archive = %archive.name, files, "extracted");
                }
                Err(err) => {
                    error!(archive = %archive.name, error = %err, "extraction failed");
                    report.problems.add("extract errors", archive.name.clone());
                    report.extract_duration = t.elapsed();
                    return EXIT_RUNTIME_FAIL;
                }
            }

            let mut entry = ArchiveState {
                fingerprint: archive.fingerprint.clone(),
                extracted: true,
                deleted: false,
            };
            if low_space {
                match fs::remove_file(&archive.path) {
                    Ok(()) => {
                        report.deleted_zips += 1;
                        entry.deleted = true;
                    }
                    Err(err) => {
                        warn!(archive = %archive.name, error = %err, "could not delete ZIP");
                        report.delete_errors.push(archive.name.clone());
                        report.problems.add("zip delete errors", archive.name.clone());
                    }
                }
            } else {
                deferred_zips.push((archive.name.clone(), archive.path.clone()));
            }

            state.record(&archive.name, entry);
            if let Err(err) = state.save(&state_file) {
                warn!(error = %err, "could not persist resume state");
                report.problems.add("state save errors", err.to_string());
            }
        }
        report.extract_duration = t.elapsed();

        // Stages 7-9 run on the extracted tree.
        let code = process_and_cleanup(&dest, resolver, report);
        if code != EXIT_SUCCESS {
            return code;
        }

        // Stage 10: deferred ZIP deletion, only on a clean run.
        if report.problems.has_hard_problems() {
            warn!("processing problems occurred, keeping all ZIP archives");
        } else {
            for (name, path) in deferred_zips {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        report.deleted_zips += 1;
                        if let Some(entry) = state.archives.get(&name).cloned() {
                            state.record(&name, ArchiveState { deleted: true, ..entry });
                        }
                    }
                    Err(err) => {
                        warn!(archive = %name, error = %err, "could not delete ZIP");
                        report.delete_errors.push(name.clone());
                        report.problems.add("zip delete errors", name);
                    }
                }
            }
            if let Err(err) = state.save(&state_file) {
                report.problems.add("state save errors", err.to_string());
            }
        }

        return finish_status(report);
    };

    // Archive-less path: process the tree that is already on disk.
    let code = process_and_cleanup(&media_root, resolver, report);
    if code != EXIT_SUCCESS {
        return code;
    }
    finish_status(report)
}

/// Stages 7-9: resolve, process media, clean up sidecars.
fn process_and_cleanup(
    media_root: &Path,
    resolver: &dyn ToolResolver,
    report: &mut RunReport,
) -> i32 {
    info!(root = %media_root.display(), "applying metadata and cleaning matched sidecars");
    let t = Instant::now();
    let processed = match processor::run(media_root, resolver) {
        Ok(processed) => processed,
        Err(err) => {
            error!(error = %err, "processing failed");
            report.problems.add("processing errors", err.to_string());
            report.process_duration = t.elapsed();
            return EXIT_RUNTIME_FAIL;
        }
    };
    report.process_duration = t.elapsed();

    let summary = &processed.summary;
    report.media_found = summary.media_found;
    report.metadata_applied = summary.metadata_applied;
    report.filename_date_applied = summary.filename_date_applied;
    report.renamed_extensions = summary.renamed_extensions;
    report.xmp_sidecars = summary.xmp_sidecars;
    report.missing_json = summary.missing_json;
    report.ambiguous_media = summary.ambiguous_media;
    report.json_removed = summary.json_removed;
    report.json_kept_due_to_errors = summary.json_kept_due_to_errors;
    report.json_kept_unused = summary.unused_json;
    report.problems.merge(&processed.problems);

    EXIT_SUCCESS
}

fn finish_status(report: &mut RunReport) -> i32 {
    if report.problems.has_hard_problems() {
        report.status = RunStatus::PartialSuccess;
        EXIT_RUNTIME_FAIL
    } else {
        report.status = RunStatus::Success;
        EXIT_SUCCESS
    }
}

/// An existing extracted tree, or a Takeout-shaped folder, usable as the
/// media root when no archives are present.
fn usable_media_root(workdir: &Path, dest: &Path) -> Option<PathBuf> {
    if dest.is_dir() {
        return Some(dest.to_path_buf());
    }
    detect_takeout_root(workdir)
}

/// A folder is a processable Takeout root when it is itself named `Takeout`
/// (case-insensitive) and holds at least one media evidence item, or has a
/// `Takeout` child that does.
pub fn detect_takeout_root(dir: &Path) -> Option<PathBuf> {
    let is_named_takeout = dir
        .file_name()
        .map(|name| name.to_string_lossy().eq_ignore_ascii_case("takeout"))
        .unwrap_or(false);
    if is_named_takeout && has_media_evidence(dir) {
        return Some(dir.to_path_buf());
    }

    let child = dir.join("Takeout");
    if child.is_dir() && has_media_evidence(&child) {
        return Some(child);
    }
    None
}

fn has_media_evidence(dir: &Path) -> bool {
    resolver::scan_takeout(dir)
        .map(|pairing| pairing.media_found() > 0)
        .unwrap_or(false)
}

fn print_summary(report: &RunReport) {
    info!(
        status = ?report.status,
        archives_found = report.archives_found,
        archives_corrupt = report.archives_corrupt,
        extracted = report.extracted_archives,
        skipped = report.skipped_archives,
        media = report.media_found,
        applied = report.metadata_applied,
        missing_json = report.missing_json,
        ambiguous = report.ambiguous_media,
        json_removed = report.json_removed,
        "run finished"
    );
    for (category, count, samples) in report.problems.iter() {
        warn!(category, count, samples = ?samples, "problem");
    }
}
