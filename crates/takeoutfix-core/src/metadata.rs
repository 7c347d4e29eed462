//! Translation of a Takeout sidecar into metadata writes.
//!
//! The sidecar's tags, description, capture time and GPS are mapped onto an
//! exiftool argument vector via `-TagsFromFile`. Files the tool cannot
//! write in place get an `.xmp` sidecar target instead. When the sidecar
//! carries no usable `photoTakenTime`, a capture time is recovered from a
//! `YYYY-MM-DD HH.MM.SS` filename prefix, interpreted as UTC by convention.
//! Corrupt embedded EXIF (the tool's `bad format` / `error reading`
//! signatures) is stripped once and the write retried.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail};
use chrono::NaiveDateTime;
use regex::Regex;
use std::sync::LazyLock;

use crate::mediaext::{self, WritableSet};

/// One external-tool invocation: captured output plus failure message. The
/// output survives errors so retry heuristics can inspect it.
#[derive(Debug)]
pub struct RunError {
    pub output: String,
    pub message: String,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub type RunFn<'a> = dyn FnMut(&[String]) -> Result<String, RunError> + 'a;

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOutcome {
    pub used_filename_date: bool,
    pub used_xmp_sidecar: bool,
    pub create_date_warned: bool,
    pub filename_date_warned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimestampStatus {
    Valid,
    Missing,
    Invalid,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
struct GpsInclusion {
    geo_data: bool,
    geo_data_exif: bool,
}

/// Apply a sidecar's metadata to `media_path` through the given runner.
pub fn apply_with_runner(
    media_path: &Path,
    json_path: &Path,
    writable: &WritableSet,
    run: &mut RunFn,
) -> anyhow::Result<ApplyOutcome> {
    let media = media_path.to_string_lossy().into_owned();
    let media_ext = mediaext::ext_of(&media);

    let mut outcome = ApplyOutcome::default();
    let out_path = if writable.contains(media_ext) {
        media.clone()
    } else {
        outcome.used_xmp_sidecar = true;
        format!("{media}.xmp")
    };

    let ts_status = detect_timestamp_status(json_path);
    let gps = detect_gps_inclusion(json_path);
    let include_dates = ts_status == TimestampStatus::Valid;

    let build = |include_create_date: bool| {
        build_apply_args(json_path, &out_path, include_dates, include_create_date, gps)
    };

    match run_with_create_date_retry(&build, run) {
        Ok(warned) => outcome.create_date_warned |= warned,
        Err(err) if looks_like_corrupt_exif(&err.output) || looks_like_corrupt_exif(&err.message) => {
            strip_corrupt_exif(&out_path, run)
                .map_err(|_| anyhow!("could not fix metadata for {media}: {err}"))?;
            let warned = run_with_create_date_retry(&build, run).map_err(|retry_err| {
                anyhow!("could not fix metadata for {media} after stripping corrupt EXIF: {retry_err}")
            })?;
            outcome.create_date_warned |= warned;
        }
        Err(err) => bail!("could not fix metadata for {media}: {err}"),
    }

    if matches!(ts_status, TimestampStatus::Missing | TimestampStatus::Invalid) {
        let basename = media_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match parse_filename_date(&basename) {
            Some(date) => {
                let warned = apply_filename_date(&date, &out_path, run)
                    .map_err(|err| anyhow!("could not fix metadata for {media}: {err}"))?;
                outcome.used_filename_date = true;
                outcome.create_date_warned |= warned;
            }
            None => outcome.filename_date_warned = true,
        }
    }

    Ok(outcome)
}

/// Run the builder's arguments, retrying once without `FileCreateDate` when
/// the tool rejects it. Returns whether the retry was needed.
fn run_with_create_date_retry(
    build: &dyn Fn(bool) -> Vec<String>,
    run: &mut RunFn,
) -> Result<bool, RunError> {
    let include_create_date = should_write_file_create_date();
    match run(&build(include_create_date)) {
        Ok(_) => Ok(false),
        Err(err) if include_create_date && mentions_create_date_unsupported(&err) => {
            run(&build(false))?;
            Ok(true)
        }
        Err(err) => Err(err),
    }
}

fn strip_corrupt_exif(out_path: &str, run: &mut RunFn) -> Result<String, RunError> {
    run(&[
        "-all=".to_string(),
        "-overwrite_original".to_string(),
        safe_path_arg(out_path),
    ])
}

fn apply_filename_date(date: &NaiveDateTime, out_path: &str, run: &mut RunFn) -> Result<bool, RunError> {
    let stamp = date.format("%Y:%m:%d %H:%M:%S").to_string();
    let build = |include_create_date: bool| {
        let mut args = vec![
            "-m".to_string(),
            format!("-DateTimeOriginal={stamp}"),
            format!("-CreateDate={stamp}"),
            format!("-ModifyDate={stamp}"),
            format!("-FileModifyDate={stamp}"),
        ];
        if include_create_date {
            args.push(format!("-FileCreateDate={stamp}"));
        }
        args.push("-overwrite_original".to_string());
        args.push(safe_path_arg(out_path));
        args
    };
    run_with_create_date_retry(&build, run)
}

static FILENAME_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4})-(\d{2})-(\d{2}) (\d{2})\.(\d{2})\.(\d{2})").unwrap()
});

/// Parse a `YYYY-MM-DD HH.MM.SS` prefix from a media basename. Filenames
/// encode no zone; the value is UTC by convention.
pub fn parse_filename_date(basename: &str) -> Option<NaiveDateTime> {
    let caps = FILENAME_DATE_RE.captures(basename)?;
    let normalized = format!(
        "{}-{}-{} {}:{}:{}",
        &caps[1], &caps[2], &caps[3], &caps[4], &caps[5], &caps[6]
    );
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S").ok()
}

fn detect_timestamp_status(json_path: &Path) -> TimestampStatus {
    let Ok(data) = fs::read(json_path) else {
        return TimestampStatus::Unknown;
    };
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&data) else {
        return TimestampStatus::Unknown;
    };
    let Some(taken) = value.get("photoTakenTime") else {
        return TimestampStatus::Missing;
    };
    let Some(taken) = taken.as_object() else {
        return TimestampStatus::Unknown;
    };
    match taken.get("timestamp") {
        None => TimestampStatus::Missing,
        Some(serde_json::Value::String(s)) => match s.parse::<i64>() {
            Ok(v) if v > 0 => TimestampStatus::Valid,
            Ok(_) => TimestampStatus::Invalid,
            Err(_) => TimestampStatus::Invalid,
        },
        Some(serde_json::Value::Number(n)) => match n.as_i64() {
            Some(v) if v > 0 => TimestampStatus::Valid,
            _ => TimestampStatus::Invalid,
        },
        Some(_) => TimestampStatus::Unknown,
    }
}

fn detect_gps_inclusion(json_path: &Path) -> GpsInclusion {
    let geo = |value: &serde_json::Value, key: &str| -> bool {
        let Some(group) = value.get(key) else {
            return false;
        };
        let lat = group.get("latitude").and_then(|v| v.as_f64());
        let lon = group.get("longitude").and_then(|v| v.as_f64());
        matches!((lat, lon), (Some(lat), Some(lon)) if lat != 0.0 && lon != 0.0)
    };

    let Ok(data) = fs::read(json_path) else {
        return GpsInclusion { geo_data: false, geo_data_exif: false };
    };
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&data) else {
        return GpsInclusion { geo_data: false, geo_data_exif: false };
    };

    if geo(&value, "geoData") {
        GpsInclusion { geo_data: true, geo_data_exif: false }
    } else if geo(&value, "geoDataExif") {
        GpsInclusion { geo_data: false, geo_data_exif: true }
    } else {
        GpsInclusion { geo_data: false, geo_data_exif: false }
    }
}

fn build_apply_args(
    json_path: &Path,
    out_path: &str,
    include_dates: bool,
    include_create_date: bool,
    gps: GpsInclusion,
) -> Vec<String> {
    let mut args = vec![
        "-d".to_string(),
        "%s".to_string(),
        "-m".to_string(),
        "-TagsFromFile".to_string(),
        safe_path_arg(&json_path.to_string_lossy()),
        "-Title<Title".to_string(),
        "-Description<Description".to_string(),
        "-ImageDescription<Description".to_string(),
        "-Caption-Abstract<Description".to_string(),
        "-Keywords<Tags".to_string(),
        "-Subject<Tags".to_string(),
    ];

    if include_dates {
        args.push("-AllDates<PhotoTakenTimeTimestamp".to_string());
        args.push("-FileModifyDate<PhotoTakenTimeTimestamp".to_string());
        if include_create_date {
            args.push("-FileCreateDate<PhotoTakenTimeTimestamp".to_string());
        }
        if has_quicktime_dates(out_path) {
            for tag in [
                "-QuickTime:CreateDate<PhotoTakenTimeTimestamp",
                "-QuickTime:ModifyDate<PhotoTakenTimeTimestamp",
                "-QuickTime:TrackCreateDate<PhotoTakenTimeTimestamp",
                "-QuickTime:TrackModifyDate<PhotoTakenTimeTimestamp",
                "-QuickTime:MediaCreateDate<PhotoTakenTimeTimestamp",
                "-QuickTime:MediaModifyDate<PhotoTakenTimeTimestamp",
                "-Keys:CreationDate<PhotoTakenTimeTimestamp",
            ] {
                args.push(tag.to_string());
            }
        }
    }

    if gps.geo_data {
        for tag in [
            "-GPSAltitude<GeoDataAltitude",
            "-GPSLatitude<GeoDataLatitude",
            "-GPSLatitudeRef<GeoDataLatitude",
            "-GPSLongitude<GeoDataLongitude",
            "-GPSLongitudeRef<GeoDataLongitude",
        ] {
            args.push(tag.to_string());
        }
    }
    if gps.geo_data_exif {
        for tag in [
            "-GPSAltitude<GeoDataExifAltitude",
            "-GPSLatitude<GeoDataExifLatitude",
            "-GPSLatitudeRef<GeoDataExifLatitude",
            "-GPSLongitude<GeoDataExifLongitude",
            "-GPSLongitudeRef<GeoDataExifLongitude",
        ] {
            args.push(tag.to_string());
        }
    }

    args.push("-overwrite_original".to_string());
    args.push(safe_path_arg(out_path));
    args
}

/// QuickTime/Keys date tags only exist in container formats.
fn has_quicktime_dates(path: &str) -> bool {
    let ext = mediaext::ext_of(path);
    [".heic", ".heif", ".mov", ".mp4", ".m4v", ".3gp"]
        .iter()
        .any(|e| e.eq_ignore_ascii_case(ext))
}

fn should_write_file_create_date() -> bool {
    cfg!(target_os = "macos")
}

fn mentions_create_date_unsupported(err: &RunError) -> bool {
    let needle = "filecreatedate is not supported";
    err.output.to_lowercase().contains(needle) || err.message.to_lowercase().contains(needle)
}

/// Signatures of corrupt embedded EXIF in the tool's output.
pub fn looks_like_corrupt_exif(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("bad format") || lower.contains("error reading")
}

/// Prevent option-style interpretation of paths starting with '-'. Protocol
/// delimiters (newlines) are rejected separately by the session.
pub fn safe_path_arg(path: &str) -> String {
    if path.starts_with('-') {
        format!("./{path}")
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ok_runner(calls: &mut Vec<Vec<String>>) -> impl FnMut(&[String]) -> Result<String, RunError> + '_ {
        move |args| {
            calls.push(args.to_vec());
            Ok("1 image files updated\n".to_string())
        }
    }

    fn write_json(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("meta.json");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn args_map_tags_descriptions_and_target() {
        let gps = GpsInclusion { geo_data: true, geo_data_exif: true };
        let args = build_apply_args(Path::new("meta.json"), "photo.jpg", true, false, gps);

        for expected in [
            "-Title<Title",
            "-Description<Description",
            "-ImageDescription<Description",
            "-Caption-Abstract<Description",
            "-Keywords<Tags",
            "-Subject<Tags",
            "-AllDates<PhotoTakenTimeTimestamp",
            "-FileModifyDate<PhotoTakenTimeTimestamp",
            "-GPSLatitude<GeoDataLatitude",
            "-GPSLatitude<GeoDataExifLatitude",
            "-overwrite_original",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {expected}");
        }
        assert!(!args.iter().any(|a| a == "--"));
        assert_eq!(args.last().unwrap(), "photo.jpg");
        // exif-group GPS mapping comes after the plain one
        let plain = args.iter().position(|a| a == "-GPSLatitude<GeoDataLatitude").unwrap();
        let exif = args.iter().position(|a| a == "-GPSLatitude<GeoDataExifLatitude").unwrap();
        assert!(exif > plain);
    }

    #[test]
    fn heic_gets_quicktime_and_keys_dates_but_jpeg_does_not() {
        let gps = GpsInclusion { geo_data: false, geo_data_exif: false };
        let heic = build_apply_args(Path::new("m.json"), "photo.HEIC", true, false, gps);
        assert!(heic.iter().any(|a| a == "-QuickTime:CreateDate<PhotoTakenTimeTimestamp"));
        assert!(heic.iter().any(|a| a == "-Keys:CreationDate<PhotoTakenTimeTimestamp"));

        let jpeg = build_apply_args(Path::new("m.json"), "photo.jpg", true, false, gps);
        assert!(!jpeg.iter().any(|a| a.starts_with("-QuickTime:")));
        assert!(!jpeg.iter().any(|a| a.starts_with("-Keys:")));
    }

    #[test]
    fn no_date_mappings_when_timestamp_unusable() {
        let gps = GpsInclusion { geo_data: false, geo_data_exif: false };
        let args = build_apply_args(Path::new("m.json"), "photo.jpg", false, true, gps);
        assert!(!args.iter().any(|a| a.contains("PhotoTakenTimeTimestamp")));
    }

    #[test]
    fn timestamp_status_detection() {
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            (r#"{"photoTakenTime":{"timestamp":"1719835200"}}"#, TimestampStatus::Valid),
            (r#"{"photoTakenTime":{"timestamp":1}}"#, TimestampStatus::Valid),
            (r#"{"title":"x"}"#, TimestampStatus::Missing),
            (r#"{"photoTakenTime":{}}"#, TimestampStatus::Missing),
            (r#"{"photoTakenTime":{"timestamp":"not-a-number"}}"#, TimestampStatus::Invalid),
            (r#"{"photoTakenTime":{"timestamp":"0"}}"#, TimestampStatus::Invalid),
            (r#"{"photoTakenTime":{"timestamp":"-1"}}"#, TimestampStatus::Invalid),
            (r#"{"photoTakenTime":{"timestamp":0}}"#, TimestampStatus::Invalid),
            (r#"{"photoTakenTime":"#, TimestampStatus::Unknown),
            (r#"{"photoTakenTime":"bad-shape"}"#, TimestampStatus::Unknown),
        ];
        for (content, want) in cases {
            let path = write_json(&dir, content);
            assert_eq!(detect_timestamp_status(&path), want, "content {content}");
        }
    }

    #[test]
    fn gps_prefers_geo_data_over_exif_group() {
        let dir = tempfile::tempdir().unwrap();

        let path = write_json(
            &dir,
            r#"{"geoData":{"latitude":51.5,"longitude":-0.1},"geoDataExif":{"latitude":1.0,"longitude":2.0}}"#,
        );
        let gps = detect_gps_inclusion(&path);
        assert!(gps.geo_data && !gps.geo_data_exif);

        let path = write_json(
            &dir,
            r#"{"geoData":{"latitude":0.0,"longitude":0.0},"geoDataExif":{"latitude":1.0,"longitude":2.0}}"#,
        );
        let gps = detect_gps_inclusion(&path);
        assert!(!gps.geo_data && gps.geo_data_exif);

        let path = write_json(&dir, r#"{"geoData":{"latitude":0.0,"longitude":0.0}}"#);
        let gps = detect_gps_inclusion(&path);
        assert!(!gps.geo_data && !gps.geo_data_exif);
    }

    #[test]
    fn filename_date_is_utc_prefix_parse() {
        let parsed = parse_filename_date("2013-06-11 16.19.16.jpg").unwrap();
        assert_eq!(parsed.format("%Y:%m:%d %H:%M:%S").to_string(), "2013:06:11 16:19:16");
        assert!(parse_filename_date("IMG_2013-06-11 16.19.16.jpg").is_none());
        assert!(parse_filename_date("random.jpg").is_none());
    }

    #[test]
    fn valid_timestamp_does_not_use_filename_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let json = write_json(&dir, r#"{"photoTakenTime":{"timestamp":"1719835200"}}"#);

        let mut calls = Vec::new();
        let mut run = ok_runner(&mut calls);
        let outcome = apply_with_runner(
            Path::new("2013-06-11 16.19.16.jpg"),
            &json,
            &WritableSet::fallback(),
            &mut run,
        )
        .unwrap();
        drop(run);

        assert!(!outcome.used_filename_date);
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].iter().any(|a| a.starts_with("-DateTimeOriginal=")));
    }

    #[test]
    fn missing_timestamp_uses_filename_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let json = write_json(&dir, r#"{"title":"x"}"#);

        let mut calls = Vec::new();
        let mut run = ok_runner(&mut calls);
        let outcome = apply_with_runner(
            Path::new("2013-06-11 16.19.16.jpg"),
            &json,
            &WritableSet::fallback(),
            &mut run,
        )
        .unwrap();
        drop(run);

        assert!(outcome.used_filename_date);
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].iter().any(|a| a == "-AllDates<PhotoTakenTimeTimestamp"));
        assert!(calls[1].iter().any(|a| a == "-DateTimeOriginal=2013:06:11 16:19:16"));
        assert!(calls[1].iter().any(|a| a == "-m"));
    }

    #[test]
    fn unparsable_filename_is_a_warning_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let json = write_json(&dir, r#"{"title":"x"}"#);

        let mut calls = Vec::new();
        let mut run = ok_runner(&mut calls);
        let outcome = apply_with_runner(
            Path::new("IMG_0001.jpg"),
            &json,
            &WritableSet::fallback(),
            &mut run,
        )
        .unwrap();
        drop(run);

        assert!(!outcome.used_filename_date);
        assert!(outcome.filename_date_warned);
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn unwritable_extension_targets_xmp_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let json = write_json(&dir, r#"{"photoTakenTime":{"timestamp":"1719835200"}}"#);

        let mut calls = Vec::new();
        let mut run = ok_runner(&mut calls);
        let outcome = apply_with_runner(
            Path::new("photo.webp"),
            &json,
            &WritableSet::fallback(),
            &mut run,
        )
        .unwrap();
        drop(run);

        assert!(outcome.used_xmp_sidecar);
        assert_eq!(calls[0].last().unwrap(), "photo.webp.xmp");
    }

    #[test]
    fn corrupt_exif_triggers_strip_then_retry() {
        let dir = tempfile::tempdir().unwrap();
        let json = write_json(&dir, r#"{"photoTakenTime":{"timestamp":"1719835200"}}"#);

        let mut calls: Vec<Vec<String>> = Vec::new();
        let mut attempt = 0;
        let mut run = |args: &[String]| {
            calls.push(args.to_vec());
            attempt += 1;
            match attempt {
                1 => Err(RunError {
                    output: "Error: Bad format (0) for ExifIFD entry 25 - photo.jpg\n".to_string(),
                    message: "exiftool failed".to_string(),
                }),
                _ => Ok("1 image files updated\n".to_string()),
            }
        };

        let outcome = apply_with_runner(
            Path::new("photo.jpg"),
            &json,
            &WritableSet::fallback(),
            &mut run,
        )
        .unwrap();

        assert!(!outcome.create_date_warned);
        assert_eq!(calls.len(), 3);
        assert!(calls[1].iter().any(|a| a == "-all="));
    }

    #[test]
    fn failed_strip_keeps_original_error_context() {
        let dir = tempfile::tempdir().unwrap();
        let json = write_json(&dir, r#"{"photoTakenTime":{"timestamp":"1719835200"}}"#);

        let mut attempt = 0;
        let mut run = |_: &[String]| {
            attempt += 1;
            Err(RunError {
                output: "Error: Bad format (0) for ExifIFD entry 25\n".to_string(),
                message: "exiftool failed".to_string(),
            })
        };

        let err = apply_with_runner(
            Path::new("photo.jpg"),
            &json,
            &WritableSet::fallback(),
            &mut run,
        )
        .unwrap_err();

        assert_eq!(attempt, 2);
        assert!(err.to_string().contains("could not fix metadata for photo.jpg"));
        assert!(!err.to_string().contains("after stripping corrupt EXIF"));
    }

    #[test]
    fn failed_retry_after_strip_mentions_stripping() {
        let dir = tempfile::tempdir().unwrap();
        let json = write_json(&dir, r#"{"photoTakenTime":{"timestamp":"1719835200"}}"#);

        let mut attempt = 0;
        let mut run = |_: &[String]| {
            attempt += 1;
            match attempt {
                1 => Err(RunError {
                    output: "Error: Error reading OtherImageStart data in IFD0\n".to_string(),
                    message: "exiftool failed".to_string(),
                }),
                2 => Ok("1 image files updated\n".to_string()),
                _ => Err(RunError {
                    output: "some other error\n".to_string(),
                    message: "retry failed".to_string(),
                }),
            }
        };

        let err = apply_with_runner(
            Path::new("photo.jpg"),
            &json,
            &WritableSet::fallback(),
            &mut run,
        )
        .unwrap_err();

        assert_eq!(attempt, 3);
        assert!(err.to_string().contains("after stripping corrupt EXIF"));
    }

    #[test]
    fn corrupt_exif_signatures() {
        assert!(looks_like_corrupt_exif("Warning: bad format for entry"));
        assert!(looks_like_corrupt_exif("Error: Bad format (0) for ExifIFD entry 25 - photo.jpg"));
        assert!(looks_like_corrupt_exif("error reading OtherImageStart data in IFD0"));
        assert!(!looks_like_corrupt_exif("1 image files updated"));
        assert!(!looks_like_corrupt_exif(""));
        assert!(!looks_like_corrupt_exif("Error: File not found - photo.jpg"));
    }

    #[test]
    fn paths_starting_with_dash_are_shielded() {
        assert_eq!(safe_path_arg("-weird.jpg"), "./-weird.jpg");
        assert_eq!(safe_path_arg("plain.jpg"), "plain.jpg");
    }
}
