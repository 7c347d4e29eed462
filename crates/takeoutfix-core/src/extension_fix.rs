//! Extension repair.
//!
//! Takeout occasionally ships media whose extension disagrees with the
//! container (a HEIC named `.jpg`, an MP4 named `.mov`). The tool is asked
//! for the file's true type and the file renamed to match, with a random
//! 5-character suffix on collision. Pairs the tool treats as aliases are
//! left alone so filenames stay stable.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use rand::Rng;

use crate::mediaext;
use crate::metadata::{safe_path_arg, RunFn};

#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub path: PathBuf,
    pub renamed: bool,
}

const COMPATIBLE_PAIRS: &[(&str, &str)] = &[
    (".jpg", ".jpeg"),
    (".tif", ".tiff"),
    (".m4v", ".mp4"),
    (".mov", ".mp4"),
];

/// Query the tool for the file's real type and rename when it disagrees
/// with the current extension.
pub fn fix_with_runner(media_path: &Path, run: &mut RunFn) -> anyhow::Result<FixOutcome> {
    let media = media_path.to_string_lossy().into_owned();
    let current_ext = mediaext::ext_of(&media).to_string();

    let new_ext = query_file_type_extension(&media, run)
        .with_context(|| format!("could not get the proper extension for {media}"))?;

    if extensions_compatible(&current_ext, &new_ext) {
        return Ok(FixOutcome {
            path: media_path.to_path_buf(),
            renamed: false,
        });
    }

    let base = &media[..media.len() - current_ext.len()];
    let target = unique_rename_target(base, &new_ext)
        .with_context(|| format!("could not generate a new file name for {media} with {new_ext}"))?;
    std::fs::rename(media_path, &target)
        .with_context(|| format!("rename {media} to {}", target.display()))?;

    Ok(FixOutcome {
        path: target,
        renamed: true,
    })
}

fn query_file_type_extension(media: &str, run: &mut RunFn) -> anyhow::Result<String> {
    let args = vec![
        "-p".to_string(),
        ".$FileTypeExtension".to_string(),
        safe_path_arg(media),
    ];
    let output = run(&args).map_err(|err| anyhow!("{err}"))?;
    parse_file_type_extension(&output)
        .ok_or_else(|| anyhow!("empty file type extension for {media}"))
}

/// Last meaningful line of the tool output, skipping warnings and errors,
/// normalized to a leading dot.
fn parse_file_type_extension(output: &str) -> Option<String> {
    for line in output.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let lower = line.to_lowercase();
        if lower.starts_with("warning:") || lower.starts_with("error:") {
            continue;
        }
        return Some(if line.starts_with('.') {
            line.to_string()
        } else {
            format!(".{line}")
        });
    }
    None
}

/// Renaming a `.jpeg` whose true type prints as `jpg` (and the like) would
/// churn filenames for nothing; treat those pairs as equal.
fn extensions_compatible(a: &str, b: &str) -> bool {
    if a.eq_ignore_ascii_case(b) {
        return true;
    }
    COMPATIBLE_PAIRS.iter().any(|(x, y)| {
        (a.eq_ignore_ascii_case(x) && b.eq_ignore_ascii_case(y))
            || (a.eq_ignore_ascii_case(y) && b.eq_ignore_ascii_case(x))
    })
}

fn unique_rename_target(base: &str, new_ext: &str) -> anyhow::Result<PathBuf> {
    let plain = PathBuf::from(format!("{base}{new_ext}"));
    if !plain.exists() {
        return Ok(plain);
    }

    const MAX_ATTEMPTS: usize = 10;
    for _ in 0..MAX_ATTEMPTS {
        let candidate = PathBuf::from(format!("{base}-{}{new_ext}", random_suffix()));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    bail!("could not generate a unique file name after {MAX_ATTEMPTS} attempts")
}

fn random_suffix() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..5)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}
