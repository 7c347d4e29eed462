//! Safe archive extraction.
//!
//! Entry paths are confined to the destination: lexical escapes
//! (`../evil`) and absolute names are refused, and no component of a
//! target path may be a symlink that already exists on disk. Entry names
//! are decoded UTF-8 first with a Shift_JIS fallback for archives produced
//! by Japanese-locale tooling.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use encoding_rs::SHIFT_JIS;
use indicatif::{ProgressBar, ProgressStyle};

/// Extract one archive into `dest`, creating it if needed. Returns the
/// number of files written.
pub fn extract_archive(zip_path: &Path, dest: &Path) -> anyhow::Result<u64> {
    fs::create_dir_all(dest).context("create destination")?;

    let file = File::open(zip_path).with_context(|| format!("open {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("open zip")?;

    let bar = ProgressBar::new(archive.len() as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40}] {pos}/{len} extracting {msg}")
            .unwrap(),
    );
    bar.set_message(
        zip_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );

    let mut files: u64 = 0;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = decode_entry_name(entry.name_raw());
        let target = safe_join(dest, &name)?;
        ensure_no_symlink_components(dest, &target)?;

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            bar.inc(1);
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)
            .with_context(|| format!("create {}", target.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("write {}", target.display()))?;
        files += 1;
        bar.inc(1);
    }
    bar.finish_and_clear();

    Ok(files)
}

/// Decode a raw entry name, trying UTF-8 first, then Shift_JIS.
fn decode_entry_name(raw: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(raw) {
        return s.to_string();
    }
    let (decoded, _, had_errors) = SHIFT_JIS.decode(raw);
    if !had_errors {
        return decoded.into_owned();
    }
    String::from_utf8_lossy(raw).into_owned()
}

/// Join an entry name under `base`, refusing absolute names and any name
/// whose normalized form escapes the destination.
fn safe_join(base: &Path, name: &str) -> anyhow::Result<PathBuf> {
    let mut target = base.to_path_buf();
    let mut depth: usize = 0;
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => {
                target.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    bail!("invalid zip entry path: {name}");
                }
                target.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("invalid zip entry path: {name}");
            }
        }
    }
    if depth == 0 {
        bail!("invalid zip entry path: {name}");
    }
    Ok(target)
}

/// Refuse to write through any already-existing symlinked component between
/// `base` and `target`. Components that do not exist yet are fine; they are
/// about to be created as plain directories.
fn ensure_no_symlink_components(base: &Path, target: &Path) -> anyhow::Result<()> {
    ensure_existing_path_not_symlink(base)?;

    let rel = target
        .strip_prefix(base)
        .context("target escapes destination")?;
    let mut current = base.to_path_buf();
    for part in rel.components() {
        current.push(part);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                bail!("invalid zip entry path (symlink component): {}", current.display());
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn ensure_existing_path_not_symlink(path: &Path) -> anyhow::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        bail!("invalid zip entry path (symlink component): {}", path.display());
    }
    Ok(())
}
