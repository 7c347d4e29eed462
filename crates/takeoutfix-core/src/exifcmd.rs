//! Resolution of the external metadata tool.
//!
//! The pipeline receives the resolver as a capability so tests can swap in
//! doubles without touching global state. The production resolver honors a
//! `TAKEOUTFIX_EXIFTOOL_PATH` override, then searches PATH for the
//! platform's candidate names.

use std::env;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("exiftool executable not found in PATH (tried: {tried})")]
pub struct MissingTool {
    pub tried: String,
}

pub trait ToolResolver: Send + Sync {
    fn resolve(&self) -> Result<PathBuf, MissingTool>;
}

/// PATH-based exiftool lookup with an environment override.
#[derive(Debug, Default)]
pub struct ExiftoolResolver;

pub const TOOL_PATH_ENV: &str = "TAKEOUTFIX_EXIFTOOL_PATH";

fn candidates() -> &'static [&'static str] {
    if cfg!(windows) {
        &["exiftool", "exiftool.exe", "exiftool(-k).exe"]
    } else {
        &["exiftool"]
    }
}

impl ToolResolver for ExiftoolResolver {
    fn resolve(&self) -> Result<PathBuf, MissingTool> {
        if let Some(overridden) = env::var_os(TOOL_PATH_ENV) {
            let path = PathBuf::from(overridden);
            if path.is_file() {
                return Ok(path);
            }
        }

        for candidate in candidates() {
            if let Some(found) = search_path(candidate) {
                return Ok(found);
            }
        }

        Err(MissingTool {
            tried: candidates().join(", "),
        })
    }
}

fn search_path(name: &str) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Per-platform install hints shown when the tool is missing.
pub fn install_hints() -> Vec<String> {
    if cfg!(target_os = "macos") {
        vec!["brew install exiftool".to_string()]
    } else if cfg!(target_os = "windows") {
        vec!["winget install --id OliverBetz.ExifTool --exact".to_string()]
    } else {
        vec![
            "apt-get install -y libimage-exiftool-perl".to_string(),
            "dnf install -y perl-Image-ExifTool".to_string(),
            "pacman -S --noconfirm perl-image-exiftool".to_string(),
        ]
    }
}

/// Fixed-path resolver, used by tests and by callers that already know
/// where the tool lives.
#[derive(Debug, Clone)]
pub struct FixedResolver(pub PathBuf);

impl ToolResolver for FixedResolver {
    fn resolve(&self) -> Result<PathBuf, MissingTool> {
        if self.0.is_file() {
            Ok(self.0.clone())
        } else {
            Err(MissingTool {
                tried: self.0.display().to_string(),
            })
        }
    }
}
