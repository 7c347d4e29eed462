use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use takeoutfix_core::{pipeline, ExiftoolResolver};

/// Restore Google Photos Takeout metadata from JSON sidecars.
///
/// Drop the tool into a folder of Takeout ZIP archives and run it: archives
/// are validated and extracted, every media file is matched with its
/// sidecar, capture times, GPS and descriptions are written back into the
/// media, and successfully applied sidecars are removed. Filename-encoded
/// capture times are interpreted as UTC.
#[derive(Parser)]
#[command(name = "takeoutfix", version)]
struct Cli {
    /// Working directory holding the Takeout archives (defaults to the
    /// current directory)
    #[arg(long)]
    workdir: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let workdir = match resolve_workdir(cli.workdir) {
        Ok(workdir) => workdir,
        Err(err) => {
            eprintln!("invalid arguments: {err:#}");
            eprintln!("usage: takeoutfix [--workdir /path/to/folder]");
            std::process::exit(pipeline::EXIT_RUNTIME_FAIL);
        }
    };

    let report = pipeline::run(&workdir, &ExiftoolResolver);
    std::process::exit(report.exit_code);
}

fn resolve_workdir(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let workdir = match arg {
        Some(path) => path,
        None => std::env::current_dir().context("get current working directory")?,
    };

    let metadata = match std::fs::metadata(&workdir) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            bail!("workdir {:?} does not exist", workdir)
        }
        Err(err) => return Err(err).with_context(|| format!("stat workdir {workdir:?}")),
    };
    if !metadata.is_dir() {
        bail!("workdir {:?} is not a directory", workdir);
    }
    Ok(workdir)
}
