use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::outcome::ReproError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "kebab-case")]
pub enum Input {
    Repository(PathBuf),
    SourceTree(PathBuf),
    Sdist(PathBuf),
}

/// Decide what kind of input `path` is.
///
/// # Errors
/// Returns [`ReproError::InvalidInput`] when `path` is neither an sdist, a git
/// work tree root, nor a directory with Python project metadata.
pub fn classify(path: &Path) -> Result<Input> {
    if path.is_file() && is_sdist_name(path) {
        return Ok(Input::Sdist(path.to_path_buf()));
    }
    if is_git_repository(path) {
        return Ok(Input::Repository(path.to_path_buf()));
    }
    if is_source_tree(path) {
        return Ok(Input::SourceTree(path.to_path_buf()));
    }
    Err(ReproError::InvalidInput(path.to_path_buf()).into())
}

fn is_sdist_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(".tar.gz"))
}

/// Whether `path` is the top level of a git work tree. Subdirectories of a
/// repository do not count.
#[must_use]
pub fn is_git_repository(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    let output = match Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(path)
        .output()
    {
        Ok(output) if output.status.success() => output,
        Ok(_) => return false,
        Err(err) => {
            debug!(%err, "git unavailable; treating path as a plain directory");
            return false;
        }
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let toplevel = Path::new(stdout.trim_end_matches('\n'));
    match (fs::canonicalize(toplevel), fs::canonicalize(path)) {
        (Ok(actual), Ok(expected)) => actual == expected,
        _ => false,
    }
}

fn is_source_tree(path: &Path) -> bool {
    path.is_dir()
        && ["pyproject.toml", "setup.py", "setup.cfg"]
            .iter()
            .any(|name| path.join(name).is_file())
}

/// Create the output directory when missing.
///
/// # Errors
/// Returns [`ReproError::NotADirectory`] when `path` exists but is not a
/// directory, or an I/O error if it cannot be created.
pub fn prepare_output_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("creating output directory at {}", path.display()))?;
    }
    if !path.is_dir() {
        return Err(ReproError::NotADirectory(path.to_path_buf()).into());
    }
    Ok(())
}
