use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub const DIGEST_FILE: &str = "SHA256SUMS";

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ArtifactSummary {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

impl ArtifactSummary {
    /// Hash an artifact on disk.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::metadata(path)
            .with_context(|| format!("reading metadata for {}", path.display()))?
            .len();
        Ok(Self {
            path: path.display().to_string(),
            bytes,
            sha256: compute_file_sha256(path)?,
        })
    }

    fn file_name(&self) -> String {
        Path::new(&self.path)
            .file_name()
            .map_or_else(|| self.path.clone(), |name| name.to_string_lossy().into_owned())
    }
}

/// Lowercase hex SHA-256 of a file's contents.
///
/// # Errors
/// Returns an error if the file cannot be read.
pub fn compute_file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn parse_digest_file(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .filter_map(|line| {
            let (hash, name) = line.split_once("  ")?;
            let name = name.trim();
            (!hash.is_empty() && !name.is_empty()).then(|| (name.to_string(), hash.to_string()))
        })
        .collect()
}

/// Record artifact hashes in `<outdir>/SHA256SUMS`, in `sha256sum` format.
///
/// Entries already present for other files are kept, so repeated runs into
/// one directory accumulate. Lines are sorted by file name.
///
/// # Errors
/// Returns an error if the existing file cannot be read or the new one
/// cannot be written.
pub fn write_digest_file(outdir: &Path, artifacts: &[ArtifactSummary]) -> Result<PathBuf> {
    let path = outdir.join(DIGEST_FILE);
    let mut entries = match fs::read_to_string(&path) {
        Ok(existing) => parse_digest_file(&existing),
        Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", path.display()));
        }
    };
    for artifact in artifacts {
        entries.insert(artifact.file_name(), artifact.sha256.clone());
    }
    let mut body = String::new();
    for (name, hash) in &entries {
        body.push_str(hash);
        body.push_str("  ");
        body.push_str(name);
        body.push('\n');
    }
    fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
