//! Deterministic rewriting of sdists and wheels.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use filetime::set_file_times;
use tempfile::NamedTempFile;

use crate::epoch::Epoch;

pub mod sdist;
pub mod wheel;

pub use sdist::{cleanse_sdist, SdistReport};
pub use wheel::{breadth_first_key, normalize_wheel, sort_wheel, WheelReport};

pub const EXECUTABLE_MODE: u32 = 0o755;
pub const REGULAR_MODE: u32 = 0o644;

/// Collapse arbitrary permission bits onto one of the two modes allowed in a
/// reproducible archive.
#[must_use]
pub fn normalized_mode(mode: u32, is_dir: bool) -> u32 {
    if is_dir || mode & 0o111 != 0 {
        EXECUTABLE_MODE
    } else {
        REGULAR_MODE
    }
}

/// One archive member as read from the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub path: PathBuf,
    pub data: Vec<u8>,
    pub mode: u32,
    pub is_dir: bool,
}

impl MemberRecord {
    #[must_use]
    pub fn normalized_mode(&self) -> u32 {
        normalized_mode(self.mode, self.is_dir)
    }
}

/// Replace `path` with whatever `write` produces, going through a sibling
/// temp file so a failed rewrite never leaves a truncated archive behind.
///
/// The replacement keeps the original permissions. When `epoch` is given the
/// file's access and modification times are set to it.
pub(crate) fn replace_file<F>(path: &Path, epoch: Option<Epoch>, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let metadata =
        fs::metadata(path).with_context(|| format!("reading metadata for {}", path.display()))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temp file in {}", parent.display()))?;
    write(tmp.as_file_mut())?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("flushing rewrite of {}", path.display()))?;
    fs::set_permissions(tmp.path(), metadata.permissions())?;
    tmp.persist(path)
        .map_err(|err| anyhow!("replacing {}: {}", path.display(), err.error))?;
    if let Some(epoch) = epoch {
        let time = epoch.file_time();
        set_file_times(path, time, time)
            .with_context(|| format!("setting timestamps on {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn modes_collapse_to_two_values() {
        assert_eq!(normalized_mode(0o777, false), 0o755);
        assert_eq!(normalized_mode(0o700, false), 0o755);
        assert_eq!(normalized_mode(0o100, false), 0o755);
        assert_eq!(normalized_mode(0o666, false), 0o644);
        assert_eq!(normalized_mode(0o600, false), 0o644);
        assert_eq!(normalized_mode(0o000, false), 0o644);
        assert_eq!(normalized_mode(0o700, true), 0o755);
        assert_eq!(normalized_mode(0o000, true), 0o755);
    }

    #[test]
    fn replace_file_swaps_contents_and_sets_times() -> Result<()> {
        let temp = tempdir()?;
        let path = temp.path().join("artifact.bin");
        fs::write(&path, b"before")?;

        replace_file(&path, Some(Epoch::new(1_000_000_000)), |file| {
            file.write_all(b"after")?;
            Ok(())
        })?;

        assert_eq!(fs::read(&path)?, b"after");
        let meta = fs::metadata(&path)?;
        assert_eq!(
            FileTime::from_last_modification_time(&meta).unix_seconds(),
            1_000_000_000
        );
        let leftovers = fs::read_dir(temp.path())?.count();
        assert_eq!(leftovers, 1);
        Ok(())
    }

    #[test]
    fn replace_file_leaves_original_on_error() -> Result<()> {
        let temp = tempdir()?;
        let path = temp.path().join("artifact.bin");
        fs::write(&path, b"before")?;

        let result = replace_file(&path, None, |_| Err(anyhow!("writer failed")));

        assert!(result.is_err());
        assert_eq!(fs::read(&path)?, b"before");
        Ok(())
    }
}
