//! Canonical build timestamps.
//!
//! Every artifact written by a single invocation shares one epoch. It comes
//! from `SOURCE_DATE_EPOCH`, the last commit of a repository, or the newest
//! member of an sdist, and is never earlier than [`EARLIEST`].

use std::ffi::OsStr;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use filetime::FileTime;
use flate2::read::GzDecoder;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use crate::config::Config;
use crate::outcome::ReproError;

/// 1980-01-01T00:00:00Z, the earliest instant both tar and zip can record.
pub const EARLIEST: u64 = 315_532_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Epoch(u64);

impl Epoch {
    #[must_use]
    pub fn new(secs: u64) -> Self {
        Self(secs.max(EARLIEST))
    }

    #[must_use]
    pub fn clamped(secs: i64) -> Self {
        Self::new(u64::try_from(secs).unwrap_or(0))
    }

    #[must_use]
    pub fn earliest() -> Self {
        Self(EARLIEST)
    }

    #[must_use]
    pub fn secs(self) -> u64 {
        self.0
    }

    /// Parse a `SOURCE_DATE_EPOCH` style value.
    ///
    /// Decimal values are rounded to whole seconds.
    ///
    /// # Errors
    /// Returns [`ReproError::InvalidEpoch`] for empty, negative or non-numeric
    /// input.
    pub fn parse(raw: &str) -> Result<Self, ReproError> {
        let trimmed = raw.trim();
        let invalid = || ReproError::InvalidEpoch(raw.to_string());
        if trimmed.is_empty() {
            return Err(invalid());
        }
        if let Ok(secs) = trimmed.parse::<u64>() {
            return Ok(Self::new(secs));
        }
        let value = trimmed.parse::<f64>().map_err(|_| invalid())?;
        if !value.is_finite() || value < 0.0 || value > u64::MAX as f64 {
            return Err(invalid());
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(Self::new(value.round() as u64))
    }

    pub(crate) fn as_i64(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    pub(crate) fn file_time(self) -> FileTime {
        FileTime::from_unix_time(self.as_i64(), 0)
    }

    /// The value recorded in a gzip header, where 0 means "unset".
    pub(crate) fn gzip_mtime(self) -> u32 {
        u32::try_from(self.0).unwrap_or(0)
    }

    pub(crate) fn datetime(self) -> Result<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.as_i64())
            .with_context(|| format!("epoch {} is out of range", self.0))
    }

    /// The DOS timestamp stored in zip headers.
    ///
    /// # Errors
    /// Returns an error when the epoch falls after 2107, the last year a DOS
    /// date can hold.
    pub fn to_zip_datetime(self) -> Result<zip::DateTime> {
        let dt = self.datetime()?;
        let year = u16::try_from(dt.year()).context("year out of range for a zip timestamp")?;
        zip::DateTime::from_date_and_time(
            year,
            u8::from(dt.month()),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second(),
        )
        .map_err(|()| anyhow!("epoch {} cannot be stored in a zip archive", self.0))
    }

    #[must_use]
    pub fn to_rfc3339(self) -> String {
        self.datetime()
            .ok()
            .and_then(|dt| dt.format(&Rfc3339).ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Latest member modification time of a gzipped tar archive.
///
/// # Errors
/// Returns an error if the archive cannot be read or has no members.
pub fn latest_modification_time(archive: &Path) -> Result<Epoch> {
    let file = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut latest = None;
    for entry in tar
        .entries()
        .with_context(|| format!("reading {}", archive.display()))?
    {
        let entry = entry.with_context(|| format!("reading {}", archive.display()))?;
        let mtime = entry.header().mtime()?;
        latest = Some(latest.map_or(mtime, |current: u64| current.max(mtime)));
    }
    let latest = latest.ok_or_else(|| ReproError::EmptyArchive(archive.to_path_buf()))?;
    debug!(archive = %archive.display(), latest, "latest member mtime");
    Ok(Epoch::new(latest))
}

/// Committer time of `HEAD` in a git repository.
///
/// # Errors
/// Returns an error if git cannot be run or the repository has no commits.
pub fn latest_commit_time(repository: &Path) -> Result<Epoch> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repository)
        .args(["log", "-1", "--pretty=%ct"])
        .output()
        .context("failed to run git")?;
    if !output.status.success() {
        bail!(
            "git log failed in {}: {}",
            repository.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let raw = stdout.trim();
    if raw.is_empty() {
        bail!("{} has no commits", repository.display());
    }
    let secs = raw
        .parse::<i64>()
        .with_context(|| format!("unexpected git commit time `{raw}`"))?;
    debug!(repository = %repository.display(), secs, "latest commit time");
    Ok(Epoch::clamped(secs))
}

fn is_tool_dir(name: &OsStr) -> bool {
    matches!(
        name.to_str().unwrap_or_default(),
        ".git"
            | ".hg"
            | "__pycache__"
            | ".pytest_cache"
            | ".mypy_cache"
            | ".ruff_cache"
            | ".venv"
            | ".tox"
            | ".nox"
            | "build"
            | "dist"
    )
}

/// Newest file modification time under a source tree.
///
/// # Errors
/// Returns an error if the tree cannot be walked.
pub fn latest_tree_mtime(root: &Path) -> Result<Epoch> {
    let mut latest: Option<i64> = None;
    for entry in walkdir::WalkDir::new(root)
        .sort_by(|a, b| a.path().cmp(b.path()))
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_tool_dir(entry.file_name()))
    {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry
            .metadata()
            .with_context(|| format!("reading metadata for {}", entry.path().display()))?;
        let mtime = FileTime::from_last_modification_time(&metadata).unix_seconds();
        latest = Some(latest.map_or(mtime, |current| current.max(mtime)));
    }
    match latest {
        Some(secs) => Ok(Epoch::clamped(secs)),
        None => {
            debug!(root = %root.display(), "no files found; using earliest epoch");
            Ok(Epoch::earliest())
        }
    }
}

/// Epoch for an sdist built from a git repository.
///
/// # Errors
/// Returns [`ReproError::InvalidEpoch`] for a malformed `SOURCE_DATE_EPOCH`
/// and propagates failures from [`latest_commit_time`].
pub fn derive_for_repository(repository: &Path, config: &Config) -> Result<Epoch> {
    match config.source_date_epoch()? {
        Some(epoch) => Ok(epoch),
        None => latest_commit_time(repository),
    }
}

/// Epoch for an sdist built from a plain source tree.
///
/// # Errors
/// Returns [`ReproError::InvalidEpoch`] for a malformed `SOURCE_DATE_EPOCH`
/// and propagates failures from [`latest_tree_mtime`].
pub fn derive_for_source_tree(root: &Path, config: &Config) -> Result<Epoch> {
    match config.source_date_epoch()? {
        Some(epoch) => Ok(epoch),
        None => latest_tree_mtime(root),
    }
}

/// Epoch for a wheel built from an sdist. The archive is authoritative, so
/// `SOURCE_DATE_EPOCH` is not consulted.
///
/// # Errors
/// Propagates failures from [`latest_modification_time`].
pub fn derive_for_sdist(sdist: &Path) -> Result<Epoch> {
    latest_modification_time(sdist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    use filetime::set_file_mtime;
    use flate2::{write::GzEncoder, Compression};
    use tempfile::tempdir;

    use crate::config::EnvSnapshot;

    fn config_with(env: &[(&str, &str)]) -> Config {
        Config::from_snapshot(&EnvSnapshot::testing(env))
    }

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|output| output.status.success())
    }

    fn git(repo: &Path, date: &str, args: &[&str]) -> Result<()> {
        let status = Command::new("git")
            .args(args)
            .current_dir(repo)
            .env("GIT_AUTHOR_NAME", "Test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "Test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .env("GIT_AUTHOR_DATE", date)
            .env("GIT_COMMITTER_DATE", date)
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("HOME", repo)
            .status()?;
        if !status.success() {
            bail!("git {args:?} failed");
        }
        Ok(())
    }

    fn repository_committed_at(root: &Path, date: &str) -> Result<PathBuf> {
        let repo = root.join("repo");
        fs::create_dir_all(&repo)?;
        fs::write(repo.join("setup.py"), "")?;
        git(&repo, date, &["init", "-q"])?;
        git(&repo, date, &["add", "setup.py"])?;
        git(&repo, date, &["commit", "-q", "--no-gpg-sign", "-m", "initial"])?;
        Ok(repo)
    }

    fn write_sdist(path: &Path, members: &[(&str, u64)]) -> Result<()> {
        let file = File::create(path)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, mtime) in members {
            let body = name.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(*mtime);
            builder.append_data(&mut header, name, body)?;
        }
        builder.into_inner()?.finish()?;
        Ok(())
    }

    #[test]
    fn parse_accepts_integers_and_decimals() {
        assert_eq!(Epoch::parse("1700000000").unwrap().secs(), 1_700_000_000);
        assert_eq!(Epoch::parse(" 1700000000\n").unwrap().secs(), 1_700_000_000);
        assert_eq!(Epoch::parse("1700000000.6").unwrap().secs(), 1_700_000_001);
    }

    #[test]
    fn parse_rejects_garbage() {
        for raw in ["", "  ", "-5", "abc", "NaN", "inf"] {
            assert!(Epoch::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn epochs_never_precede_1980() {
        assert_eq!(Epoch::new(0).secs(), EARLIEST);
        assert_eq!(Epoch::clamped(-1).secs(), EARLIEST);
        assert_eq!(Epoch::parse("86400").unwrap().secs(), EARLIEST);
        assert_eq!(Epoch::new(EARLIEST + 1).secs(), EARLIEST + 1);
    }

    #[test]
    fn zip_datetime_matches_utc_calendar() {
        // 2024-01-01T00:00:02Z
        let epoch = Epoch::new(1_704_067_202);
        let dt = epoch.to_zip_datetime().unwrap();
        assert_eq!(dt.year(), 2024);
        assert_eq!(dt.month(), 1);
        assert_eq!(dt.day(), 1);
        assert_eq!(dt.hour(), 0);
        assert_eq!(dt.minute(), 0);
        assert_eq!(dt.second(), 2);
        assert_eq!(epoch.to_rfc3339(), "2024-01-01T00:00:02Z");
    }

    #[test]
    fn latest_modification_time_picks_newest_member() -> Result<()> {
        let temp = tempdir()?;
        let sdist = temp.path().join("demo-0.1.0.tar.gz");
        write_sdist(
            &sdist,
            &[
                ("demo-0.1.0/a.py", 1_009_843_200),
                ("demo-0.1.0/b.py", 1_577_836_800),
                ("demo-0.1.0/c.py", 1_262_304_000),
            ],
        )?;
        assert_eq!(latest_modification_time(&sdist)?.secs(), 1_577_836_800);
        Ok(())
    }

    #[test]
    fn latest_modification_time_rejects_empty_archives() -> Result<()> {
        let temp = tempdir()?;
        let sdist = temp.path().join("empty.tar.gz");
        write_sdist(&sdist, &[])?;
        let err = latest_modification_time(&sdist).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReproError>(),
            Some(ReproError::EmptyArchive(_))
        ));
        Ok(())
    }

    #[test]
    fn tree_mtime_ignores_tool_directories() -> Result<()> {
        let temp = tempdir()?;
        let root = temp.path();
        let source = root.join("pkg.py");
        fs::write(&source, "x = 1\n")?;
        set_file_mtime(&source, FileTime::from_unix_time(1_600_000_000, 0))?;
        let cache: PathBuf = root.join("__pycache__");
        fs::create_dir_all(&cache)?;
        let pyc = cache.join("pkg.cpython-312.pyc");
        fs::write(&pyc, b"\0")?;
        set_file_mtime(&pyc, FileTime::from_unix_time(1_700_000_000, 0))?;

        assert_eq!(latest_tree_mtime(root)?.secs(), 1_600_000_000);
        Ok(())
    }

    #[test]
    fn empty_tree_falls_back_to_earliest() -> Result<()> {
        let temp = tempdir()?;
        assert_eq!(latest_tree_mtime(temp.path())?, Epoch::earliest());
        Ok(())
    }

    #[test]
    fn configured_epoch_overrides_tree_scan() -> Result<()> {
        let temp = tempdir()?;
        let file = temp.path().join("setup.py");
        fs::write(&file, "")?;
        let config = config_with(&[("SOURCE_DATE_EPOCH", "978307200")]);
        assert_eq!(
            derive_for_source_tree(temp.path(), &config)?.secs(),
            978_307_200
        );
        Ok(())
    }

    #[test]
    fn blank_source_date_epoch_is_ignored_for_trees() -> Result<()> {
        let temp = tempdir()?;
        let file = temp.path().join("setup.py");
        fs::write(&file, "")?;
        set_file_mtime(&file, FileTime::from_unix_time(1_500_000_000, 0))?;
        let config = config_with(&[("SOURCE_DATE_EPOCH", " ")]);
        assert_eq!(
            derive_for_source_tree(temp.path(), &config)?.secs(),
            1_500_000_000
        );
        Ok(())
    }

    #[test]
    fn malformed_source_date_epoch_fails_tree_derivation() -> Result<()> {
        let temp = tempdir()?;
        let config = config_with(&[("SOURCE_DATE_EPOCH", "last week")]);
        let err = derive_for_source_tree(temp.path(), &config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReproError>(),
            Some(ReproError::InvalidEpoch(_))
        ));
        Ok(())
    }

    #[test]
    fn commit_time_comes_from_head() -> Result<()> {
        if !git_available() {
            eprintln!("skipping commit time test (git not found)");
            return Ok(());
        }
        let temp = tempdir()?;
        let repo = repository_committed_at(temp.path(), "@1650000000 +0000")?;

        assert_eq!(latest_commit_time(&repo)?.secs(), 1_650_000_000);
        assert_eq!(
            derive_for_repository(&repo, &config_with(&[]))?.secs(),
            1_650_000_000
        );
        Ok(())
    }

    #[test]
    fn source_date_epoch_wins_over_commit_time() -> Result<()> {
        if !git_available() {
            eprintln!("skipping commit time test (git not found)");
            return Ok(());
        }
        let temp = tempdir()?;
        let repo = repository_committed_at(temp.path(), "@1650000000 +0000")?;
        let config = config_with(&[("SOURCE_DATE_EPOCH", "1700000000")]);

        assert_eq!(derive_for_repository(&repo, &config)?.secs(), 1_700_000_000);
        Ok(())
    }

    #[test]
    fn commits_before_1980_are_clamped() -> Result<()> {
        if !git_available() {
            eprintln!("skipping commit time test (git not found)");
            return Ok(());
        }
        let temp = tempdir()?;
        let repo = repository_committed_at(temp.path(), "@100000000 +0000")?;

        assert_eq!(latest_commit_time(&repo)?, Epoch::earliest());
        Ok(())
    }

    #[test]
    fn repository_without_commits_is_an_error() -> Result<()> {
        if !git_available() {
            eprintln!("skipping commit time test (git not found)");
            return Ok(());
        }
        let temp = tempdir()?;
        let repo = temp.path().join("empty");
        fs::create_dir_all(&repo)?;
        git(&repo, "@1650000000 +0000", &["init", "-q"])?;

        assert!(latest_commit_time(&repo).is_err());
        Ok(())
    }
}
