//! Delegation to the Python build frontends.
//!
//! Nothing here knows how to build a package; it only runs `python -m build`
//! or `cibuildwheel` with `SOURCE_DATE_EPOCH` set and finds what they wrote.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use filetime::FileTime;
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::archive::sdist::{contains_c_sources, extract_sdist};
use crate::config::BuildConfig;
use crate::epoch::Epoch;
use crate::outcome::ReproError;
use crate::process::{run_command, RunOutput};

const STDERR_TAIL_LINES: usize = 40;
const CONSTRAINTS_FILE: &str = "constraints.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildFrontend {
    Build,
    Cibuildwheel,
}

impl BuildFrontend {
    /// Pick the frontend for an sdist: anything shipping C sources needs the
    /// manylinux containers cibuildwheel provides.
    ///
    /// # Errors
    /// Returns an error if the sdist cannot be read.
    pub fn which(sdist: &Path) -> Result<Self> {
        if contains_c_sources(sdist)? {
            Ok(BuildFrontend::Cibuildwheel)
        } else {
            Ok(BuildFrontend::Build)
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            BuildFrontend::Build => "python -m build",
            BuildFrontend::Cibuildwheel => "cibuildwheel",
        }
    }
}

#[derive(Clone, Copy)]
enum ArtifactKind {
    Sdist,
    Wheel,
}

impl ArtifactKind {
    fn label(self) -> &'static str {
        match self {
            ArtifactKind::Sdist => "sdist",
            ArtifactKind::Wheel => "wheel",
        }
    }

    fn matches(self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return false;
        };
        match self {
            ArtifactKind::Sdist => name.ends_with(".tar.gz"),
            ArtifactKind::Wheel => Path::new(name)
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("whl")),
        }
    }
}

type DirSnapshot = BTreeMap<PathBuf, (FileTime, u64)>;

fn snapshot_dir(dir: &Path) -> Result<DirSnapshot> {
    let mut snapshot = BTreeMap::new();
    if !dir.exists() {
        return Ok(snapshot);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            snapshot.insert(
                entry.path(),
                (
                    FileTime::from_last_modification_time(&metadata),
                    metadata.len(),
                ),
            );
        }
    }
    Ok(snapshot)
}

/// The newest artifact of `kind` that is new or changed since `before`.
fn produced_artifact(
    dir: &Path,
    before: &DirSnapshot,
    kind: ArtifactKind,
    tool: &str,
) -> Result<PathBuf> {
    let after = snapshot_dir(dir)?;
    after
        .into_iter()
        .filter(|(path, stamp)| kind.matches(path) && before.get(path) != Some(stamp))
        .max_by_key(|(_, (mtime, _))| *mtime)
        .map(|(path, _)| path)
        .ok_or_else(|| {
            ReproError::MissingArtifact {
                tool: tool.to_string(),
                kind: kind.label(),
                dir: dir.to_path_buf(),
            }
            .into()
        })
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("failed to resolve the current directory")?
            .join(path))
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

fn run_tool(
    config: &BuildConfig,
    tool: &str,
    args: Vec<OsString>,
    envs: &[(String, String)],
    cwd: &Path,
) -> Result<RunOutput> {
    debug!(python = %config.python, ?args, cwd = %cwd.display(), "running {tool}");
    let output = run_command(&config.python, &args, envs, cwd, config.max_capture_bytes)?;
    debug!(tool, code = output.code, stdout = %output.stdout, "build tool finished");
    if !output.success() {
        return Err(ReproError::BuildFailed {
            tool: tool.to_string(),
            code: output.code,
            stderr: stderr_tail(&output.stderr),
        }
        .into());
    }
    Ok(output)
}

fn epoch_env(epoch: Epoch) -> (String, String) {
    ("SOURCE_DATE_EPOCH".to_string(), epoch.to_string())
}

fn constraints_path(config: &BuildConfig) -> Result<Option<PathBuf>> {
    let Some(path) = &config.constraints else {
        return Ok(None);
    };
    if !path.is_file() {
        return Err(ReproError::MissingFile(path.clone()).into());
    }
    absolute(path).map(Some)
}

/// Environment for `python -m build`: the epoch plus pip constraints, if any.
fn frontend_env(config: &BuildConfig, epoch: Epoch) -> Result<Vec<(String, String)>> {
    let mut envs = vec![epoch_env(epoch)];
    if let Some(path) = constraints_path(config)? {
        envs.push(("PIP_CONSTRAINT".to_string(), path.display().to_string()));
    }
    Ok(envs)
}

/// Environment for cibuildwheel run from `workdir`. Constraints are staged
/// into `workdir` so the container sees them at `/constraints.txt`.
fn cibuildwheel_env(
    config: &BuildConfig,
    epoch: Epoch,
    workdir: &Path,
) -> Result<Vec<(String, String)>> {
    let mut envs = vec![
        epoch_env(epoch),
        ("CIBW_BUILD_FRONTEND".to_string(), "build".to_string()),
        (
            "CIBW_CONTAINER_ENGINE".to_string(),
            config.container_engine.clone(),
        ),
        (
            "CIBW_ENVIRONMENT_PASS_LINUX".to_string(),
            "SOURCE_DATE_EPOCH".to_string(),
        ),
    ];
    if let Some(path) = constraints_path(config)? {
        let staged = workdir.join(CONSTRAINTS_FILE);
        fs::copy(&path, &staged)
            .with_context(|| format!("staging constraints {}", path.display()))?;
        envs.push((
            "CIBW_DEPENDENCY_VERSIONS".to_string(),
            staged.display().to_string(),
        ));
        envs.push((
            "CIBW_ENVIRONMENT".to_string(),
            format!("PIP_TIMEOUT=150 PIP_CONSTRAINT=/{CONSTRAINTS_FILE}"),
        ));
    }
    Ok(envs)
}

/// Build an sdist from a source directory into `outdir`.
///
/// # Errors
/// Returns an error if the build fails or no sdist appears in `outdir`.
pub fn build_sdist(
    srcdir: &Path,
    outdir: &Path,
    epoch: Epoch,
    config: &BuildConfig,
) -> Result<PathBuf> {
    let srcdir = absolute(srcdir)?;
    let outdir = absolute(outdir)?;
    let before = snapshot_dir(&outdir)?;
    let tool = BuildFrontend::Build.label();
    info!(source = %srcdir.display(), %epoch, "building sdist");
    let args = vec![
        OsString::from("-m"),
        OsString::from("build"),
        OsString::from("--sdist"),
        OsString::from("--outdir"),
        outdir.clone().into_os_string(),
        srcdir.clone().into_os_string(),
    ];
    let envs = frontend_env(config, epoch)?;
    run_tool(config, tool, args, &envs, &srcdir)?;
    produced_artifact(&outdir, &before, ArtifactKind::Sdist, tool)
}

/// Build a wheel from an sdist into `outdir`.
///
/// The sdist is unpacked into a temporary directory first. Sdists with C
/// sources go through cibuildwheel, everything else through `python -m build`.
///
/// # Errors
/// Returns an error if extraction or the build fails, or no wheel is found.
pub fn build_wheel(
    sdist: &Path,
    outdir: &Path,
    epoch: Epoch,
    config: &BuildConfig,
) -> Result<PathBuf> {
    let outdir = absolute(outdir)?;
    let frontend = BuildFrontend::which(sdist)?;
    let scratch = TempDir::new().context("creating build directory")?;
    let unpack = scratch.path().join("src");
    fs::create_dir_all(&unpack)?;
    let srcdir = extract_sdist(sdist, &unpack)?;
    info!(sdist = %sdist.display(), frontend = frontend.label(), %epoch, "building wheel");
    match frontend {
        BuildFrontend::Build => {
            let before = snapshot_dir(&outdir)?;
            let args = vec![
                OsString::from("-m"),
                OsString::from("build"),
                OsString::from("--wheel"),
                OsString::from("--outdir"),
                outdir.clone().into_os_string(),
                srcdir.clone().into_os_string(),
            ];
            let envs = frontend_env(config, epoch)?;
            run_tool(config, frontend.label(), args, &envs, &srcdir)?;
            produced_artifact(&outdir, &before, ArtifactKind::Wheel, frontend.label())
        }
        BuildFrontend::Cibuildwheel => {
            let wheelhouse = scratch.path().join("wheelhouse");
            fs::create_dir_all(&wheelhouse)?;
            let only = format!("cp{}-manylinux_x86_64", python_tag(config)?);
            let args = vec![
                OsString::from("-m"),
                OsString::from("cibuildwheel"),
                OsString::from("--output-dir"),
                wheelhouse.clone().into_os_string(),
                OsString::from("--only"),
                OsString::from(only),
                srcdir.clone().into_os_string(),
            ];
            let envs = cibuildwheel_env(config, epoch, scratch.path())?;
            run_tool(config, frontend.label(), args, &envs, scratch.path())?;
            let built = produced_artifact(
                &wheelhouse,
                &DirSnapshot::new(),
                ArtifactKind::Wheel,
                frontend.label(),
            )?;
            let name = built
                .file_name()
                .ok_or_else(|| anyhow!("wheel path has no file name"))?;
            let dest = outdir.join(name);
            move_into_place(&built, &dest)?;
            Ok(dest)
        }
    }
}

/// `<major><minor>` of the configured interpreter, e.g. `312`.
fn python_tag(config: &BuildConfig) -> Result<String> {
    let args = vec![
        OsString::from("-c"),
        OsString::from("import sys; print(f\"{sys.version_info[0]}{sys.version_info[1]}\")"),
    ];
    let output = run_command(
        &config.python,
        &args,
        &[],
        Path::new("."),
        config.max_capture_bytes,
    )
    .context("failed to query python version")?;
    if !output.success() {
        bail!("failed to query python version");
    }
    Ok(output.stdout.trim().to_string())
}

fn move_into_place(src: &Path, dest: &Path) -> io::Result<()> {
    match fs::remove_file(dest) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device(&err) => {
            fs::copy(src, dest)?;
            fs::remove_file(src)
        }
        Err(err) => Err(err),
    }
}

fn is_cross_device(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(18))
}
