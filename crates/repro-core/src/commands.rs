use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::archive::{cleanse_sdist, normalize_wheel, sort_wheel};
use crate::build::{build_sdist, build_wheel};
use crate::config::Config;
use crate::digest::{write_digest_file, ArtifactSummary};
use crate::epoch::{self, Epoch};
use crate::inputs::{classify, prepare_output_dir, Input};
use crate::outcome::{CommandStatus, ExecutionOutcome, ReproError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandGroup {
    Build,
    Cleanse,
    Normalize,
    Epoch,
}

impl fmt::Display for CommandGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandGroup::Build => "build",
            CommandGroup::Cleanse => "cleanse",
            CommandGroup::Normalize => "normalize",
            CommandGroup::Epoch => "epoch",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ReproduceRequest {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub sort_wheels: bool,
}

#[derive(Debug, Clone)]
pub struct CleanseRequest {
    pub sdists: Vec<PathBuf>,
    pub epoch: Option<Epoch>,
}

#[derive(Debug, Clone)]
pub struct NormalizeRequest {
    pub wheels: Vec<PathBuf>,
    pub epoch: Option<Epoch>,
    pub sort: bool,
}

#[derive(Debug, Clone)]
pub struct EpochRequest {
    pub input: PathBuf,
}

#[derive(Debug, Clone)]
pub enum ReproCommand {
    Build(ReproduceRequest),
    Cleanse(CleanseRequest),
    Normalize(NormalizeRequest),
    Epoch(EpochRequest),
}

impl ReproCommand {
    #[must_use]
    pub fn group(&self) -> CommandGroup {
        match self {
            ReproCommand::Build(_) => CommandGroup::Build,
            ReproCommand::Cleanse(_) => CommandGroup::Cleanse,
            ReproCommand::Normalize(_) => CommandGroup::Normalize,
            ReproCommand::Epoch(_) => CommandGroup::Epoch,
        }
    }
}

pub struct CommandContext {
    config: Config,
}

impl CommandContext {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Run a command against the current process environment.
///
/// Errors never escape: they are folded into the returned outcome.
#[must_use]
pub fn execute(command: &ReproCommand) -> ExecutionOutcome {
    let ctx = CommandContext::new(Config::from_env());
    let result = match command {
        ReproCommand::Build(request) => reproduce(&ctx, request),
        ReproCommand::Cleanse(request) => cleanse(&ctx, request),
        ReproCommand::Normalize(request) => normalize(&ctx, request),
        ReproCommand::Epoch(request) => show_epoch(&ctx, request),
    };
    result.unwrap_or_else(|err| {
        if err.downcast_ref::<ReproError>().is_none() {
            error!("{err:?}");
        }
        ExecutionOutcome::from_error(&err)
    })
}

/// Build reproducible artifacts: an sdist for each repository or source
/// tree, a wheel for each sdist.
///
/// # Errors
/// Returns an error when an input is invalid, a build fails, or an artifact
/// cannot be rewritten.
pub fn reproduce(ctx: &CommandContext, request: &ReproduceRequest) -> Result<ExecutionOutcome> {
    let inputs = request
        .inputs
        .iter()
        .map(|path| classify(path))
        .collect::<Result<Vec<_>>>()?;
    prepare_output_dir(&request.output)?;

    let mut artifacts = Vec::new();
    for input in &inputs {
        let artifact = match input {
            Input::Repository(path) | Input::SourceTree(path) => {
                let epoch = match input {
                    Input::Repository(_) => epoch::derive_for_repository(path, ctx.config())?,
                    _ => epoch::derive_for_source_tree(path, ctx.config())?,
                };
                let sdist = build_sdist(path, &request.output, epoch, ctx.config().build())?;
                cleanse_sdist(&sdist, epoch)?;
                info!(sdist = %sdist.display(), %epoch, "wrote reproducible sdist");
                sdist
            }
            Input::Sdist(path) => {
                let epoch = epoch::derive_for_sdist(path)?;
                let wheel = build_wheel(path, &request.output, epoch, ctx.config().build())?;
                normalize_wheel(&wheel, epoch)?;
                if request.sort_wheels {
                    sort_wheel(&wheel)?;
                }
                info!(wheel = %wheel.display(), %epoch, "wrote reproducible wheel");
                wheel
            }
        };
        artifacts.push(ArtifactSummary::from_path(&artifact)?);
    }
    let digest = write_digest_file(&request.output, &artifacts)?;

    let message = match artifacts.as_slice() {
        [single] => format!("wrote {} (sha256={}…)", single.path, short_sha(&single.sha256)),
        many => format!("wrote {} artifacts", many.len()),
    };
    Ok(ExecutionOutcome::success(
        message,
        json!({
            "inputs": inputs,
            "artifacts": artifacts,
            "digest_file": digest.display().to_string(),
            "out_dir": request.output.display().to_string(),
            "reproducibly_version": crate::REPRODUCIBLY_VERSION,
        }),
    ))
}

/// `--epoch` when given; `SOURCE_DATE_EPOCH` is only read without it.
fn fallback_epoch(ctx: &CommandContext, requested: Option<Epoch>) -> Result<Epoch> {
    if let Some(epoch) = requested {
        return Ok(epoch);
    }
    Ok(ctx
        .config()
        .source_date_epoch()?
        .unwrap_or_else(Epoch::earliest))
}

/// Rewrite existing sdists in place. Every file is attempted before the
/// outcome reports failures.
///
/// # Errors
/// Returns an error only for a malformed `SOURCE_DATE_EPOCH` consulted in
/// place of `--epoch`; individual sdists are reported in the outcome details.
pub fn cleanse(ctx: &CommandContext, request: &CleanseRequest) -> Result<ExecutionOutcome> {
    let epoch = fallback_epoch(ctx, request.epoch)?;
    rewrite_each(CommandGroup::Cleanse, &request.sdists, epoch, |path| {
        let report = cleanse_sdist(path, epoch)?;
        Ok(json!({ "members": report.members }))
    })
}

/// Rewrite existing wheels in place, optionally in canonical order.
///
/// # Errors
/// Returns an error only for a malformed `SOURCE_DATE_EPOCH` consulted in
/// place of `--epoch`; individual wheels are reported in the outcome details.
pub fn normalize(ctx: &CommandContext, request: &NormalizeRequest) -> Result<ExecutionOutcome> {
    let epoch = fallback_epoch(ctx, request.epoch)?;
    rewrite_each(CommandGroup::Normalize, &request.wheels, epoch, |path| {
        let report = normalize_wheel(path, epoch)?;
        if request.sort {
            sort_wheel(path)?;
        }
        Ok(json!({ "members": report.members, "sorted": request.sort }))
    })
}

fn rewrite_each<F>(
    group: CommandGroup,
    paths: &[PathBuf],
    epoch: Epoch,
    mut rewrite: F,
) -> Result<ExecutionOutcome>
where
    F: FnMut(&Path) -> Result<Value>,
{
    let mut rewritten = Vec::new();
    let mut failed = Vec::new();
    for path in paths {
        let result = if path.is_file() {
            rewrite(path).and_then(|extra| Ok((ArtifactSummary::from_path(path)?, extra)))
        } else {
            Err(ReproError::MissingFile(path.clone()).into())
        };
        match result {
            Ok((summary, extra)) => rewritten.push(json!({ "artifact": summary, "report": extra })),
            Err(err) => {
                warn!(path = %path.display(), "{group} failed: {err:#}");
                failed.push(json!({
                    "path": path.display().to_string(),
                    "error": format!("{err:#}"),
                }));
            }
        }
    }
    let details = json!({
        "epoch": epoch,
        "timestamp": epoch.to_rfc3339(),
        "rewritten": rewritten,
        "failed": failed,
    });
    if failed.is_empty() {
        Ok(ExecutionOutcome::success(
            format!("rewrote {} file(s) at {}", rewritten.len(), epoch.to_rfc3339()),
            details,
        ))
    } else {
        Ok(ExecutionOutcome::user_error(
            format!("{} of {} file(s) could not be rewritten", failed.len(), paths.len()),
            details,
        ))
    }
}

/// Report the epoch an input would be stamped with.
///
/// # Errors
/// Returns an error if the input is invalid or its epoch cannot be derived.
pub fn show_epoch(ctx: &CommandContext, request: &EpochRequest) -> Result<ExecutionOutcome> {
    let input = classify(&request.input)?;
    let (epoch, source) = match &input {
        Input::Repository(path) => {
            let from_env = ctx.config().source_date_epoch()?.is_some();
            (
                epoch::derive_for_repository(path, ctx.config())?,
                if from_env { "SOURCE_DATE_EPOCH" } else { "git" },
            )
        }
        Input::SourceTree(path) => {
            let from_env = ctx.config().source_date_epoch()?.is_some();
            (
                epoch::derive_for_source_tree(path, ctx.config())?,
                if from_env { "SOURCE_DATE_EPOCH" } else { "mtime" },
            )
        }
        Input::Sdist(path) => (epoch::derive_for_sdist(path)?, "sdist"),
    };
    Ok(ExecutionOutcome::success(
        epoch.to_string(),
        json!({
            "epoch": epoch,
            "timestamp": epoch.to_rfc3339(),
            "source": source,
            "input": input,
        }),
    ))
}

fn short_sha(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}

#[must_use]
pub fn format_status_message(group: CommandGroup, message: &str) -> String {
    let prefix = format!("reproducibly {group}");
    if message.is_empty() {
        prefix
    } else if message.starts_with(&prefix) {
        message.to_string()
    } else {
        format!("{prefix}: {message}")
    }
}

#[must_use]
pub fn to_json_response(group: CommandGroup, outcome: &ExecutionOutcome) -> Value {
    let status = match outcome.status {
        CommandStatus::Ok => "ok",
        CommandStatus::UserError => "user-error",
        CommandStatus::Failure => "error",
    };
    let details = match &outcome.details {
        Value::Object(_) => outcome.details.clone(),
        Value::Null => json!({}),
        other => json!({ "value": other }),
    };
    json!({
        "status": status,
        "message": format_status_message(group, &outcome.message),
        "details": details,
    })
}
