use atty::Stream;
use clap::Parser;
use color_eyre::Result;
use repro_core::{
    CleanseRequest, CommandGroup, EpochRequest, ExecutionOutcome, NormalizeRequest,
    ReproCommand, ReproduceRequest,
};
use serde_json::Value;

mod cli;
mod style;

use cli::{CommandGroupCli, ReproCli};
use style::Style;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = ReproCli::parse();
    init_tracing(cli.trace, cli.verbose, cli.quiet);

    let command = build_command(&cli.command);
    let outcome = repro_core::execute(&command);
    let code = emit_output(&cli, command.group(), &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8, quiet: bool) {
    let level = if trace {
        "trace"
    } else if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("reproducibly={level},repro_core={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn build_command(group: &CommandGroupCli) -> ReproCommand {
    match group {
        CommandGroupCli::Build(args) => ReproCommand::Build(ReproduceRequest {
            inputs: args.inputs.clone(),
            output: args.output.clone(),
            sort_wheels: args.sort_wheels,
        }),
        CommandGroupCli::Cleanse(args) => ReproCommand::Cleanse(CleanseRequest {
            sdists: args.sdists.clone(),
            epoch: args.epoch,
        }),
        CommandGroupCli::Normalize(args) => ReproCommand::Normalize(NormalizeRequest {
            wheels: args.wheels.clone(),
            epoch: args.epoch,
            sort: args.sort,
        }),
        CommandGroupCli::Epoch(args) => ReproCommand::Epoch(EpochRequest {
            input: args.input.clone(),
        }),
    }
}

fn emit_output(cli: &ReproCli, group: CommandGroup, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = outcome.exit_code();
    let style = Style::new(cli.no_color, atty::is(Stream::Stdout));

    if cli.json {
        let payload = repro_core::to_json_response(group, outcome);
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if !cli.quiet || code != 0 {
        let message = repro_core::format_status_message(group, &outcome.message);
        println!("{}", style.status(outcome.status, &message));
        for line in detail_lines(&outcome.details) {
            println!("{}", style.dimmed(&line));
        }
        if let Some(hint) = hint_from_details(&outcome.details) {
            println!("{}", style.info(&format!("Hint: {hint}")));
        }
    }

    Ok(code)
}

fn hint_from_details(details: &Value) -> Option<&str> {
    details
        .as_object()
        .and_then(|map| map.get("hint"))
        .and_then(Value::as_str)
}

fn detail_lines(details: &Value) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(artifacts) = details.get("artifacts").and_then(Value::as_array) {
        for artifact in artifacts {
            if let (Some(path), Some(sha)) = (
                artifact.get("path").and_then(Value::as_str),
                artifact.get("sha256").and_then(Value::as_str),
            ) {
                lines.push(format!("  {sha}  {path}"));
            }
        }
    }
    if let Some(failed) = details.get("failed").and_then(Value::as_array) {
        for entry in failed {
            if let (Some(path), Some(error)) = (
                entry.get("path").and_then(Value::as_str),
                entry.get("error").and_then(Value::as_str),
            ) {
                lines.push(format!("  {path}: {error}"));
            }
        }
    }
    if let Some(stderr) = details.get("stderr").and_then(Value::as_str) {
        lines.extend(stderr.lines().map(|line| format!("  | {line}")));
    }
    lines
}
