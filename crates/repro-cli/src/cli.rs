use std::path::PathBuf;

use clap::{value_parser, ArgAction, Args, Parser, Subcommand};
use repro_core::Epoch;

pub const REPRODUCIBLY_BEFORE_HELP: &str = concat!(
    "reproducibly ",
    env!("CARGO_PKG_VERSION"),
    " – Reproducible Python sdists and wheels\n\n",
    "\x1b[1;36mCommands\x1b[0m\n",
    "  build            Build sdists from repositories and wheels from sdists.\n",
    "  cleanse          Rewrite existing sdists with canonical metadata.\n",
    "  normalize        Rewrite existing wheels with canonical metadata.\n",
    "  epoch            Print the timestamp an input would be stamped with.\n",
);

#[derive(Parser, Debug)]
#[command(
    name = "reproducibly",
    author,
    version,
    disable_help_subcommand = true,
    before_help = REPRODUCIBLY_BEFORE_HELP
)]
#[allow(clippy::struct_excessive_bools)]
pub struct ReproCli {
    #[arg(
        short,
        long,
        help = "Suppress human output on success",
        global = true
    )]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)", global = true)]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[arg(long, help = "Disable colored human output", global = true)]
    pub no_color: bool,
    #[command(subcommand)]
    pub command: CommandGroupCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandGroupCli {
    #[command(
        about = "Build reproducible sdists (from git repositories or source trees) and wheels (from sdists).",
        override_usage = "reproducibly build <INPUT>... <OUTDIR> [--sort-wheels]",
        after_help = "Examples:\n  reproducibly build . dist\n  reproducibly build dist/pkg-1.0.tar.gz wheelhouse\n"
    )]
    Build(BuildArgs),
    #[command(about = "Rewrite sdists in place with canonical metadata.")]
    Cleanse(CleanseArgs),
    #[command(about = "Rewrite wheels in place with canonical metadata.")]
    Normalize(NormalizeArgs),
    #[command(about = "Print the epoch derived for a repository, source tree or sdist.")]
    Epoch(EpochArgs),
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[arg(
        value_name = "INPUT",
        required = true,
        num_args = 1..,
        value_parser = value_parser!(PathBuf),
        help = "Git repository roots, Python source trees or .tar.gz sdists"
    )]
    pub inputs: Vec<PathBuf>,
    #[arg(
        value_name = "OUTDIR",
        value_parser = value_parser!(PathBuf),
        help = "Directory receiving the artifacts (created if missing)"
    )]
    pub output: PathBuf,
    #[arg(long, help = "Also reorder wheel members breadth-first")]
    pub sort_wheels: bool,
}

#[derive(Args, Debug)]
pub struct CleanseArgs {
    #[arg(value_name = "SDIST", required = true, num_args = 1.., value_parser = value_parser!(PathBuf))]
    pub sdists: Vec<PathBuf>,
    #[arg(
        long,
        value_name = "SECONDS",
        value_parser = parse_epoch,
        help = "Timestamp for every member (defaults to SOURCE_DATE_EPOCH, then 1980-01-01)"
    )]
    pub epoch: Option<Epoch>,
}

#[derive(Args, Debug)]
pub struct NormalizeArgs {
    #[arg(value_name = "WHEEL", required = true, num_args = 1.., value_parser = value_parser!(PathBuf))]
    pub wheels: Vec<PathBuf>,
    #[arg(
        long,
        value_name = "SECONDS",
        value_parser = parse_epoch,
        help = "Timestamp for every member (defaults to SOURCE_DATE_EPOCH, then 1980-01-01)"
    )]
    pub epoch: Option<Epoch>,
    #[arg(long, help = "Reorder members breadth-first with dist-info last")]
    pub sort: bool,
}

#[derive(Args, Debug)]
pub struct EpochArgs {
    #[arg(value_name = "INPUT", value_parser = value_parser!(PathBuf))]
    pub input: PathBuf,
}

fn parse_epoch(raw: &str) -> Result<Epoch, String> {
    Epoch::parse(raw).map_err(|_| format!("`{raw}` is not a number of seconds since 1970"))
}
