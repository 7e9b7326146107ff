#![deny(clippy::all, warnings)]
//! Reproducible builds of Python source distributions and wheels.
//!
//! Artifacts are produced by the standard build frontends and then rewritten
//! so that identical inputs yield byte-identical archives.

pub mod archive;
pub mod build;
mod commands;
mod config;
pub mod digest;
pub mod epoch;
pub mod inputs;
mod outcome;
pub(crate) mod process;

pub use crate::commands::{
    cleanse, execute, format_status_message, normalize, reproduce, show_epoch, to_json_response,
    CleanseRequest, CommandContext, CommandGroup, EpochRequest, NormalizeRequest, ReproCommand,
    ReproduceRequest,
};
pub use crate::config::{BuildConfig, Config};
pub use crate::epoch::{Epoch, EARLIEST};
pub use crate::outcome::{CommandStatus, ExecutionOutcome, ReproError};
pub use crate::process::RunOutput;

pub const REPRODUCIBLY_VERSION: &str = env!("CARGO_PKG_VERSION");
