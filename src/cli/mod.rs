//! CLI module for attrindex
//!
//! Provides command-line interface for:
//! - replay: Apply a JSON mutation script and report the index state
//! - restore: Rebuild an index from exported storage parts

mod args;
mod commands;
mod errors;
mod io;
mod script;

pub use args::{Cli, Command};
pub use commands::{load_config, replay, report, restore, run, run_command, run_script, OperationFailure, Replay};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{read_parts, write_error, write_parts, write_response};
pub use script::{AttributeDecl, CompoundDecl, Operation, Script, TransactionMode};
