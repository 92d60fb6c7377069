//! CLI argument definitions using clap
//!
//! Commands:
//! - attrindex replay --script <path> [--config <path>] [--export <path>]
//! - attrindex restore --parts <path> [--config <path>]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// attrindex - transactional attribute indexes
#[derive(Parser, Debug)]
#[command(name = "attrindex")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay a JSON mutation script and print the resulting index state
    Replay {
        /// Path to the mutation script
        #[arg(long)]
        script: PathBuf,

        /// Path to the index configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write the dirty storage parts as JSON lines to this file
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Rebuild an index from exported storage parts and print its state
    Restore {
        /// JSON lines file written by `replay --export`
        #[arg(long)]
        parts: PathBuf,

        /// Path to the index configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_replay() {
        let cli = Cli::try_parse_from([
            "attrindex",
            "replay",
            "--script",
            "ops.json",
            "--config",
            "index.json",
        ])
        .unwrap();
        match cli.command {
            Command::Replay {
                script,
                config,
                export,
            } => {
                assert_eq!(script, PathBuf::from("ops.json"));
                assert_eq!(config, Some(PathBuf::from("index.json")));
                assert!(export.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_replay_requires_script() {
        assert!(Cli::try_parse_from(["attrindex", "replay"]).is_err());
    }
}
