//! Command-line interface definition

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "subdwh-server")]
#[command(author, version, about = "Substreams package processing and warehouse load pipelines")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run both schedules until interrupted (default)
    Run,

    /// List packages and print the processing requests as JSON
    Discover,

    /// Process one package now
    Process {
        /// Package key in the package bucket, e.g. spkgs/uniswap.spkg
        package_key: String,
    },

    /// Run one upload tick and load whatever it finds
    UploadTick {
        /// Print the tick outcome without loading (the cursor still advances)
        #[arg(long)]
        dry_run: bool,
    },

    /// Load specific output files, ignoring the cursor
    Load {
        /// Output file keys in the data bucket
        #[arg(required = true)]
        file_keys: Vec<String>,
    },

    /// Inspect or repair upload state
    State {
        #[command(subcommand)]
        command: StateCommand,
    },

    /// List every output file still awaiting upload
    Pending,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum StateCommand {
    /// Print a file's upload state
    Get { file_key: String },

    /// Mark loaded files as uploaded without reloading them
    MarkUploaded {
        #[arg(required = true)]
        file_keys: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_no_subcommand() {
        let cli = Cli::try_parse_from(["subdwh-server"]).unwrap();
        assert_eq!(cli.command, None);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_parses_state_repair() {
        let cli = Cli::try_parse_from([
            "subdwh-server",
            "state",
            "mark-uploaded",
            "substreams/a.parquet",
            "substreams/b.parquet",
        ])
        .unwrap();

        assert_eq!(
            cli.command,
            Some(Commands::State {
                command: StateCommand::MarkUploaded {
                    file_keys: vec![
                        "substreams/a.parquet".to_string(),
                        "substreams/b.parquet".to_string()
                    ],
                },
            })
        );
    }

    #[test]
    fn test_load_requires_keys() {
        assert!(Cli::try_parse_from(["subdwh-server", "load"]).is_err());
    }

    #[test]
    fn test_upload_tick_dry_run_flag() {
        let cli = Cli::try_parse_from(["subdwh-server", "upload-tick", "--dry-run", "-v"]).unwrap();
        assert_eq!(cli.command, Some(Commands::UploadTick { dry_run: true }));
        assert!(cli.verbose);
    }
}
