//! CLI argument parsing and command routing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// agent-relay: streaming agent responses as clean Server-Sent Events
#[derive(Debug, Parser)]
#[command(name = "agent-relay")]
#[command(about = "Normalizes streamed agent JSON into Server-Sent Events", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP relay (default)
    Serve {
        /// Address to listen on, e.g. 127.0.0.1:8080
        #[arg(long)]
        listen: Option<String>,

        /// Upstream agent endpoint URL
        #[arg(long)]
        upstream: Option<String>,
    },

    /// Normalize a recorded upstream body and print the frames
    Replay {
        /// Recorded response body; reads stdin when omitted
        path: Option<PathBuf>,

        /// Feed the input in chunks of this many bytes
        #[arg(long, default_value_t = 64)]
        chunk_size: usize,

        /// Print the final answer text after the frames
        #[arg(long)]
        final_text: bool,
    },

    /// Print the effective configuration
    Config,

    /// Show version information
    Version,
}

impl Default for Commands {
    fn default() -> Self {
        Self::Serve {
            listen: None,
            upstream: None,
        }
    }
}

impl Cli {
    /// Parse CLI arguments from environment
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_command_defaults_to_serve() {
        let cli = Cli::try_parse_from(["agent-relay"]).unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(
            cli.command.unwrap_or_default(),
            Commands::Serve { listen: None, upstream: None }
        ));
    }

    #[test]
    fn test_replay_args() {
        let cli = Cli::try_parse_from([
            "agent-relay",
            "-v",
            "replay",
            "capture.ndjson",
            "--chunk-size",
            "7",
            "--final-text",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Some(Commands::Replay {
                path,
                chunk_size,
                final_text,
            }) => {
                assert_eq!(path, Some(PathBuf::from("capture.ndjson")));
                assert_eq!(chunk_size, 7);
                assert!(final_text);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from([
            "agent-relay",
            "serve",
            "--listen",
            "0.0.0.0:9000",
            "--upstream",
            "http://agent/run_sse",
        ])
        .unwrap();

        assert!(matches!(
            cli.command,
            Some(Commands::Serve { listen: Some(ref l), upstream: Some(_) }) if l == "0.0.0.0:9000"
        ));
    }
}
