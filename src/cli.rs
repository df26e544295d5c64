//! Command-line interface for medvoice
//!
//! Provides argument parsing using clap derive macros.

use crate::agent::Agent;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Voice assistant session for a medical office
#[derive(Parser, Debug)]
#[command(
    name = "medvoice",
    version,
    about = "Voice assistant session for a medical office"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Path to Unix socket (default: $XDG_RUNTIME_DIR/medvoice.sock)
    #[arg(long, global = true, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the session daemon in the foreground
    Daemon,

    /// Connect the session to the assistant backend
    Connect {
        /// Bearer token for the backend
        #[arg(long, env = "MEDVOICE_TOKEN", hide_env_values = true)]
        token: String,
    },

    /// Disconnect and release the microphone
    Disconnect,

    /// Acknowledge a connection error so the session can reconnect
    Ack,

    /// Start a push-to-talk turn
    Listen,

    /// Finish the current push-to-talk turn
    Stop,

    /// Send a typed message to the active agent
    Say {
        /// Message text
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Ask the backend to hand the conversation to another agent
    Transfer {
        /// Target agent (triage, support, billing)
        agent: Agent,
    },

    /// Show session status
    Status,

    /// Print the conversation log
    History {
        /// Only entries with an id greater than this
        #[arg(long, default_value = "0")]
        since: u64,
    },

    /// Follow the conversation as it happens
    Follow {
        /// Replay entries with an id greater than this first
        #[arg(long, default_value = "0")]
        since: u64,
    },

    /// Stop the daemon
    Shutdown,

    /// List available audio input devices
    Devices,

    /// List the agents a conversation can be routed to
    Agents,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_with_token() {
        let cli = Cli::try_parse_from(["medvoice", "connect", "--token", "abc"]).unwrap();
        match cli.command {
            Commands::Connect { token } => assert_eq!(token, "abc"),
            _ => panic!("Expected Connect command"),
        }
    }

    #[test]
    fn test_parse_say_joins_words() {
        let cli = Cli::try_parse_from(["medvoice", "say", "book", "an", "appointment"]).unwrap();
        match cli.command {
            Commands::Say { text } => assert_eq!(text.join(" "), "book an appointment"),
            _ => panic!("Expected Say command"),
        }
    }

    #[test]
    fn test_parse_say_requires_text() {
        assert!(Cli::try_parse_from(["medvoice", "say"]).is_err());
    }

    #[test]
    fn test_parse_transfer_agent() {
        let cli = Cli::try_parse_from(["medvoice", "transfer", "billing"]).unwrap();
        match cli.command {
            Commands::Transfer { agent } => assert_eq!(agent, Agent::Billing),
            _ => panic!("Expected Transfer command"),
        }
    }

    #[test]
    fn test_parse_transfer_unknown_agent_fails() {
        assert!(Cli::try_parse_from(["medvoice", "transfer", "radiology"]).is_err());
    }

    #[test]
    fn test_parse_history_since() {
        let cli = Cli::try_parse_from(["medvoice", "history", "--since", "5"]).unwrap();
        match cli.command {
            Commands::History { since } => assert_eq!(since, 5),
            _ => panic!("Expected History command"),
        }
    }

    #[test]
    fn test_parse_follow_defaults() {
        let cli = Cli::try_parse_from(["medvoice", "follow"]).unwrap();
        match cli.command {
            Commands::Follow { since } => assert_eq!(since, 0),
            _ => panic!("Expected Follow command"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "medvoice",
            "status",
            "--socket",
            "/tmp/test.sock",
            "-vv",
            "--config",
            "/tmp/config.toml",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Status));
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/test.sock")));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/config.toml")));
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_parse_simple_commands() {
        for (arg, check) in [
            ("daemon", (|c| matches!(c, Commands::Daemon)) as fn(&Commands) -> bool),
            ("disconnect", |c| matches!(c, Commands::Disconnect)),
            ("ack", |c| matches!(c, Commands::Ack)),
            ("listen", |c| matches!(c, Commands::Listen)),
            ("stop", |c| matches!(c, Commands::Stop)),
            ("shutdown", |c| matches!(c, Commands::Shutdown)),
            ("devices", |c| matches!(c, Commands::Devices)),
            ("agents", |c| matches!(c, Commands::Agents)),
        ] {
            let cli = Cli::try_parse_from(["medvoice", arg]).unwrap();
            assert!(check(&cli.command), "wrong command parsed for {}", arg);
        }
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["medvoice"]).is_err());
    }
}
