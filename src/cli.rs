//! Command-line interface (clap derive)

use clap::{ArgAction, Args, Parser, Subcommand};

/// Hydra Agent - gateway relay for the Hydra Gate coordinator
///
/// Keeps a Socket.IO channel open to the coordinator, registers itself,
/// and relays every work request it receives to the configured target
/// service over HTTP.
#[derive(Parser, Debug)]
#[command(name = "hydra-agent", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub output: OutputArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Log verbosity flags shared by every subcommand
#[derive(Args, Debug, Clone, Copy)]
pub struct OutputArgs {
    /// More log output; repeat for trace
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// A configuration file chosen on the command line
#[derive(Args, Debug, Clone)]
pub struct ConfigFile {
    /// Configuration file; the search path is used when omitted
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to the coordinator and relay work until interrupted
    Run {
        /// Configuration file; the search path is used when omitted
        #[arg(short, long, value_name = "FILE", env = "HYDRA_CONFIG")]
        config: Option<String>,
    },

    /// Print build and protocol information
    Version,

    /// Inspect or create configuration files
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Print the effective configuration with overrides applied
    Show(ConfigFile),

    /// Write a commented default configuration
    Init {
        /// Destination (default: ~/.hydra/agent.toml)
        #[arg(short, long, value_name = "FILE")]
        path: Option<String>,

        /// Replace an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Load a configuration and report the first invalid field
    Validate(ConfigFile),
}
