//! # CLI Interface
//!
//! Defines the command-line argument structure for `tokenflow-node` using
//! `clap` derive. Supports three subcommands: `run`, `simulate` and
//! `version`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Tokenflow party node.
///
/// Hosts one party of the token transaction protocol: answers recipient,
/// action, endorsement, audit and withdrawal requests, and exposes
/// Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "tokenflow-node",
    about = "Tokenflow party node",
    version,
    propagate_version = true
)]
pub struct TokenflowCli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogArg::Pretty)]
    pub log_format: LogArg,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// `--log-format` values.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogArg {
    Pretty,
    Json,
}

impl From<LogArg> for LogFormat {
    fn from(arg: LogArg) -> Self {
        match arg {
            LogArg::Pretty => LogFormat::Pretty,
            LogArg::Json => LogFormat::Json,
        }
    }
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a party and serve its inbox until interrupted.
    Run(RunArgs),
    /// Run an in-process issue and transfer scenario and print the outcome.
    Simulate(SimulateArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to a JSON node configuration file.
    #[arg(long, short = 'c', env = "TOKENFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory of the persistent status store. In-memory when omitted.
    #[arg(long, short = 'd', env = "TOKENFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Name of the party's default wallet.
    #[arg(long, default_value = "default")]
    pub wallet: String,

    /// Host this party's auditor service.
    #[arg(long)]
    pub auditor: bool,

    /// Port for the metrics and status endpoint.
    #[arg(long, env = "TOKENFLOW_METRICS_PORT", default_value_t = 9742)]
    pub metrics_port: u16,
}

/// Arguments for the `simulate` subcommand.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Path to a JSON node configuration file.
    #[arg(long, short = 'c', env = "TOKENFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Amount issued to each sender.
    #[arg(long, default_value_t = 100)]
    pub issue: u64,

    /// Amount each sender pays the recipient.
    #[arg(long, default_value_t = 25)]
    pub pay: u64,

    /// Token type.
    #[arg(long, default_value = "USD")]
    pub token_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        TokenflowCli::command().debug_assert();
    }

    #[test]
    fn log_format_is_global() {
        let cli = TokenflowCli::try_parse_from(["tokenflow-node", "simulate", "--log-format", "json"])
            .unwrap();
        assert_eq!(cli.log_format, LogArg::Json);
        assert!(matches!(cli.command, Commands::Simulate(_)));
    }

    #[test]
    fn run_defaults() {
        let cli = TokenflowCli::try_parse_from(["tokenflow-node", "run"]).unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.wallet, "default");
                assert!(!args.auditor);
                assert_eq!(args.metrics_port, 9742);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
