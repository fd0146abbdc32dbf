//! Command-line interface.

mod check;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use check::run_check_config;

#[derive(Parser, Debug)]
#[command(
    name = "registry-provisioner",
    version,
    about = "Provisioning orchestrator for identity, claim and compliance registry suites"
)]
pub struct Cli {
    /// TOML config file (defaults to ~/.registry-provisioner/config.toml).
    #[arg(long, global = true, env = "PROVISIONER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP gateway (default).
    Serve {
        /// Keep the ledger in memory; nothing survives a restart.
        #[arg(long)]
        ephemeral: bool,
    },
    /// Print the registry rebuilt from the ledger as JSON.
    Snapshot,
    /// Validate configuration and probe the ledger, RPC endpoint and port.
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_is_optional_and_flags_parse() {
        let cli = Cli::try_parse_from(["registry-provisioner"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from([
            "registry-provisioner",
            "serve",
            "--ephemeral",
            "--config",
            "/tmp/p.toml",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Command::Serve { ephemeral: true })));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/p.toml")));

        let cli = Cli::try_parse_from(["registry-provisioner", "check-config"]).unwrap();
        assert!(matches!(cli.command, Some(Command::CheckConfig)));
    }
}
