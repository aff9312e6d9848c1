//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// MCPist trust and credential services
#[derive(Parser, Debug)]
#[command(name = "mcpist")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCPIST_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MCPIST_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCPIST_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the public edge gateway
    Edge {
        /// Port to listen on (overrides `edge.port`)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run the backend API
    Backend {
        /// Port to listen on (overrides `backend.port`)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print fresh base64 secrets for a new deployment
    Keygen,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands_and_globals() {
        let cli = Cli::try_parse_from(["mcpist", "edge", "--port", "9000", "--log-format", "json"]).unwrap();
        assert!(matches!(cli.command, Command::Edge { port: Some(9000) }));
        assert_eq!(cli.log_format.as_deref(), Some("json"));
        assert_eq!(cli.log_level, "info");

        let cli = Cli::try_parse_from(["mcpist", "--config", "mcpist.yaml", "keygen"]).unwrap();
        assert!(matches!(cli.command, Command::Keygen));
        assert_eq!(cli.config, Some(PathBuf::from("mcpist.yaml")));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["mcpist"]).is_err());
    }
}
