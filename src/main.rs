//! MCPist - trust and credential services
//!
//! `mcpist edge` runs the public gateway, `mcpist backend` the API behind it.

use std::process::ExitCode;

use base64::{Engine, engine::general_purpose::STANDARD};
use clap::Parser;
use tracing::{error, info};

use mcpist::{
    backend::BackendServer,
    cipher::generate_key,
    cli::{Cli, Command},
    config::Config,
    edge::EdgeServer,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Command::Keygen => run_keygen(),
        Command::Edge { port } => {
            let Some(mut config) = load_config(&cli) else {
                return ExitCode::FAILURE;
            };
            if let Some(port) = port {
                config.edge.port = port;
            }
            run_edge(&config).await
        }
        Command::Backend { port } => {
            let Some(mut config) = load_config(&cli) else {
                return ExitCode::FAILURE;
            };
            if let Some(port) = port {
                config.backend.port = port;
            }
            run_backend(&config).await
        }
    }
}

fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(config) => Some(config),
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Print one fresh value per secret, in env-file form
fn run_keygen() -> ExitCode {
    for var in [
        "MCPIST_BACKEND__ENCRYPTION_KEY",
        "MCPIST_BACKEND__STATE_SECRET",
        "MCPIST_BACKEND__APIKEY_SEED",
        "MCPIST_EDGE__SIGNING_SEED",
    ] {
        println!("{var}={}", STANDARD.encode(generate_key()));
    }
    let internal = STANDARD.encode(generate_key());
    println!("MCPIST_EDGE__INTERNAL_SECRET={internal}");
    println!("MCPIST_BACKEND__INTERNAL_SECRET={internal}");
    ExitCode::SUCCESS
}

async fn run_edge(config: &Config) -> ExitCode {
    info!(version = env!("CARGO_PKG_VERSION"), port = config.edge.port, "Starting MCPist edge");

    let server = match EdgeServer::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create edge: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Edge error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run_backend(config: &Config) -> ExitCode {
    info!(version = env!("CARGO_PKG_VERSION"), port = config.backend.port, "Starting MCPist backend");

    let server = match BackendServer::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create backend: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Backend error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
