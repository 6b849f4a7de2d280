#![warn(clippy::dbg_macro, clippy::todo)]

mod config;
mod gating;
mod lookup;
mod mutator;
mod resolv;
mod webhook;

use clap::Parser;
use config::Args;
use kube::core::admission::SerializePatchError;
use log::{error, info};
use lookup::SystemResolver;
use mutator::GatewayMutator;
use resolv::HostResolver;
use std::{path::PathBuf, sync::Arc, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),
    #[error("Failed to resolve '{name}': {reason}")]
    Resolution { name: String, reason: String },
    #[error("Invalid boolean value '{value}' for '{key}'")]
    ValueParse { key: String, value: String },
    #[error("Failed to open '{}': {source}", .path.display())]
    FileAccess {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Mutation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Failed to serialize patch: {0}")]
    PatchError(#[from] SerializePatchError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if let Err(e) = args.validate() {
        error!("{e}");
        std::process::exit(1);
    }

    let host = match HostResolver::load(&args.resolv_conf) {
        Ok(x) => x,
        Err(e) => {
            error!("failed to read host resolver config: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "loaded {} nameservers and {} search domains from {}",
        host.nameservers.len(),
        host.search.len(),
        args.resolv_conf.display()
    );

    let mutator = match tokio::time::timeout(
        args.mutation_timeout,
        GatewayMutator::new(Arc::new(args.mutator.clone()), host, Arc::new(SystemResolver)),
    )
    .await
    {
        Ok(Ok(x)) => x,
        Ok(Err(e)) => {
            error!("failed to create gateway mutator: {e}");
            std::process::exit(1);
        }
        Err(_) => {
            error!(
                "failed to create gateway mutator: {}",
                Error::Timeout(args.mutation_timeout)
            );
            std::process::exit(1);
        }
    };

    if let Err(e) = webhook::run_webhook(&args, Arc::new(mutator)).await {
        error!("webhook failed to run: {e}");
        std::process::exit(1);
    }
    error!("webhook terminated");
}
