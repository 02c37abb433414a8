mod cli;
mod config;
mod error;
mod handlers;
mod listing;
mod models;
mod paths;
mod server;
mod storage;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;
use crate::config::{Config, ConfigLayer};
use crate::error::ServerError;
use crate::listing::{HtmlListing, PageRenderer};
use crate::server::Server;
use crate::storage::{human_readable_size, Storage};

pub struct AppState {
    pub storage: Storage,
    pub config: Config,
    pub renderer: Arc<dyn PageRenderer>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dirhost=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match Config::resolve(ConfigLayer::defaults(), cli.config.as_deref(), cli.overrides()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Work directory: {}", config.work_dir.display());
    tracing::info!(
        "Max upload size: {}, naming: {:?}",
        human_readable_size(config.max_upload_size),
        config.file_naming_strategy
    );
    if config.auth_enabled() {
        tracing::warn!("Auth is enabled but no authenticator is configured; requests are not checked");
    }
    if config.cors_enabled() {
        tracing::info!("CORS: permissive");
    }

    let server = Server::new(config, Arc::new(HtmlListing));
    let mut lifecycle = server.lifecycle();
    tokio::spawn(async move {
        while lifecycle.changed().await.is_ok() {
            let state = *lifecycle.borrow_and_update();
            tracing::debug!(?state, "lifecycle transition");
        }
    });
    let listening = match server.bind().await {
        Ok(listening) => listening,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    println!(
        r#"
    Dirhost is serving
      Browse:  http://{addr}/browse
      API:     http://{addr}/api/files
    "#,
        addr = listening.local_addr()
    );

    match listening.run_until(server::shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ ServerError::ShutdownTimeout(_)) => {
            tracing::warn!("{}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
