//! Passkey Server - WebAuthn demo server

use anyhow::Context;
use clap::{Parser, Subcommand};
use passkey_server::{AppContext, ServerConfig, StoreKind};
use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the ceremony API and the browser client (default)
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Storage backend
        #[arg(short, long, value_enum)]
        store: Option<StoreKind>,

        /// Database URL for the sqlite store
        #[arg(long)]
        database_url: Option<String>,
    },

    /// Print the effective configuration and exit
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("passkey_server=debug,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ServerConfig::from_env().unwrap_or_else(|e| {
        error!("Failed to load config: {}", e);
        info!("Using default configuration");
        ServerConfig::default()
    });

    match cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
        store: None,
        database_url: None,
    }) {
        Commands::Serve {
            host,
            port,
            store,
            database_url,
        } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(store) = store {
                config.store = store;
            }
            if let Some(url) = database_url {
                config.database_url = url;
            }
            serve(config).await?;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    info!(
        "RP id {} ({}), expected origin {}",
        config.webauthn.rp_id, config.webauthn.rp_name, config.webauthn.rp_origin
    );
    info!("Using {:?} store", config.store);

    let addr = config.bind_addr();
    let context = AppContext::new(config)
        .await
        .context("failed to initialize application")?;

    let app = passkey_server::web::create_router(context);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!("Server is listening at http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
