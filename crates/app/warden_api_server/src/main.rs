//! Warden API server binary.
//!
//! Reads `WARDEN_*` settings from the environment (and `.env`), builds every
//! core object once, and serves the HTTP API until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warden_core::auth::jwt::TokenIssuer;
use warden_core::auth::keys::KeyProvider;
use warden_core::auth::password::PasswordHasher;
use warden_core::auth::queries::{PgCredentialStore, PgVersionChainStore};
use warden_core::auth::rotation::TokenRotation;
use warden_core::auth::service::AuthService;
use warden_core::auth::store::{
    CredentialStore, MemoryCredentialStore, MemoryVersionChainStore, VersionChainStore,
};
use warden_core::config::Settings;
use warden_core::rate_limit::RateLimiter;

/// CLI arguments for the API server.
#[derive(Parser, Debug)]
#[command(name = "warden_api_server", about = "Warden credential and token service")]
struct Args {
    /// Address to bind.
    #[arg(long, env = "WARDEN_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on (0 = ephemeral).
    #[arg(long, env = "WARDEN_PORT", default_value_t = 8080)]
    port: u16,

    /// PostgreSQL connection URL.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost:5432/warden"
    )]
    database_url: String,

    /// Maximum number of database connections in the pool.
    #[arg(long, default_value_t = 5)]
    max_connections: u32,

    /// Keep credentials and refresh tokens in memory instead of PostgreSQL.
    ///
    /// Everything is lost on exit. Development only.
    #[arg(long, default_value_t = false)]
    in_memory: bool,
}

type Stores = (Arc<dyn VersionChainStore>, Arc<dyn CredentialStore>);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("info,warden_api=debug,warden_core=debug")
                }),
        )
        .init();

    let args = Args::parse();
    info!(port = args.port, in_memory = args.in_memory, "starting warden_api_server");

    let settings = Settings::from_env()?;
    let keys = Arc::new(KeyProvider::from_settings(&settings.signing)?);

    let (chain, credentials): Stores = if args.in_memory {
        warn!("using in-memory stores; all state is lost on exit");
        (
            Arc::new(MemoryVersionChainStore::new()),
            Arc::new(MemoryCredentialStore::new()),
        )
    } else {
        info!(max_connections = args.max_connections, "configuring connection pool");
        let pool = PgPoolOptions::new()
            .max_connections(args.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(&args.database_url)
            .await?;

        info!("running database migrations");
        warden_core::migrate::migrate(&pool).await?;
        (
            Arc::new(PgVersionChainStore::new(pool.clone())),
            Arc::new(PgCredentialStore::new(pool)),
        )
    };

    let shutdown = CancellationToken::new();
    let rotation = TokenRotation::new(TokenIssuer::new(keys), chain);
    let auth = AuthService::new(PasswordHasher::new(settings.hasher), credentials, rotation);
    let (limiter, sweeper) = RateLimiter::start(settings.rate_limit, shutdown.clone());

    let app = warden_api::router(warden_api::AppState {
        auth: Arc::new(auth),
        limiter,
    });

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port)).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "REST API listening");

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                return;
            }
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let serve_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    })
    .await;

    // Stop the sweep even when serving failed.
    shutdown.cancel();
    sweeper.await?;

    serve_result?;
    info!("server stopped");
    Ok(())
}
