use std::sync::Arc;

use tracing::info;

use courier_db::Database;
use courier_gateway::Gateway;
use courier_server::build_app;
use courier_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    let db = Arc::new(Database::open(&config.db_path)?);
    let gateway = Gateway::new(db, &config.jwt_secret);

    let addr = config.addr()?;
    let app = build_app(gateway, config.jwt_secret, config.token_ttl);

    info!("Courier listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
