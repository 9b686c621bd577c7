use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use tracing::warn;

const PLACEHOLDER_SECRET: &str = "dev-secret-change-me";

/// Runtime settings, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("COURIER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = std::env::var("COURIER_PORT")
            .unwrap_or_else(|_| "8000".into())
            .parse()
            .context("COURIER_PORT must be a port number")?;
        let db_path = PathBuf::from(
            std::env::var("COURIER_DB_PATH").unwrap_or_else(|_| "courier.db".into()),
        );

        let jwt_secret =
            std::env::var("COURIER_JWT_SECRET").unwrap_or_else(|_| PLACEHOLDER_SECRET.into());
        if jwt_secret == PLACEHOLDER_SECRET {
            warn!("COURIER_JWT_SECRET is unset; using the development placeholder");
        }

        let ttl_minutes: i64 = std::env::var("COURIER_TOKEN_TTL_MINUTES")
            .unwrap_or_else(|_| "10080".into())
            .parse()
            .context("COURIER_TOKEN_TTL_MINUTES must be a whole number of minutes")?;
        if ttl_minutes <= 0 {
            anyhow::bail!("COURIER_TOKEN_TTL_MINUTES must be positive");
        }

        Ok(Self {
            host,
            port,
            db_path,
            jwt_secret,
            token_ttl: chrono::Duration::minutes(ttl_minutes),
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}
