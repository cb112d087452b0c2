// Sync server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Core server configuration.
///
/// Constructed via [`SyncConfig::from_env`], which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Directory holding one snapshot file per document.
    pub persist_dir: PathBuf,
    /// Path of the SQLite auth database (users, sessions, grants).
    pub auth_db_path: PathBuf,
    /// Usernames that bypass per-document grants, lowercased.
    pub superusers: Vec<String>,
    /// Log filter directive (e.g. `info`, `fabula_server=debug`).
    pub log_filter: String,
}

impl SyncConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `FABULA_SYNC_HOST` | `0.0.0.0` |
    /// | `FABULA_SYNC_PORT` | `1234` |
    /// | `FABULA_SYNC_PERSIST_DIR` | `./fabula-data/docs` |
    /// | `FABULA_SYNC_AUTH_DB` | `./fabula-data/auth.db` |
    /// | `FABULA_SYNC_SUPERUSERS` | *(empty)* |
    /// | `FABULA_SYNC_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("FABULA_SYNC_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("FABULA_SYNC_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1234);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let persist_dir = env("FABULA_SYNC_PERSIST_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./fabula-data/docs"));

        let auth_db_path = env("FABULA_SYNC_AUTH_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./fabula-data/auth.db"));

        let superusers = env("FABULA_SYNC_SUPERUSERS")
            .map(|raw| parse_superusers(&raw))
            .unwrap_or_default();

        let log_filter = env("FABULA_SYNC_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self { listen_addr, persist_dir, auth_db_path, superusers, log_filter }
    }
}

/// Comma-separated usernames, trimmed and lowercased; empty entries dropped.
fn parse_superusers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}
