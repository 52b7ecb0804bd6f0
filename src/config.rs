//! Runtime configuration from environment variables.

use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub database_path: PathBuf,
    pub cors_origin: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let port = std::env::var("DEVSYNC_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let database_path = std::env::var("DEVSYNC_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("devsync").join("devsync.db"));

        let cors_origin = std::env::var("DEVSYNC_CORS_ORIGIN").ok();

        Self {
            port,
            database_path,
            cors_origin,
        }
    }
}
