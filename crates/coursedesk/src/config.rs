//! Configuration loading from environment variables.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub port: u16,
    /// Recipient of contact form messages
    pub contact_to: String,
    /// How long a download waits for the user-name lookup
    pub lookup_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("coursedesk.db"),
            data_dir: PathBuf::from("data"),
            port: DEFAULT_PORT,
            contact_to: "admin@localhost".to_string(),
            lookup_timeout: Duration::from_secs(DEFAULT_LOOKUP_TIMEOUT_SECS),
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Reads a `.env` file if present, then the `COURSEDESK_*` variables.
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(db) = lookup("COURSEDESK_DB") {
            config.db_path = PathBuf::from(db);
        }
        if let Some(dir) = lookup("COURSEDESK_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup("COURSEDESK_PORT") {
            config.port = port
                .trim()
                .parse()
                .with_context(|| format!("COURSEDESK_PORT is not a valid port: {}", port))?;
        }
        if let Some(to) = lookup("COURSEDESK_CONTACT_TO") {
            config.contact_to = to;
        }
        if let Some(secs) = lookup("COURSEDESK_LOOKUP_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().with_context(|| {
                format!("COURSEDESK_LOOKUP_TIMEOUT_SECS is not a number: {}", secs)
            })?;
            config.lookup_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}
