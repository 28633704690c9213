//! Outbox storage configuration.

use serde::Deserialize;

/// SQLite database holding the outbox table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path. Created on first connect.
    pub path: String,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "data/courier.db".to_string(),
            max_connections: 5,
        }
    }
}

impl StorageConfig {
    /// sqlx connection URL for `path`, creating the file if missing.
    pub fn url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.path)
    }
}
