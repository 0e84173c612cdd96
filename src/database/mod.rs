pub mod connection;
pub mod operations;

use async_trait::async_trait;

use crate::models::SessionRecord;

pub use operations::{create_sessions_table, store_session_record};

/// Destination for finished, valid monitoring sessions
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn store_session(&self, record: &SessionRecord) -> Result<(), String>;
}

/// Session store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PostgresStore {
    database_url: String,
}

impl PostgresStore {
    pub fn new(database_url: &str) -> Self {
        PostgresStore {
            database_url: database_url.to_string(),
        }
    }

    /// Make sure the results table exists
    pub async fn prepare(&self) -> Result<(), String> {
        create_sessions_table(&self.database_url).await
    }
}

#[async_trait]
impl SessionStore for PostgresStore {
    async fn store_session(&self, record: &SessionRecord) -> Result<(), String> {
        store_session_record(record, &self.database_url).await
    }
}
