//! [`WorkspaceStorage`] backed by the shared SQLite database.

use std::collections::BTreeMap;

use async_trait::async_trait;
use graphsync_core::db;
use graphsync_core::types::{BannerKey, ColumnConfig, ColumnName, HiddenRef};
use tokio_rusqlite::Connection;

use crate::provider::{ProviderError, WorkspaceStorage};

/// Workspace state stored through `graphsync_core::db`.
///
/// `tokio_rusqlite::Connection` is a cheap handle onto a single background
/// connection thread, so calls are serialized in arrival order.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Opens (or creates) the database at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Storage`] if the file cannot be opened or the
    /// schema cannot be applied.
    pub async fn open(path: &str) -> Result<Self, ProviderError> {
        Ok(Self::new(db::open_db(path).await?))
    }
}

#[async_trait]
impl WorkspaceStorage for SqliteStorage {
    async fn load_hidden_refs(&self) -> Result<BTreeMap<String, HiddenRef>, ProviderError> {
        Ok(db::load_hidden_refs(&self.conn).await?)
    }

    async fn update_hidden_refs(&self, refs: Vec<HiddenRef>, visible: bool) -> Result<(), ProviderError> {
        Ok(db::update_hidden_refs(&self.conn, refs, visible).await?)
    }

    async fn load_columns(&self) -> Result<BTreeMap<ColumnName, ColumnConfig>, ProviderError> {
        Ok(db::load_columns(&self.conn).await?)
    }

    async fn save_column(&self, name: ColumnName, config: ColumnConfig) -> Result<(), ProviderError> {
        Ok(db::save_column(&self.conn, name, config).await?)
    }

    async fn load_dismissed_banners(&self) -> Result<Vec<BannerKey>, ProviderError> {
        Ok(db::load_dismissed_banners(&self.conn).await?)
    }

    async fn dismiss_banner(&self, key: BannerKey) -> Result<(), ProviderError> {
        Ok(db::dismiss_banner(&self.conn, key).await?)
    }
}
