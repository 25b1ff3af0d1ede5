mod db;
mod elastic;

pub use db::{default_data_dir, SqliteStore};
pub use elastic::ElasticStore;

use async_trait::async_trait;

use crate::errors::SyncResult;
use crate::types::{Category, EmailDocument};

/// Searchable document store. `index` must upsert by `EmailDocument::id`,
/// which is what makes reprocessing a message converge on one record.
#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn index(&self, doc: &EmailDocument) -> SyncResult<()>;

    /// Partial update of `aiCategory` only. A missing id is logged, not an error.
    async fn update_category(&self, id: &str, category: Category) -> SyncResult<()>;

    async fn search(
        &self,
        query: &str,
        account_id: &str,
        folder: Option<&str>,
    ) -> SyncResult<Vec<EmailDocument>>;

    async fn list_all(&self, account_id: &str, folder: Option<&str>)
        -> SyncResult<Vec<EmailDocument>>;

    async fn get_by_id(&self, id: &str) -> SyncResult<Option<EmailDocument>>;
}
