use crate::error::Result;
use async_trait::async_trait;
use ingest_protocol::{AppendVersion, CreateEntity, EntityVersion, RelationsUpdated, UpdateRelations};

/// Content-addressed, append-only entity service.
///
/// `append_version` and `update_relations` fail with [`StoreError::Conflict`]
/// when `expect_tip` no longer matches the entity's current tip.
///
/// [`StoreError::Conflict`]: crate::StoreError::Conflict
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Store `text` as a content object and return its content address.
    async fn upload_content(&self, text: &str, filename: Option<&str>) -> Result<String>;

    async fn create_entity(&self, request: CreateEntity) -> Result<EntityVersion>;

    async fn append_version(&self, request: AppendVersion) -> Result<EntityVersion>;

    async fn get_tip(&self, id: &str) -> Result<String>;

    async fn update_relations(&self, request: UpdateRelations) -> Result<RelationsUpdated>;
}

/// Read-only access to raw uploaded bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// `Ok(None)` when nothing is stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}
