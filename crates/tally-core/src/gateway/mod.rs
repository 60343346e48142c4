mod file;
mod memory;

use async_trait::async_trait;
use serde_json::Value;

pub use file::FileGateway;
pub use memory::{Call, Fault, MemoryGateway, Op};

use crate::entity::{Entity, EntityKind};

#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Stores a new entity. The entity still carries its temporary identity;
    /// `Ok(Some(id))` means the remote assigned its own, `Ok(None)` that it
    /// adopted the temporary one.
    async fn create(&self, entity: &Entity) -> anyhow::Result<Option<String>>;

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        field: &str,
        value: &Value,
    ) -> anyhow::Result<()>;

    async fn delete(&self, kind: EntityKind, id: &str) -> anyhow::Result<()>;

    async fn persist_tag_set(&self, tags: &[String]) -> anyhow::Result<()>;

    async fn fetch_all(&self, kind: EntityKind) -> anyhow::Result<Vec<Entity>>;

    async fn fetch_tags(&self) -> anyhow::Result<Vec<String>>;
}
