use std::fmt;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, instrument};

use super::RemoteGateway;
use crate::entity::{Entity, EntityId, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Update,
    Delete,
    PersistTags,
    FetchAll,
    FetchTags,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Create => "create",
            Op::Update => "update",
            Op::Delete => "delete",
            Op::PersistTags => "persist_tag_set",
            Op::FetchAll => "fetch_all",
            Op::FetchTags => "fetch_tags",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: Op,
    pub kind: Option<EntityKind>,
    pub id: Option<String>,
    pub field: Option<String>,
    pub value: Option<Value>,
}

/// A rule making matching calls fail. Unset filters match anything.
#[derive(Debug, Clone)]
pub struct Fault {
    op: Op,
    kind: Option<EntityKind>,
    id: Option<String>,
    field: Option<String>,
    remaining: Option<usize>,
}

impl Fault {
    pub fn on(op: Op) -> Self {
        Self {
            op,
            kind: None,
            id: None,
            field: None,
            remaining: None,
        }
    }

    pub fn kind(mut self, kind: EntityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    pub fn once(self) -> Self {
        self.times(1)
    }

    fn matches(&self, call: &Call) -> bool {
        self.op == call.op
            && self.remaining != Some(0)
            && self.kind.is_none_or(|k| call.kind == Some(k))
            && self.id.as_ref().is_none_or(|id| call.id.as_ref() == Some(id))
            && self
                .field
                .as_ref()
                .is_none_or(|field| call.field.as_ref() == Some(field))
    }
}

#[derive(Debug)]
struct Inner {
    collections: [Vec<Entity>; 4],
    tags: Vec<String>,
    next_id: u64,
    adopt_ids: bool,
    faults: Vec<Fault>,
    latency: Vec<(Op, Duration)>,
    calls: Vec<Call>,
}

#[derive(Debug)]
pub struct MemoryGateway {
    inner: Mutex<Inner>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                collections: Default::default(),
                tags: vec![],
                next_id: 1,
                adopt_ids: false,
                faults: vec![],
                latency: vec![],
                calls: vec![],
            }),
        }
    }

    pub fn adopting_ids() -> Self {
        let gateway = Self::new();
        gateway.inner.lock().adopt_ids = true;
        gateway
    }

    pub fn next_id_from(&self, next: u64) {
        self.inner.lock().next_id = next;
    }

    pub fn seed(&self, kind: EntityKind, entities: Vec<Entity>) {
        let mut inner = self.inner.lock();
        for entity in &entities {
            if let EntityId::Confirmed(id) = &entity.id
                && let Ok(n) = id.parse::<u64>()
            {
                inner.next_id = inner.next_id.max(n + 1);
            }
        }
        inner.collections[kind.index()] = entities;
    }

    pub fn seed_tags(&self, tags: Vec<String>) {
        self.inner.lock().tags = tags;
    }

    pub fn inject(&self, fault: Fault) {
        self.inner.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.inner.lock().faults.clear();
    }

    pub fn set_latency(&self, op: Op, latency: Duration) {
        let mut inner = self.inner.lock();
        inner.latency.retain(|(o, _)| *o != op);
        inner.latency.push((op, latency));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().calls.clone()
    }

    pub fn calls_for(&self, op: Op) -> Vec<Call> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    pub fn stored(&self, kind: EntityKind) -> Vec<Entity> {
        self.inner.lock().collections[kind.index()].clone()
    }

    pub fn stored_tags(&self) -> Vec<String> {
        self.inner.lock().tags.clone()
    }

    async fn enter(&self, call: Call) -> anyhow::Result<()> {
        let latency = {
            let mut inner = self.inner.lock();
            inner.calls.push(call.clone());
            inner
                .latency
                .iter()
                .find(|(op, _)| *op == call.op)
                .map(|(_, d)| *d)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner.lock();
        if let Some(fault) = inner.faults.iter_mut().find(|f| f.matches(&call)) {
            if let Some(remaining) = fault.remaining.as_mut() {
                *remaining -= 1;
            }
            debug!(op = %call.op, id = ?call.id, "injected gateway failure");
            return Err(anyhow!(
                "{} failed for {}",
                call.op,
                call.id.as_deref().unwrap_or("<none>")
            ));
        }
        Ok(())
    }
}

fn call(op: Op, kind: Option<EntityKind>) -> Call {
    Call {
        op,
        kind,
        id: None,
        field: None,
        value: None,
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    #[instrument(skip(self, entity), fields(kind = %entity.kind, id = %entity.id))]
    async fn create(&self, entity: &Entity) -> anyhow::Result<Option<String>> {
        let mut record = call(Op::Create, Some(entity.kind));
        record.id = Some(entity.id.to_string());
        self.enter(record).await?;

        let mut inner = self.inner.lock();
        let (stored_id, returned) = match (&entity.id, inner.adopt_ids) {
            (EntityId::Temporary(n), true) => (n.to_string(), None),
            (EntityId::Confirmed(id), true) => (id.clone(), None),
            (_, false) => {
                let id = inner.next_id.to_string();
                inner.next_id += 1;
                (id.clone(), Some(id))
            }
        };

        let mut stored = entity.clone();
        stored.id = EntityId::Confirmed(stored_id);
        inner.collections[entity.kind.index()].push(stored);
        Ok(returned)
    }

    #[instrument(skip(self, value))]
    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        field: &str,
        value: &Value,
    ) -> anyhow::Result<()> {
        let mut record = call(Op::Update, Some(kind));
        record.id = Some(id.to_string());
        record.field = Some(field.to_string());
        record.value = Some(value.clone());
        self.enter(record).await?;

        let mut inner = self.inner.lock();
        let entity = inner.collections[kind.index()]
            .iter_mut()
            .find(|e| e.id == EntityId::Confirmed(id.to_string()))
            .ok_or_else(|| anyhow!("{kind} {id} not found"))?;
        entity.fields.insert(field.to_string(), value.clone());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, kind: EntityKind, id: &str) -> anyhow::Result<()> {
        let mut record = call(Op::Delete, Some(kind));
        record.id = Some(id.to_string());
        self.enter(record).await?;

        let mut inner = self.inner.lock();
        let items = &mut inner.collections[kind.index()];
        let idx = items
            .iter()
            .position(|e| e.id == EntityId::Confirmed(id.to_string()))
            .ok_or_else(|| anyhow!("{kind} {id} not found"))?;
        items.remove(idx);
        Ok(())
    }

    #[instrument(skip(self, tags), fields(count = tags.len()))]
    async fn persist_tag_set(&self, tags: &[String]) -> anyhow::Result<()> {
        let mut record = call(Op::PersistTags, None);
        record.value = Some(Value::from(tags.to_vec()));
        self.enter(record).await?;
        self.inner.lock().tags = tags.to_vec();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch_all(&self, kind: EntityKind) -> anyhow::Result<Vec<Entity>> {
        self.enter(call(Op::FetchAll, Some(kind))).await?;
        Ok(self.stored(kind))
    }

    #[instrument(skip(self))]
    async fn fetch_tags(&self) -> anyhow::Result<Vec<String>> {
        self.enter(call(Op::FetchTags, None)).await?;
        Ok(self.stored_tags())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::entity::Fields;

    fn temp_task(n: u64) -> Entity {
        let mut fields = Fields::new();
        fields.insert("text".to_string(), json!("X"));
        Entity::new(EntityKind::Task, EntityId::Temporary(n), fields)
    }

    #[tokio::test]
    async fn assigns_or_adopts_identities() {
        let assigning = MemoryGateway::new();
        assigning.next_id_from(42);
        let id = assigning.create(&temp_task(5)).await.expect("create");
        assert_eq!(id.as_deref(), Some("42"));

        let adopting = MemoryGateway::adopting_ids();
        let id = adopting.create(&temp_task(5)).await.expect("create");
        assert_eq!(id, None);
        assert_eq!(adopting.stored(EntityKind::Task)[0].id, EntityId::confirmed("5"));
    }

    #[tokio::test]
    async fn faults_match_filters_and_run_out() {
        let gateway = MemoryGateway::new();
        gateway.seed(
            EntityKind::Task,
            vec![
                Entity::new(EntityKind::Task, EntityId::confirmed("3"), Fields::new()),
                Entity::new(EntityKind::Task, EntityId::confirmed("9"), Fields::new()),
            ],
        );
        gateway.inject(Fault::on(Op::Delete).id("9").once());

        assert!(gateway.delete(EntityKind::Task, "3").await.is_ok());
        assert!(gateway.delete(EntityKind::Task, "9").await.is_err());
        assert!(gateway.delete(EntityKind::Task, "9").await.is_ok());
        assert_eq!(gateway.calls_for(Op::Delete).len(), 3);
        assert!(gateway.stored(EntityKind::Task).is_empty());
    }

    #[tokio::test]
    async fn update_of_unknown_entity_fails() {
        let gateway = MemoryGateway::new();
        let err = gateway
            .update(EntityKind::Goal, "1", "text", &json!("A"))
            .await
            .expect_err("missing goal");
        assert!(err.to_string().contains("not found"));
    }
}
