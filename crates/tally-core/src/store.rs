use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::entity::{Entity, EntityId, EntityKind};

#[derive(Debug)]
pub struct EntityStore {
    collections: [watch::Sender<Vec<Entity>>; 4],
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            collections: std::array::from_fn(|_| watch::channel(Vec::new()).0),
        }
    }

    fn channel(&self, kind: EntityKind) -> &watch::Sender<Vec<Entity>> {
        &self.collections[kind.index()]
    }

    pub fn get(&self, kind: EntityKind) -> Vec<Entity> {
        self.channel(kind).borrow().clone()
    }

    pub fn subscribe(&self, kind: EntityKind) -> watch::Receiver<Vec<Entity>> {
        self.channel(kind).subscribe()
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.channel(kind).borrow().len()
    }

    pub fn is_empty(&self, kind: EntityKind) -> bool {
        self.len(kind) == 0
    }

    pub fn set(&self, kind: EntityKind, entities: Vec<Entity>) {
        let mut deduped: Vec<Entity> = Vec::with_capacity(entities.len());
        for entity in entities {
            if deduped.iter().any(|e| e.id == entity.id) {
                warn!(%kind, id = %entity.id, "dropping duplicate identity in collection");
                continue;
            }
            deduped.push(entity);
        }
        debug!(%kind, count = deduped.len(), "collection replaced");
        self.channel(kind).send_replace(deduped);
    }

    pub fn find(&self, kind: EntityKind, id: &EntityId) -> Option<Entity> {
        self.channel(kind)
            .borrow()
            .iter()
            .find(|e| &e.id == id)
            .cloned()
    }

    pub fn contains(&self, kind: EntityKind, id: &EntityId) -> bool {
        self.channel(kind).borrow().iter().any(|e| &e.id == id)
    }

    /// Appends one entity. Returns false (and changes nothing) when the
    /// identity is already present.
    pub fn append(&self, kind: EntityKind, entity: Entity) -> bool {
        self.channel(kind).send_if_modified(|items| {
            if items.iter().any(|e| e.id == entity.id) {
                warn!(%kind, id = %entity.id, "identity already present; append ignored");
                return false;
            }
            items.push(entity);
            true
        })
    }

    pub fn append_all(&self, kind: EntityKind, entities: Vec<Entity>) -> usize {
        let mut appended = 0;
        self.channel(kind).send_if_modified(|items| {
            for entity in entities {
                if items.iter().any(|e| e.id == entity.id) {
                    warn!(%kind, id = %entity.id, "identity already present; append ignored");
                    continue;
                }
                items.push(entity);
                appended += 1;
            }
            appended > 0
        });
        appended
    }

    pub fn remove(&self, kind: EntityKind, id: &EntityId) -> Option<Entity> {
        let mut removed = None;
        self.channel(kind).send_if_modified(|items| {
            if let Some(idx) = items.iter().position(|e| &e.id == id) {
                removed = Some(items.remove(idx));
                true
            } else {
                false
            }
        });
        removed
    }

    pub fn take(&self, kind: EntityKind, ids: &[EntityId]) -> Vec<Entity> {
        let mut taken = Vec::new();
        self.channel(kind).send_if_modified(|items| {
            let (gone, kept): (Vec<Entity>, Vec<Entity>) = std::mem::take(items)
                .into_iter()
                .partition(|e| ids.contains(&e.id));
            *items = kept;
            taken = gone;
            !taken.is_empty()
        });
        taken
    }

    pub fn replace_identity(&self, kind: EntityKind, old: &EntityId, new: EntityId) -> bool {
        self.channel(kind).send_if_modified(|items| {
            if old != &new && items.iter().any(|e| e.id == new) {
                warn!(%kind, %old, %new, "target identity already present; rewrite skipped");
                return false;
            }
            match items.iter_mut().find(|e| &e.id == old) {
                Some(entity) => {
                    entity.id = new;
                    true
                }
                None => false,
            }
        })
    }

    /// Current value of one field. The outer `None` means the entity is absent,
    /// the inner one that the field is unset.
    pub fn field(&self, kind: EntityKind, id: &EntityId, field: &str) -> Option<Option<Value>> {
        self.channel(kind)
            .borrow()
            .iter()
            .find(|e| &e.id == id)
            .map(|e| e.fields.get(field).cloned())
    }

    /// Writes one field and hands back the value it replaced, in one step.
    /// `None` if the entity is absent, in which case nothing is written.
    pub fn swap_field(
        &self,
        kind: EntityKind,
        id: &EntityId,
        field: &str,
        value: Value,
    ) -> Option<Option<Value>> {
        let mut prior = None;
        self.channel(kind).send_if_modified(|items| {
            match items.iter_mut().find(|e| &e.id == id) {
                Some(entity) => {
                    prior = Some(entity.fields.insert(field.to_string(), value));
                    true
                }
                None => false,
            }
        });
        prior
    }

    pub fn set_field(
        &self,
        kind: EntityKind,
        id: &EntityId,
        field: &str,
        value: Option<Value>,
    ) -> bool {
        self.channel(kind)
            .send_if_modified(|items| match items.iter_mut().find(|e| &e.id == id) {
                Some(entity) => {
                    match value {
                        Some(value) => {
                            entity.fields.insert(field.to_string(), value);
                        }
                        None => {
                            entity.fields.remove(field);
                        }
                    }
                    true
                }
                None => false,
            })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::entity::Fields;

    fn entity(id: &str, text: &str) -> Entity {
        let mut fields = Fields::new();
        fields.insert("text".to_string(), json!(text));
        Entity::new(EntityKind::Task, EntityId::confirmed(id), fields)
    }

    #[test]
    fn append_preserves_insertion_order_and_rejects_duplicates() {
        let store = EntityStore::new();
        assert!(store.append(EntityKind::Task, entity("1", "A")));
        assert!(store.append(EntityKind::Task, entity("2", "B")));
        assert!(!store.append(EntityKind::Task, entity("1", "C")));

        let tasks = store.get(EntityKind::Task);
        let texts: Vec<_> = tasks.iter().filter_map(Entity::text).collect();
        assert_eq!(texts, vec!["A", "B"]);
        assert!(store.is_empty(EntityKind::Goal));
    }

    #[test]
    fn replace_identity_keeps_position() {
        let store = EntityStore::new();
        store.set(
            EntityKind::Task,
            vec![entity("1", "A"), entity("2", "B"), entity("3", "C")],
        );

        assert!(store.replace_identity(
            EntityKind::Task,
            &EntityId::confirmed("2"),
            EntityId::confirmed("20")
        ));
        let ids: Vec<_> = store
            .get(EntityKind::Task)
            .into_iter()
            .map(|e| e.id.to_string())
            .collect();
        assert_eq!(ids, vec!["1", "20", "3"]);

        assert!(!store.replace_identity(
            EntityKind::Task,
            &EntityId::confirmed("1"),
            EntityId::confirmed("3")
        ));
    }

    #[test]
    fn take_removes_matching_bodies_in_one_step() {
        let store = EntityStore::new();
        store.set(
            EntityKind::Task,
            vec![entity("1", "A"), entity("2", "B"), entity("3", "C")],
        );
        let mut rx = store.subscribe(EntityKind::Task);
        rx.mark_unchanged();

        let taken = store.take(
            EntityKind::Task,
            &[EntityId::confirmed("3"), EntityId::confirmed("1"), EntityId::confirmed("9")],
        );
        assert_eq!(taken.len(), 2);
        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(rx.borrow_and_update().len(), 1);
    }

    #[test]
    fn field_writes_are_scoped_to_one_field() {
        let store = EntityStore::new();
        store.set(EntityKind::Task, vec![entity("1", "A")]);
        let id = EntityId::confirmed("1");

        assert!(store.set_field(EntityKind::Task, &id, "date", Some(json!("2025-03-01"))));
        assert_eq!(
            store.field(EntityKind::Task, &id, "date"),
            Some(Some(json!("2025-03-01")))
        );
        assert!(store.set_field(EntityKind::Task, &id, "date", None));
        assert_eq!(store.field(EntityKind::Task, &id, "date"), Some(None));
        assert_eq!(store.field(EntityKind::Task, &id, "text"), Some(Some(json!("A"))));

        assert_eq!(
            store.swap_field(EntityKind::Task, &id, "text", json!("B")),
            Some(Some(json!("A")))
        );
        assert_eq!(
            store.swap_field(EntityKind::Task, &id, "note", json!("n")),
            Some(None)
        );

        let missing = EntityId::confirmed("9");
        assert_eq!(store.swap_field(EntityKind::Task, &missing, "text", json!("X")), None);
        assert_eq!(store.field(EntityKind::Task, &missing, "text"), None);
        assert!(!store.set_field(EntityKind::Task, &missing, "text", Some(json!("X"))));
    }
}
