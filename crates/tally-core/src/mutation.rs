use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use crate::entity::{Entity, EntityId, EntityKind, Fields};
use crate::gateway::RemoteGateway;
use crate::identity::IdentityLedger;
use crate::signal::{FailureKind, SignalBus};
use crate::store::EntityStore;
use crate::ticket::Ticket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Confirmed,
    /// The remote rejected it and the local write was undone.
    Reverted,
    /// The remote rejected it, but a newer local write owns the field now.
    Superseded,
    /// Never sent: the entity's own create failed first.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MutationKey {
    kind: EntityKind,
    entity: EntityId,
    field: String,
}

#[derive(Debug)]
struct PendingMutation {
    generation: u64,
    prior: Option<Value>,
    issued: Option<oneshot::Receiver<()>>,
}

pub struct MutationController {
    store: Arc<EntityStore>,
    ledger: Arc<IdentityLedger>,
    gateway: Arc<dyn RemoteGateway>,
    signals: SignalBus,
    pending: Mutex<HashMap<MutationKey, PendingMutation>>,
    generation: AtomicU64,
}

impl MutationController {
    pub fn new(
        store: Arc<EntityStore>,
        ledger: Arc<IdentityLedger>,
        gateway: Arc<dyn RemoteGateway>,
        signals: SignalBus,
    ) -> Self {
        Self {
            store,
            ledger,
            gateway,
            signals,
            pending: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    #[instrument(skip_all, fields(%kind))]
    pub fn add(self: &Arc<Self>, kind: EntityKind, mut body: Fields) -> (EntityId, Ticket<Outcome>) {
        kind.apply_defaults(&mut body);
        let temp = self.ledger.allocate(kind);
        let temp_id = EntityId::Temporary(temp);
        let entity = Entity::new(kind, temp_id.clone(), body);
        self.store.append(kind, entity.clone());
        debug!(id = %temp_id, "optimistic add applied");

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.confirm_add(entity, temp).await });
        (temp_id, Ticket::new(handle))
    }

    async fn confirm_add(&self, entity: Entity, temp: u64) -> Outcome {
        let kind = entity.kind;
        match self.gateway.create(&entity).await {
            Ok(assigned) => {
                // no id back: the temporary number is ratified as-is
                let remote = assigned.unwrap_or_else(|| temp.to_string());
                self.ledger.confirm(kind, temp, remote.clone());
                if !self
                    .store
                    .replace_identity(kind, &entity.id, EntityId::Confirmed(remote.clone()))
                {
                    debug!(%kind, temp, "confirmed entity not in store; identity mapped only");
                }
                info!(%kind, temp, id = %remote, "create confirmed");
                Outcome::Confirmed
            }
            Err(err) => {
                self.ledger.fail(kind, temp);
                self.store.remove(kind, &entity.id);
                error!(%kind, temp, error = %format!("{err:#}"), "create failed; optimistic entity removed");
                self.signals.failure(
                    FailureKind::Create,
                    Some(kind),
                    format!("could not save new {kind}: {err:#}"),
                );
                Outcome::Reverted
            }
        }
    }

    /// Writes `value` into `field` immediately. `None` when the entity is not
    /// in the store (already deleted, or never there).
    #[instrument(skip_all, fields(%kind, %id, field = %field))]
    pub fn update(
        self: &Arc<Self>,
        kind: EntityKind,
        id: &EntityId,
        field: &str,
        value: Value,
    ) -> Option<Ticket<Outcome>> {
        let target = self.ledger.current(kind, id);
        let key = MutationKey {
            kind,
            entity: self.ledger.canonical(kind, &target),
            field: field.to_string(),
        };
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (issued_tx, issued_rx) = oneshot::channel();

        let previous_gate = {
            let mut pending = self.pending.lock();
            let Some(prior) = self.store.swap_field(kind, &target, field, value.clone()) else {
                debug!("update of absent entity ignored");
                return None;
            };
            pending
                .insert(
                    key.clone(),
                    PendingMutation {
                        generation,
                        prior,
                        issued: Some(issued_rx),
                    },
                )
                .and_then(|older| older.issued)
        };
        debug!(generation, superseding = previous_gate.is_some(), "optimistic update applied");

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Some(gate) = previous_gate {
                // older write to the same field goes out first
                let _ = gate.await;
            }
            this.confirm_update(key, target, generation, value, issued_tx)
                .await
        });
        Some(Ticket::new(handle))
    }

    async fn confirm_update(
        &self,
        key: MutationKey,
        target: EntityId,
        generation: u64,
        value: Value,
        issued: oneshot::Sender<()>,
    ) -> Outcome {
        let kind = key.kind;
        let Some(remote_id) = self.ledger.resolve(kind, &target).await else {
            drop(issued);
            self.settle(&key, generation);
            debug!(%kind, id = %target, field = %key.field, "entity never reached the remote; update skipped");
            return Outcome::Skipped;
        };

        let call = self.gateway.update(kind, &remote_id, &key.field, &value);
        let _ = issued.send(());
        let result = call.await;

        match result {
            Ok(()) => {
                self.settle(&key, generation);
                debug!(%kind, id = %remote_id, field = %key.field, "update confirmed");
                Outcome::Confirmed
            }
            Err(err) => {
                let reverted = self.revert(&key, generation);
                if reverted {
                    warn!(%kind, id = %remote_id, field = %key.field, error = %format!("{err:#}"), "update failed; field restored");
                } else {
                    warn!(%kind, id = %remote_id, field = %key.field, error = %format!("{err:#}"), "superseded update failed; newer write kept");
                }
                self.signals.failure(
                    FailureKind::Update,
                    Some(kind),
                    format!("could not save {} of {kind} {remote_id}: {err:#}", key.field),
                );
                if reverted {
                    Outcome::Reverted
                } else {
                    Outcome::Superseded
                }
            }
        }
    }

    fn settle(&self, key: &MutationKey, generation: u64) {
        let mut pending = self.pending.lock();
        if pending
            .get(key)
            .is_some_and(|p| p.generation == generation)
        {
            pending.remove(key);
        }
    }

    fn revert(&self, key: &MutationKey, generation: u64) -> bool {
        let mut pending = self.pending.lock();
        let owns_field = pending
            .get(key)
            .is_some_and(|p| p.generation == generation);
        if !owns_field {
            return false;
        }
        let Some(record) = pending.remove(key) else {
            return false;
        };

        let current = self.ledger.current(key.kind, &key.entity);
        if !self
            .store
            .set_field(key.kind, &current, &key.field, record.prior)
        {
            debug!(kind = %key.kind, id = %current, "entity gone; nothing to restore");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::gateway::{Fault, MemoryGateway, Op};

    struct Rig {
        gateway: Arc<MemoryGateway>,
        store: Arc<EntityStore>,
        controller: Arc<MutationController>,
    }

    fn rig() -> Rig {
        let gateway = Arc::new(MemoryGateway::new());
        let store = Arc::new(EntityStore::new());
        let controller = Arc::new(MutationController::new(
            Arc::clone(&store),
            Arc::new(IdentityLedger::starting_at(100)),
            gateway.clone(),
            SignalBus::new(16),
        ));
        Rig {
            gateway,
            store,
            controller,
        }
    }

    fn seeded_task(rig: &Rig, id: &str, text: &str) -> EntityId {
        let mut fields = Fields::new();
        fields.insert("text".to_string(), json!(text));
        fields.insert("status".to_string(), json!("NOT STARTED"));
        let entity = Entity::new(EntityKind::Task, EntityId::confirmed(id), fields);
        rig.gateway.seed(EntityKind::Task, vec![entity.clone()]);
        rig.store.set(EntityKind::Task, vec![entity]);
        EntityId::confirmed(id)
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_failure_keeps_newer_write() {
        let rig = rig();
        let id = seeded_task(&rig, "1", "A");
        rig.gateway.inject(Fault::on(Op::Update).once());

        let first = rig
            .controller
            .update(EntityKind::Task, &id, "text", json!("B"))
            .expect("task present");
        let second = rig
            .controller
            .update(EntityKind::Task, &id, "text", json!("C"))
            .expect("task present");
        assert_eq!(rig.controller.in_flight(), 1);

        assert_eq!(first.wait().await, Some(Outcome::Superseded));
        assert_eq!(second.wait().await, Some(Outcome::Confirmed));

        let local = rig.store.find(EntityKind::Task, &id).expect("task");
        assert_eq!(local.field("text"), Some(&json!("C")));
        let sent: Vec<_> = rig
            .gateway
            .calls_for(Op::Update)
            .into_iter()
            .filter_map(|c| c.value)
            .collect();
        assert_eq!(sent, vec![json!("B"), json!("C")]);
        assert_eq!(rig.controller.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn latest_failure_restores_value_before_it() {
        let rig = rig();
        let id = seeded_task(&rig, "1", "A");
        rig.gateway
            .inject(Fault::on(Op::Update).field("text").once());

        let ticket = rig
            .controller
            .update(EntityKind::Task, &id, "text", json!("B"))
            .expect("task present");
        assert_eq!(
            rig.store.field(EntityKind::Task, &id, "text"),
            Some(Some(json!("B")))
        );

        assert_eq!(ticket.wait().await, Some(Outcome::Reverted));
        assert_eq!(
            rig.store.field(EntityKind::Task, &id, "text"),
            Some(Some(json!("A")))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reverting_a_new_field_removes_it() {
        let rig = rig();
        let id = seeded_task(&rig, "1", "A");
        rig.gateway.inject(Fault::on(Op::Update).field("note"));

        let ticket = rig
            .controller
            .update(EntityKind::Task, &id, "note", json!("call first"))
            .expect("task present");
        assert_eq!(ticket.wait().await, Some(Outcome::Reverted));

        let local = rig.store.find(EntityKind::Task, &id).expect("task");
        assert_eq!(local.field("note"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn update_of_missing_entity_is_ignored() {
        let rig = rig();
        assert!(
            rig.controller
                .update(EntityKind::Goal, &EntityId::confirmed("5"), "text", json!("X"))
                .is_none()
        );
        assert!(rig.gateway.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn update_on_failed_create_is_skipped() {
        let rig = rig();
        rig.gateway.set_latency(Op::Create, Duration::from_millis(50));
        rig.gateway.inject(Fault::on(Op::Create));

        let (temp, created) = rig.controller.add(EntityKind::Task, Fields::new());
        let updated = rig
            .controller
            .update(EntityKind::Task, &temp, "text", json!("X"))
            .expect("optimistic entity present");

        assert_eq!(created.wait().await, Some(Outcome::Reverted));
        assert_eq!(updated.wait().await, Some(Outcome::Skipped));
        assert!(rig.gateway.calls_for(Op::Update).is_empty());
        assert!(rig.store.is_empty(EntityKind::Task));
    }
}
