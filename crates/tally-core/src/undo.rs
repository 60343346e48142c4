//! Grace-period deletion: entities leave the store at once, but the remote
//! delete only goes out once the grace period runs out without an undo.
//!
//! ```text
//! Active ──undo()──────────────▶ Reverted
//!   │
//!   └─timer─▶ Committing ──all ok──▶ Committed
//!                  └──any failed──▶ CommitFailed (whole batch restored)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::entity::{Entity, EntityId, EntityKind};
use crate::gateway::RemoteGateway;
use crate::identity::IdentityLedger;
use crate::signal::{FailureKind, Signal, SignalBus};
use crate::store::EntityStore;

pub const DEFAULT_GRACE: Duration = Duration::from_millis(4500);
pub const MAX_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionState {
    Active,
    Reverted,
    Committing,
    Committed,
    CommitFailed,
}

impl DeletionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeletionState::Reverted | DeletionState::Committed | DeletionState::CommitFailed
        )
    }
}

#[derive(Debug, Clone)]
pub struct PendingDeletion {
    pub batch: Uuid,
    pub kind: EntityKind,
    pub entities: Vec<Entity>,
    pub created_at: DateTime<Utc>,
    pub grace: Duration,
    pub state: DeletionState,
}

impl PendingDeletion {
    pub fn reverted(&self) -> bool {
        self.state == DeletionState::Reverted
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.grace)
            .ok()
            .and_then(|grace| self.created_at.checked_add_signed(grace))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| e.id.clone()).collect()
    }
}

#[derive(Debug)]
struct Slot {
    deletion: PendingDeletion,
    timer: Option<JoinHandle<()>>,
    state: watch::Sender<DeletionState>,
}

pub struct UndoScheduler {
    store: Arc<EntityStore>,
    ledger: Arc<IdentityLedger>,
    gateway: Arc<dyn RemoteGateway>,
    signals: SignalBus,
    grace: Duration,
    batches: Mutex<HashMap<Uuid, Slot>>,
}

impl UndoScheduler {
    pub fn new(
        store: Arc<EntityStore>,
        ledger: Arc<IdentityLedger>,
        gateway: Arc<dyn RemoteGateway>,
        signals: SignalBus,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            gateway,
            signals,
            grace,
            batches: Mutex::new(HashMap::new()),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Removes the matching entities and opens an undo window for them.
    /// Identities not in the store (already deleted, or inside another
    /// active batch) are ignored; `None` when nothing matched.
    #[instrument(skip_all, fields(%kind, requested = ids.len()))]
    pub fn delete(self: &Arc<Self>, kind: EntityKind, ids: &[EntityId]) -> Option<UndoHandle> {
        let targets: Vec<EntityId> = ids.iter().map(|id| self.ledger.current(kind, id)).collect();

        let mut batches = self.batches.lock();
        let entities = self.store.take(kind, &targets);
        if entities.is_empty() {
            debug!("nothing to delete; request ignored");
            return None;
        }

        let batch = Uuid::new_v4();
        let count = entities.len();
        let deletion = PendingDeletion {
            batch,
            kind,
            entities,
            created_at: Utc::now(),
            grace: self.grace,
            state: DeletionState::Active,
        };
        let expires_at = deletion.expires_at();
        let (state_tx, state_rx) = watch::channel(DeletionState::Active);

        let this = Arc::clone(self);
        let grace = self.grace;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.commit(batch).await;
        });

        batches.insert(
            batch,
            Slot {
                deletion,
                timer: Some(timer),
                state: state_tx,
            },
        );
        drop(batches);

        info!(%batch, count, grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX), "deletion batch opened");
        self.signals.emit(Signal::UndoOffered {
            batch,
            kind,
            count,
            grace,
        });

        Some(UndoHandle {
            batch,
            kind,
            count,
            expires_at,
            state: state_rx,
            scheduler: Arc::clone(self),
        })
    }

    pub fn delete_one(self: &Arc<Self>, kind: EntityKind, id: &EntityId) -> Option<UndoHandle> {
        self.delete(kind, std::slice::from_ref(id))
    }

    /// Cancels an active batch and puts its entities back. Only the first
    /// call on an active batch does anything.
    #[instrument(skip(self))]
    pub fn undo(&self, batch: Uuid) -> bool {
        let mut batches = self.batches.lock();
        match batches.get(&batch) {
            Some(slot) if slot.deletion.state == DeletionState::Active => {}
            _ => {
                debug!("undo ignored; batch not active");
                return false;
            }
        }
        let Some(mut slot) = batches.remove(&batch) else {
            return false;
        };

        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.deletion.state = DeletionState::Reverted;
        let restored = self.restore(&slot.deletion);
        slot.state.send_replace(DeletionState::Reverted);
        drop(batches);

        info!(%batch, restored, "deletion undone");
        self.signals.emit(Signal::UndoClosed {
            batch,
            state: DeletionState::Reverted,
        });
        true
    }

    pub fn active(&self) -> Vec<PendingDeletion> {
        self.batches
            .lock()
            .values()
            .filter(|slot| slot.deletion.state == DeletionState::Active)
            .map(|slot| slot.deletion.clone())
            .collect()
    }

    pub fn pending(&self, batch: Uuid) -> Option<PendingDeletion> {
        self.batches
            .lock()
            .get(&batch)
            .map(|slot| slot.deletion.clone())
    }

    #[instrument(skip(self))]
    async fn commit(&self, batch: Uuid) {
        let (kind, entities) = {
            let mut batches = self.batches.lock();
            let Some(slot) = batches.get_mut(&batch) else {
                return;
            };
            if slot.deletion.state != DeletionState::Active {
                return;
            }
            slot.deletion.state = DeletionState::Committing;
            slot.timer = None;
            slot.state.send_replace(DeletionState::Committing);
            (slot.deletion.kind, slot.deletion.entities.clone())
        };
        info!(%kind, count = entities.len(), "grace period over; committing deletion");

        let deletes = entities.iter().map(|entity| async move {
            match self.ledger.resolve(kind, &entity.id).await {
                Some(remote) => self
                    .gateway
                    .delete(kind, &remote)
                    .await
                    .map_err(|err| format!("{remote}: {err:#}")),
                None => {
                    debug!(id = %entity.id, "entity never reached the remote; no delete sent");
                    Ok(())
                }
            }
        });
        let failures: Vec<String> = join_all(deletes)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        let state = if failures.is_empty() {
            DeletionState::Committed
        } else {
            DeletionState::CommitFailed
        };

        {
            let mut batches = self.batches.lock();
            if let Some(mut slot) = batches.remove(&batch) {
                slot.deletion.state = state;
                if state == DeletionState::CommitFailed {
                    self.restore(&slot.deletion);
                }
                slot.state.send_replace(state);
            }
        }

        if failures.is_empty() {
            info!(%kind, "deletion committed");
        } else {
            error!(%kind, failed = failures.len(), errors = ?failures, "remote delete failed; batch restored");
            self.signals.failure(
                FailureKind::Delete,
                Some(kind),
                format!(
                    "could not delete {} {}(s); restored: {}",
                    failures.len(),
                    kind,
                    failures.join("; ")
                ),
            );
        }
        self.signals.emit(Signal::UndoClosed { batch, state });
    }

    fn restore(&self, deletion: &PendingDeletion) -> usize {
        let kind = deletion.kind;
        let entities: Vec<Entity> = deletion
            .entities
            .iter()
            .filter(|e| !self.ledger.is_failed(kind, &e.id))
            .map(|e| {
                let mut entity = e.clone();
                entity.id = self.ledger.current(kind, &e.id);
                entity
            })
            .collect();
        self.store.append_all(kind, entities)
    }
}

pub struct UndoHandle {
    batch: Uuid,
    kind: EntityKind,
    count: usize,
    expires_at: DateTime<Utc>,
    state: watch::Receiver<DeletionState>,
    scheduler: Arc<UndoScheduler>,
}

impl UndoHandle {
    pub fn batch(&self) -> Uuid {
        self.batch
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn state(&self) -> DeletionState {
        *self.state.borrow()
    }

    /// True only if this call moved the batch from active to reverted.
    pub fn undo(&self) -> bool {
        self.scheduler.undo(self.batch)
    }

    pub async fn settled(&self) -> DeletionState {
        let mut rx = self.state.clone();
        let settled = rx.wait_for(|s| s.is_terminal()).await.map(|state| *state);
        settled.unwrap_or_else(|_| *rx.borrow())
    }
}

impl std::fmt::Debug for UndoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoHandle")
            .field("batch", &self.batch)
            .field("kind", &self.kind)
            .field("count", &self.count)
            .field("state", &self.state())
            .finish()
    }
}
