use std::time::Duration;

use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::entity::EntityKind;
use crate::undo::DeletionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Create,
    Update,
    Delete,
    TagPersist,
    Fetch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub entity: Option<EntityKind>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Failure(Failure),
    UndoOffered {
        batch: Uuid,
        kind: EntityKind,
        count: usize,
        grace: Duration,
    },
    UndoClosed {
        batch: Uuid,
        state: DeletionState,
    },
}

#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<Signal>,
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }

    pub fn emit(&self, signal: Signal) {
        // no subscribers is fine
        if self.tx.send(signal).is_err() {
            trace!("signal dropped; no subscribers");
        }
    }

    pub fn failure(&self, kind: FailureKind, entity: Option<EntityKind>, message: impl Into<String>) {
        self.emit(Signal::Failure(Failure {
            kind,
            entity,
            message: message.into(),
        }));
    }
}
