use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::entity::{EntityId, EntityKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Pending,
    Confirmed(String),
    Failed,
}

#[derive(Debug, Default)]
struct Slots {
    by_temp: HashMap<(EntityKind, u64), watch::Sender<Resolution>>,
    by_remote: HashMap<(EntityKind, String), u64>,
}

#[derive(Debug)]
pub struct IdentityLedger {
    next: AtomicU64,
    slots: Mutex<Slots>,
}

impl Default for IdentityLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityLedger {
    pub fn new() -> Self {
        let seed = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(1);
        Self::starting_at(seed)
    }

    pub fn starting_at(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn allocate(&self, kind: EntityKind) -> u64 {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let (tx, _) = watch::channel(Resolution::Pending);
        self.slots.lock().by_temp.insert((kind, n), tx);
        debug!(%kind, temp = n, "allocated temporary identity");
        n
    }

    pub fn confirm(&self, kind: EntityKind, temp: u64, remote: String) {
        let mut slots = self.slots.lock();
        slots.by_remote.insert((kind, remote.clone()), temp);
        if let Some(tx) = slots.by_temp.get(&(kind, temp)) {
            tx.send_replace(Resolution::Confirmed(remote));
        }
    }

    pub fn fail(&self, kind: EntityKind, temp: u64) {
        if let Some(tx) = self.slots.lock().by_temp.get(&(kind, temp)) {
            tx.send_replace(Resolution::Failed);
        }
    }

    pub fn resolution(&self, kind: EntityKind, temp: u64) -> Option<Resolution> {
        self.slots
            .lock()
            .by_temp
            .get(&(kind, temp))
            .map(|tx| tx.borrow().clone())
    }

    pub fn current(&self, kind: EntityKind, id: &EntityId) -> EntityId {
        match id {
            EntityId::Temporary(n) => match self.resolution(kind, *n) {
                Some(Resolution::Confirmed(remote)) => EntityId::Confirmed(remote),
                _ => id.clone(),
            },
            EntityId::Confirmed(_) => id.clone(),
        }
    }

    /// A key that stays the same across the temporary-to-confirmed rewrite.
    pub fn canonical(&self, kind: EntityKind, id: &EntityId) -> EntityId {
        match id {
            EntityId::Temporary(_) => id.clone(),
            EntityId::Confirmed(remote) => self
                .slots
                .lock()
                .by_remote
                .get(&(kind, remote.clone()))
                .map(|n| EntityId::Temporary(*n))
                .unwrap_or_else(|| id.clone()),
        }
    }

    pub fn is_failed(&self, kind: EntityKind, id: &EntityId) -> bool {
        match id {
            EntityId::Temporary(n) => self.resolution(kind, *n) == Some(Resolution::Failed),
            EntityId::Confirmed(_) => false,
        }
    }

    /// Waits until the identity is usable against the remote store. `None`
    /// means the entity never reached it (its create failed) or the temporary
    /// identity was not issued here.
    pub async fn resolve(&self, kind: EntityKind, id: &EntityId) -> Option<String> {
        let n = match id {
            EntityId::Confirmed(remote) => return Some(remote.clone()),
            EntityId::Temporary(n) => *n,
        };

        let mut rx = self.slots.lock().by_temp.get(&(kind, n))?.subscribe();
        let settled = rx
            .wait_for(|res| *res != Resolution::Pending)
            .await
            .ok()?
            .clone();
        match settled {
            Resolution::Confirmed(remote) => Some(remote),
            Resolution::Pending | Resolution::Failed => None,
        }
    }
}
