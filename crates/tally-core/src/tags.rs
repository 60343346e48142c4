use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, instrument, warn};

use crate::gateway::RemoteGateway;
use crate::signal::{FailureKind, SignalBus};
use crate::ticket::Ticket;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagAddOutcome {
    Created(String),
    AlreadyExists(String),
    /// Empty after trimming; nothing changed.
    Rejected,
}

pub fn normalize_tag(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

pub struct TagRegistry {
    tags: watch::Sender<Vec<String>>,
    gateway: Arc<dyn RemoteGateway>,
    signals: SignalBus,
    persist_turn: Arc<Mutex<()>>,
}

impl TagRegistry {
    pub fn new(gateway: Arc<dyn RemoteGateway>, signals: SignalBus) -> Self {
        Self {
            tags: watch::channel(Vec::new()).0,
            gateway,
            signals,
            persist_turn: Arc::new(Mutex::new(())),
        }
    }

    pub fn tags(&self) -> Vec<String> {
        self.tags.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.tags.subscribe()
    }

    pub fn contains(&self, raw: &str) -> bool {
        normalize_tag(raw).is_some_and(|tag| self.tags.borrow().contains(&tag))
    }

    pub fn hydrate(&self, remote: Vec<String>) {
        let mut tags: Vec<String> = Vec::with_capacity(remote.len());
        for tag in remote.iter().filter_map(|raw| normalize_tag(raw)) {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        debug!(count = tags.len(), "tag set hydrated");
        self.tags.send_replace(tags);
    }

    #[instrument(skip(self))]
    pub fn add(&self, raw: &str) -> (TagAddOutcome, Option<Ticket<bool>>) {
        let Some(tag) = normalize_tag(raw) else {
            debug!("empty tag ignored");
            return (TagAddOutcome::Rejected, None);
        };

        let mut total = None;
        self.tags.send_if_modified(|tags| {
            if tags.contains(&tag) {
                return false;
            }
            tags.push(tag.clone());
            total = Some(tags.len());
            true
        });
        let Some(total) = total else {
            debug!(%tag, "tag already exists");
            return (TagAddOutcome::AlreadyExists(tag), None);
        };

        info!(%tag, total, "tag added");
        let gateway = Arc::clone(&self.gateway);
        let signals = self.signals.clone();
        let turn = Arc::clone(&self.persist_turn);
        let current = self.tags.subscribe();
        let handle = tokio::spawn(async move {
            // one persist at a time, each sending the set as it is when its turn comes
            let _turn = turn.lock().await;
            let latest = current.borrow().clone();
            match gateway.persist_tag_set(&latest).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "tag set not persisted; keeping local copy");
                    signals.failure(
                        FailureKind::TagPersist,
                        None,
                        format!("tags may not survive a reload: {err:#}"),
                    );
                    false
                }
            }
        });
        (TagAddOutcome::Created(tag), Some(Ticket::new(handle)))
    }
}
