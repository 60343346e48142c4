use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::NaiveDate;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, instrument};

use crate::config::Config;
use crate::entity::{Entity, EntityId, EntityKind, Fields};
use crate::gateway::RemoteGateway;
use crate::habit;
use crate::identity::IdentityLedger;
use crate::mutation::{MutationController, Outcome};
use crate::signal::{FailureKind, Signal, SignalBus};
use crate::store::EntityStore;
use crate::tags::{TagAddOutcome, TagRegistry};
use crate::ticket::Ticket;
use crate::undo::{DEFAULT_GRACE, MAX_GRACE, PendingDeletion, UndoHandle, UndoScheduler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub grace: Duration,
    pub signal_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            grace: DEFAULT_GRACE,
            signal_capacity: 64,
        }
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let undo_enabled = cfg.get_bool("undo.enabled").unwrap_or(true);
        let grace = match cfg.get_u64("undo.grace_ms")? {
            _ if !undo_enabled => Duration::ZERO,
            Some(ms) => {
                let grace = Duration::from_millis(ms);
                if grace > MAX_GRACE {
                    bail!(
                        "undo.grace_ms = {ms} is longer than the {}ms limit",
                        MAX_GRACE.as_millis()
                    );
                }
                grace
            }
            None => defaults.grace,
        };
        let signal_capacity = cfg
            .get_u64("signals.capacity")?
            .map(usize::try_from)
            .transpose()
            .context("signals.capacity out of range")?
            .unwrap_or(defaults.signal_capacity);

        Ok(Self {
            grace,
            signal_capacity,
        })
    }
}

pub struct Engine {
    store: Arc<EntityStore>,
    ledger: Arc<IdentityLedger>,
    gateway: Arc<dyn RemoteGateway>,
    signals: SignalBus,
    mutations: Arc<MutationController>,
    deletions: Arc<UndoScheduler>,
    tags: TagRegistry,
}

impl Engine {
    /// Must be called from inside a tokio runtime; remote calls run on
    /// spawned tasks.
    pub fn new(gateway: Arc<dyn RemoteGateway>, settings: EngineSettings) -> Self {
        Self::with_ledger(gateway, settings, IdentityLedger::new())
    }

    pub fn with_ledger(
        gateway: Arc<dyn RemoteGateway>,
        settings: EngineSettings,
        ledger: IdentityLedger,
    ) -> Self {
        let store = Arc::new(EntityStore::new());
        let ledger = Arc::new(ledger);
        let signals = SignalBus::new(settings.signal_capacity);

        let mutations = Arc::new(MutationController::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&gateway),
            signals.clone(),
        ));
        let deletions = Arc::new(UndoScheduler::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&gateway),
            signals.clone(),
            settings.grace,
        ));
        let tags = TagRegistry::new(Arc::clone(&gateway), signals.clone());

        Self {
            store,
            ledger,
            gateway,
            signals,
            mutations,
            deletions,
            tags,
        }
    }

    #[instrument(skip(self))]
    pub async fn hydrate(&self) {
        let (tasks, goals, reminders, habits, tags) = tokio::join!(
            self.gateway.fetch_all(EntityKind::Task),
            self.gateway.fetch_all(EntityKind::Goal),
            self.gateway.fetch_all(EntityKind::Reminder),
            self.gateway.fetch_all(EntityKind::Habit),
            self.gateway.fetch_tags(),
        );

        let fetched = [
            (EntityKind::Task, tasks),
            (EntityKind::Goal, goals),
            (EntityKind::Reminder, reminders),
            (EntityKind::Habit, habits),
        ];
        for (kind, result) in fetched {
            match result {
                Ok(entities) => {
                    info!(%kind, count = entities.len(), "collection loaded");
                    self.store.set(kind, entities);
                }
                Err(err) => {
                    error!(%kind, error = %format!("{err:#}"), "failed to load collection");
                    self.signals.failure(
                        FailureKind::Fetch,
                        Some(kind),
                        format!("could not load {}: {err:#}", kind.collection()),
                    );
                }
            }
        }

        match tags {
            Ok(tags) => self.tags.hydrate(tags),
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to load tags");
                self.signals
                    .failure(FailureKind::Fetch, None, format!("could not load tags: {err:#}"));
            }
        }
    }

    pub fn entities(&self, kind: EntityKind) -> Vec<Entity> {
        self.store.get(kind)
    }

    /// Looks an entity up by any identity it has had, temporary or confirmed.
    pub fn find(&self, kind: EntityKind, id: &EntityId) -> Option<Entity> {
        self.store.find(kind, &self.ledger.current(kind, id))
    }

    pub fn subscribe(&self, kind: EntityKind) -> watch::Receiver<Vec<Entity>> {
        self.store.subscribe(kind)
    }

    pub fn tags(&self) -> Vec<String> {
        self.tags.tags()
    }

    pub fn subscribe_tags(&self) -> watch::Receiver<Vec<String>> {
        self.tags.subscribe()
    }

    pub fn signals(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    pub fn add(&self, kind: EntityKind, body: Fields) -> (EntityId, Ticket<Outcome>) {
        self.mutations.add(kind, body)
    }

    pub fn update(
        &self,
        kind: EntityKind,
        id: &EntityId,
        field: &str,
        value: Value,
    ) -> Option<Ticket<Outcome>> {
        self.mutations.update(kind, id, field, value)
    }

    pub fn delete(&self, kind: EntityKind, id: &EntityId) -> Option<UndoHandle> {
        self.deletions.delete_one(kind, id)
    }

    pub fn delete_multiple(&self, kind: EntityKind, ids: &[EntityId]) -> Option<UndoHandle> {
        self.deletions.delete(kind, ids)
    }

    pub fn pending_deletions(&self) -> Vec<PendingDeletion> {
        self.deletions.active()
    }

    pub fn add_tag(&self, raw: &str) -> (TagAddOutcome, Option<Ticket<bool>>) {
        self.tags.add(raw)
    }

    pub fn toggle_habit(&self, id: &EntityId, date: NaiveDate) -> Option<Ticket<Outcome>> {
        let habit = self.find(EntityKind::Habit, id)?;
        let current = habit.field("completions").cloned().unwrap_or(Value::Null);
        let next = habit::toggle_completion(&current, date);
        self.update(EntityKind::Habit, &habit.id, "completions", next)
    }

    pub fn habit_streak(&self, id: &EntityId, today: NaiveDate) -> Option<u32> {
        let habit = self.find(EntityKind::Habit, id)?;
        let completions = habit.field("completions").cloned().unwrap_or(Value::Null);
        Some(habit::current_streak(&completions, today))
    }

    pub fn in_flight_updates(&self) -> usize {
        self.mutations.in_flight()
    }
}
