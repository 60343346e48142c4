use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Task,
    Goal,
    Reminder,
    Habit,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Task,
        EntityKind::Goal,
        EntityKind::Reminder,
        EntityKind::Habit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Goal => "goal",
            EntityKind::Reminder => "reminder",
            EntityKind::Habit => "habit",
        }
    }

    pub fn collection(self) -> &'static str {
        match self {
            EntityKind::Task => "tasks",
            EntityKind::Goal => "goals",
            EntityKind::Reminder => "reminders",
            EntityKind::Habit => "habits",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            EntityKind::Task => 0,
            EntityKind::Goal => 1,
            EntityKind::Reminder => 2,
            EntityKind::Habit => 3,
        }
    }

    /// Fills in the fields a freshly created entity of this kind always carries.
    /// Caller-supplied values win.
    pub fn apply_defaults(self, fields: &mut Fields) {
        let defaults: Vec<(&str, Value)> = match self {
            EntityKind::Task => vec![("status", json!("NOT STARTED")), ("tags", json!([]))],
            EntityKind::Habit => vec![
                ("frequency", json!("DAILY")),
                ("completions", json!([])),
                ("streak", json!(0)),
            ],
            EntityKind::Goal | EntityKind::Reminder => vec![],
        };

        for (key, value) in defaults {
            fields.entry(key.to_string()).or_insert(value);
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lowered || kind.collection() == lowered)
            .ok_or_else(|| anyhow!("unknown entity kind: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    Temporary(u64),
    Confirmed(String),
}

impl EntityId {
    pub fn is_temporary(&self) -> bool {
        matches!(self, EntityId::Temporary(_))
    }

    pub fn confirmed(id: impl Into<String>) -> Self {
        EntityId::Confirmed(id.into())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Temporary(n) => write!(f, "tmp-{n}"),
            EntityId::Confirmed(id) => f.write_str(id),
        }
    }
}

impl FromStr for EntityId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("entity id cannot be empty"));
        }
        if let Some(rest) = trimmed.strip_prefix("tmp-") {
            let n = rest
                .parse::<u64>()
                .map_err(|_| anyhow!("invalid temporary id: {s}"))?;
            return Ok(EntityId::Temporary(n));
        }
        Ok(EntityId::Confirmed(trimmed.to_string()))
    }
}

impl Serialize for EntityId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Entity {
    pub fn new(kind: EntityKind, id: EntityId, fields: Fields) -> Self {
        Self { id, kind, fields }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn text(&self) -> Option<&str> {
        self.fields.get("text").and_then(Value::as_str)
    }
}
