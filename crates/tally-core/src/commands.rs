use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use chrono::{Local, NaiveDate};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::cli::Command;
use crate::engine::Engine;
use crate::entity::{Entity, EntityId, EntityKind, Fields};
use crate::mutation::Outcome;
use crate::signal::{Failure, Signal};
use crate::tags::TagAddOutcome;
use crate::undo::DeletionState;

#[instrument(skip(engine, command))]
pub async fn dispatch(engine: &Engine, command: Command) -> anyhow::Result<()> {
    let mut signals = engine.signals();
    engine.hydrate().await;
    debug!(?command, "dispatching command");

    match command {
        Command::List { kind } => cmd_list(engine, kind.parse()?),
        Command::Add { kind, fields } => cmd_add(engine, kind.parse()?, &fields).await,
        Command::Update {
            kind,
            id,
            field,
            value,
        } => cmd_update(engine, kind.parse()?, &id.parse()?, &field, &value).await,
        Command::Delete { kind, ids } => {
            let ids = ids
                .iter()
                .map(|id| id.parse::<EntityId>())
                .collect::<anyhow::Result<Vec<_>>>()?;
            cmd_delete(engine, kind.parse()?, &ids).await
        }
        Command::Tags => {
            for tag in engine.tags() {
                println!("{tag}");
            }
            Ok(())
        }
        Command::Tag { name } => cmd_tag(engine, &name).await,
        Command::Check { id, date } => cmd_check(engine, &id.parse()?, date.as_deref()).await,
    }?;

    let failures = drain_failures(&mut signals);
    if let Some(first) = failures.first() {
        for failure in &failures {
            warn!(kind = ?failure.kind, message = %failure.message, "failure signalled");
        }
        return Err(anyhow!("{}", first.message));
    }
    Ok(())
}

fn drain_failures(signals: &mut broadcast::Receiver<Signal>) -> Vec<Failure> {
    let mut out = Vec::new();
    loop {
        match signals.try_recv() {
            Ok(Signal::Failure(failure)) => out.push(failure),
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "signal receiver lagged");
            }
            Err(_) => break,
        }
    }
    out
}

fn render_entity(entity: &Entity, today: NaiveDate) -> String {
    let mut parts = vec![entity.id.to_string()];
    for (key, value) in &entity.fields {
        match value {
            Value::String(s) => parts.push(format!("{key}={s}")),
            other => parts.push(format!("{key}={other}")),
        }
    }
    if entity.kind == EntityKind::Habit {
        let completions = entity.field("completions").cloned().unwrap_or(Value::Null);
        parts.push(format!(
            "current_streak={}",
            crate::habit::current_streak(&completions, today)
        ));
    }
    parts.join("  ")
}

fn cmd_list(engine: &Engine, kind: EntityKind) -> anyhow::Result<()> {
    info!(%kind, "command list");
    let today = Local::now().date_naive();
    let entities = engine.entities(kind);
    if entities.is_empty() {
        println!("No {}.", kind.collection());
        return Ok(());
    }
    for entity in &entities {
        println!("{}", render_entity(entity, today));
    }
    Ok(())
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_fields(pairs: &[String]) -> anyhow::Result<Fields> {
    let mut fields = Fields::new();
    for pair in pairs {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("expected FIELD=VALUE, got: {pair}"))?;
        let key = k.trim();
        if key.is_empty() || key == "id" || key == "kind" {
            bail!("invalid field name: {key:?}");
        }
        fields.insert(key.to_string(), parse_value(v));
    }
    Ok(fields)
}

async fn cmd_add(engine: &Engine, kind: EntityKind, pairs: &[String]) -> anyhow::Result<()> {
    info!(%kind, "command add");
    let fields = parse_fields(pairs)?;
    let (temp, ticket) = engine.add(kind, fields);

    match ticket.wait().await {
        Some(Outcome::Confirmed) => {
            let id = engine
                .find(kind, &temp)
                .map(|e| e.id.to_string())
                .unwrap_or_else(|| temp.to_string());
            println!("Created {kind} {id}.");
        }
        other => debug!(?other, "add did not confirm"),
    }
    Ok(())
}

async fn cmd_update(
    engine: &Engine,
    kind: EntityKind,
    id: &EntityId,
    field: &str,
    raw: &str,
) -> anyhow::Result<()> {
    info!(%kind, %id, field, "command update");
    let ticket = engine
        .update(kind, id, field, parse_value(raw))
        .ok_or_else(|| anyhow!("{kind} {id} not found"))?;

    if ticket.wait().await == Some(Outcome::Confirmed) {
        println!("Updated {field} of {kind} {id}.");
    }
    Ok(())
}

async fn cmd_delete(engine: &Engine, kind: EntityKind, ids: &[EntityId]) -> anyhow::Result<()> {
    info!(%kind, count = ids.len(), "command delete");
    let Some(handle) = engine.delete_multiple(kind, ids) else {
        println!("Nothing to delete.");
        return Ok(());
    };

    let remaining = (handle.expires_at() - chrono::Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    println!(
        "Deleting {} {}(s); press Ctrl-C within {:.1}s to undo.",
        handle.count(),
        kind,
        remaining.as_secs_f64()
    );

    let state = tokio::select! {
        state = handle.settled() => state,
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("failed to listen for Ctrl-C")?;
            if handle.undo() {
                info!(batch = %handle.batch(), "undo requested from terminal");
            }
            handle.settled().await
        }
    };

    match state {
        DeletionState::Reverted => println!("Undone; nothing was deleted."),
        DeletionState::Committed => println!("Deleted {} {}(s).", handle.count(), kind),
        DeletionState::CommitFailed => println!("Delete failed; entities restored."),
        DeletionState::Active | DeletionState::Committing => {
            warn!(?state, "deletion did not settle")
        }
    }
    Ok(())
}

async fn cmd_tag(engine: &Engine, name: &str) -> anyhow::Result<()> {
    info!("command tag");
    match engine.add_tag(name) {
        (TagAddOutcome::Created(tag), ticket) => {
            if let Some(ticket) = ticket {
                ticket.wait().await;
            }
            println!("Created tag {tag}.");
        }
        (TagAddOutcome::AlreadyExists(tag), _) => println!("Tag {tag} already exists."),
        (TagAddOutcome::Rejected, _) => println!("Empty tag ignored."),
    }
    Ok(())
}

async fn cmd_check(engine: &Engine, id: &EntityId, date: Option<&str>) -> anyhow::Result<()> {
    info!(%id, "command check");
    let date = match date {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .with_context(|| format!("invalid date {raw:?}; expected YYYY-MM-DD"))?,
        None => Local::now().date_naive(),
    };

    let ticket = engine
        .toggle_habit(id, date)
        .ok_or_else(|| anyhow!("habit {id} not found"))?;
    ticket.wait().await;

    let today = Local::now().date_naive();
    if let Some(streak) = engine.habit_streak(id, today) {
        println!("Habit {id}: current streak {streak} day(s).");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn field_pairs_parse_json_or_fall_back_to_text() {
        let fields = parse_fields(&[
            "text=BUY MILK".to_string(),
            "streak=3".to_string(),
            "tags=[\"HOME\"]".to_string(),
        ])
        .expect("fields");

        assert_eq!(fields["text"], json!("BUY MILK"));
        assert_eq!(fields["streak"], json!(3));
        assert_eq!(fields["tags"], json!(["HOME"]));

        assert!(parse_fields(&["id=4".to_string()]).is_err());
        assert!(parse_fields(&["no-equals".to_string()]).is_err());
    }

    #[test]
    fn habits_render_with_streak() {
        let mut fields = Fields::new();
        fields.insert("text".to_string(), json!("READ"));
        fields.insert(
            "completions".to_string(),
            json!([{ "date": "2025-03-01", "completed": true }]),
        );
        let habit = Entity::new(EntityKind::Habit, EntityId::confirmed("7"), fields);
        let today = NaiveDate::from_ymd_opt(2025, 3, 1).expect("date");

        let line = render_entity(&habit, today);
        assert!(line.starts_with("7  "));
        assert!(line.contains("text=READ"));
        assert!(line.ends_with("current_streak=1"));
    }
}
