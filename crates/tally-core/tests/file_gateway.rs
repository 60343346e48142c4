use std::sync::Arc;

use serde_json::json;
use tally_core::gateway::{FileGateway, RemoteGateway};
use tally_core::mutation::Outcome;
use tally_core::undo::DeletionState;
use tally_core::{Engine, EngineSettings, Entity, EntityId, EntityKind, Fields};
use tempfile::tempdir;

fn task(text: &str) -> Entity {
    let mut fields = Fields::new();
    fields.insert("text".to_string(), json!(text));
    Entity::new(EntityKind::Task, EntityId::Temporary(1), fields)
}

#[tokio::test]
async fn records_survive_reopen() {
    let temp = tempdir().expect("tempdir");
    let gateway = FileGateway::open(temp.path()).expect("open gateway");

    let first = gateway.create(&task("A")).await.expect("create");
    let second = gateway.create(&task("B")).await.expect("create");
    assert_eq!(first.as_deref(), Some("1"));
    assert_eq!(second.as_deref(), Some("2"));

    gateway
        .update(EntityKind::Task, "2", "status", &json!("DONE"))
        .await
        .expect("update");
    gateway.delete(EntityKind::Task, "1").await.expect("delete");
    gateway
        .persist_tag_set(&["HOME".to_string(), "WORK".to_string()])
        .await
        .expect("persist tags");

    let reopened = FileGateway::open(temp.path()).expect("reopen gateway");
    let tasks = reopened.fetch_all(EntityKind::Task).await.expect("fetch");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, EntityId::confirmed("2"));
    assert_eq!(tasks[0].field("status"), Some(&json!("DONE")));
    assert_eq!(
        reopened.fetch_tags().await.expect("tags"),
        vec!["HOME".to_string(), "WORK".to_string()]
    );
    assert!(reopened.path_for(EntityKind::Habit).exists());
}

#[tokio::test]
async fn missing_records_are_errors() {
    let temp = tempdir().expect("tempdir");
    let gateway = FileGateway::open(temp.path()).expect("open gateway");

    assert!(gateway.delete(EntityKind::Goal, "4").await.is_err());
    assert!(
        gateway
            .update(EntityKind::Goal, "4", "text", &json!("X"))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn engine_round_trip_through_files() {
    let temp = tempdir().expect("tempdir");
    let settings = EngineSettings {
        grace: std::time::Duration::ZERO,
        ..EngineSettings::default()
    };

    {
        let gateway = Arc::new(FileGateway::open(temp.path()).expect("open gateway"));
        let engine = Engine::new(gateway, settings.clone());
        engine.hydrate().await;

        let mut body = Fields::new();
        body.insert("text".to_string(), json!("WATER PLANTS"));
        let (_, ticket) = engine.add(EntityKind::Reminder, body);
        assert_eq!(ticket.wait().await, Some(Outcome::Confirmed));

        let mut body = Fields::new();
        body.insert("text".to_string(), json!("OLD"));
        let (temp_id, ticket) = engine.add(EntityKind::Reminder, body);
        assert_eq!(ticket.wait().await, Some(Outcome::Confirmed));
        let handle = engine
            .delete(EntityKind::Reminder, &temp_id)
            .expect("undo offered");
        assert_eq!(handle.settled().await, DeletionState::Committed);
    }

    let gateway = Arc::new(FileGateway::open(temp.path()).expect("reopen gateway"));
    let engine = Engine::new(gateway, settings);
    engine.hydrate().await;
    let reminders = engine.entities(EntityKind::Reminder);
    assert_eq!(reminders.len(), 1);
    assert_eq!(reminders[0].text(), Some("WATER PLANTS"));
    assert_eq!(reminders[0].id, EntityId::confirmed("1"));
}
