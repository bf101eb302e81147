use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use tunesync::db::{self, TaskSpec};
use tunesync::model::{TaskKind, TaskStatus};
use tunesync::relay::ws::{
    handle_ack, CLOSE_INVALID_JSON, CLOSE_INVALID_MESSAGE_FORMAT,
    CLOSE_NOTIFICATION_DOES_NOT_EXIST, CLOSE_USER_DOES_NOT_EXIST,
};
use tunesync::relay::{BroadcastBus, NotificationRelay};

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// A user with one running task and its started notification.
async fn seed_notification(pool: &sqlx::SqlitePool) -> (i64, i64) {
    let user_id = db::get_or_create_user(pool, "u7", Some("Seven")).await.unwrap();
    let task_id = db::enqueue_task(pool, &TaskSpec::new(TaskKind::Analyze, user_id).ref_id(1))
        .await
        .unwrap();
    let task = db::get_task(pool, task_id).await.unwrap().unwrap();

    let relay = NotificationRelay::new(
        pool.clone(),
        Arc::new(BroadcastBus::new(16)),
        Duration::ZERO,
    );
    let notification = relay.on_start(&task).await.unwrap();
    (user_id, notification.id)
}

#[tokio::test]
async fn acknowledgement_happy_path() {
    let pool = setup_pool().await;
    let (user_id, notification_id) = seed_notification(&pool).await;

    let msg = json!({
        "user_id": user_id.to_string(),
        "notification_id": notification_id.to_string(),
        "message": "seen",
    })
    .to_string();

    let response = handle_ack(&pool, &msg).await.unwrap();
    let v: serde_json::Value = serde_json::from_str(&response).unwrap();
    assert_eq!(v["status"], "acknowledged");

    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM acknowledgements WHERE notification_id = ? AND user_id = ?",
    )
    .bind(notification_id)
    .bind(user_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1);

    // repeat ack: still acknowledged, still one row
    let response = handle_ack(&pool, &msg).await.unwrap();
    let v: serde_json::Value = serde_json::from_str(&response).unwrap();
    assert_eq!(v["status"], "acknowledged");
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM acknowledgements")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn malformed_message_closes_with_format_code() {
    let pool = setup_pool().await;
    seed_notification(&pool).await;

    // missing notification_id
    let failure = handle_ack(&pool, r#"{"user_id":"7"}"#).await.unwrap_err();
    assert_eq!(failure.close_code, CLOSE_INVALID_MESSAGE_FORMAT);
    let v: serde_json::Value = serde_json::from_str(&failure.payload).unwrap();
    assert!(v["error"].is_string());

    // ids must be numeric strings
    let failure = handle_ack(&pool, r#"{"user_id":"abc","notification_id":"1"}"#)
        .await
        .unwrap_err();
    assert_eq!(failure.close_code, CLOSE_INVALID_MESSAGE_FORMAT);
}

#[tokio::test]
async fn invalid_json_closes_with_json_code() {
    let pool = setup_pool().await;
    let failure = handle_ack(&pool, "{not json").await.unwrap_err();
    assert_eq!(failure.close_code, CLOSE_INVALID_JSON);
}

#[tokio::test]
async fn unknown_user_and_notification_close_codes_are_distinct() {
    let pool = setup_pool().await;
    let (user_id, notification_id) = seed_notification(&pool).await;

    let failure = handle_ack(
        &pool,
        &json!({ "user_id": "9999", "notification_id": notification_id.to_string() }).to_string(),
    )
    .await
    .unwrap_err();
    assert_eq!(failure.close_code, CLOSE_USER_DOES_NOT_EXIST);

    let failure = handle_ack(
        &pool,
        &json!({ "user_id": user_id.to_string(), "notification_id": "9999" }).to_string(),
    )
    .await
    .unwrap_err();
    assert_eq!(failure.close_code, CLOSE_NOTIFICATION_DOES_NOT_EXIST);

    // nothing was written along the failure paths
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM acknowledgements")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn lifecycle_events_carry_serialized_notification() {
    let pool = setup_pool().await;
    let bus = Arc::new(BroadcastBus::new(16));
    let relay = NotificationRelay::new(pool.clone(), bus.clone(), Duration::ZERO);
    let mut events = bus.subscribe();

    let user_id = db::get_or_create_user(&pool, "u1", None).await.unwrap();
    let task_id = db::enqueue_task(
        &pool,
        &TaskSpec::new(TaskKind::SyncPlaylist, user_id).external_id("p1"),
    )
    .await
    .unwrap();
    let task = db::get_task(&pool, task_id).await.unwrap().unwrap();

    let notification = relay.on_start(&task).await.unwrap();

    let started = events.recv().await.unwrap();
    let v: serde_json::Value = serde_json::from_str(&started.payload).unwrap();
    assert_eq!(v["event"], "started");
    assert_eq!(v["notification"]["id"], notification.id);
    assert_eq!(v["notification"]["resource"], "playlist");
    assert_eq!(v["notification"]["resource_id"], "p1");
    assert_eq!(v["notification"]["operation"], "sync-playlist");
    assert_eq!(v["notification"]["extras"], "{}");

    // result payload written before completion is visible in the event
    db::set_notification_extras(&pool, task_id, r#"{"chains": 2}"#)
        .await
        .unwrap();
    relay.on_finish(&task, TaskStatus::Success).await.unwrap();

    let completed = events.recv().await.unwrap();
    let v: serde_json::Value = serde_json::from_str(&completed.payload).unwrap();
    assert_eq!(v["event"], "completed");
    assert_eq!(v["status"], "SUCCESS");
    assert_eq!(v["notification"]["extras"]["chains"], 2);
}

#[tokio::test]
async fn group_notifications_bind_by_group_key() {
    let pool = setup_pool().await;
    let bus = Arc::new(BroadcastBus::new(16));
    let relay = NotificationRelay::new(pool.clone(), bus.clone(), Duration::ZERO);

    let user_id = db::get_or_create_user(&pool, "u1", None).await.unwrap();
    let notification = relay
        .on_start_group(user_id, "group-abc", "library-sync")
        .await
        .unwrap();
    assert_eq!(notification.group_key.as_deref(), Some("group-abc"));
    assert!(notification.task_id.is_none());

    relay
        .on_finish_group("group-abc", TaskStatus::Success)
        .await
        .unwrap();
    let refreshed = db::get_notification(&pool, notification.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.status, TaskStatus::Success);
}
