//! Postgres-backed store tests. These exercise the generated schema and the
//! `process_work_batch` function against a real database.
//!
//! They are ignored by default; point DATABASE_URL at a scratch database and
//! run: cargo test --test pg_store_test -- --ignored

use chrono::Utc;
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use workhive::coordination_store::{
    migrate::{Migrator, StepOutcome},
    CheckpointStatus, InstanceIdentity, MessageAssociation, NewOutboxMessage, PerspectiveReport,
    PgWorkStore, SchemaConfig, WorkBatchOptions, WorkBatchRequest, WorkStore,
};

fn db_config() -> Option<workhive::db_pool::DbConfig> {
    init_tracing();
    match workhive::db_pool::DbConfig::from_env("pg-store-test") {
        Ok(config) => Some(config),
        Err(_) => {
            eprintln!("DATABASE_URL not set; skipping");
            None
        }
    }
}

async fn connect() -> Option<PgPool> {
    let config = db_config()?;
    Some(
        workhive::db_pool::create_pool(&config)
            .await
            .expect("database reachable"),
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn scratch_schema(tag: &str) -> SchemaConfig {
    SchemaConfig::with_prefix(format!("wht_{}_", tag))
}

fn instance(name: &str) -> InstanceIdentity {
    InstanceIdentity {
        instance_id: Uuid::now_v7(),
        service_name: name.to_string(),
        host_name: "pg-test".to_string(),
        process_id: std::process::id() as i32,
        metadata: serde_json::Value::Null,
    }
}

fn request(me: &InstanceIdentity) -> WorkBatchRequest {
    WorkBatchRequest::new(
        me.clone(),
        WorkBatchOptions::new(Utc::now()).with_lease(Duration::from_secs(30)),
    )
}

fn event_row(stream_id: Uuid, event_type: &str, payload: serde_json::Value) -> NewOutboxMessage {
    let message_id = Uuid::now_v7();
    NewOutboxMessage {
        message_id,
        destination: "products".to_string(),
        event_type: event_type.to_string(),
        envelope_type: event_type.to_string(),
        envelope: json!({"MessageId": message_id, "Payload": payload, "Hops": []}),
        metadata: json!({"aggregate_type": "product"}),
        stream_id,
        partition_number: 0,
        is_event: true,
    }
}

#[tokio::test]
#[serial]
#[ignore = "requires DATABASE_URL"]
async fn schema_applies_and_batch_round_trips() {
    let Some(config) = db_config() else { return };
    let store = PgWorkStore::connect(&config, scratch_schema("roundtrip"))
        .await
        .expect("database reachable");
    store.apply_schema().await.unwrap();
    store
        .register_associations(&[MessageAssociation::perspective(
            "ProductCreated, Inventory",
            "inventory-product",
            "inventory",
        )])
        .await
        .unwrap();

    let me = instance("pg-roundtrip");
    let stream = Uuid::now_v7();

    // Cycle 1: insert and claim.
    let mut req = request(&me);
    req.new_messages.outbox.push(event_row(
        stream,
        "ProductCreated, Inventory, Version=2.0.0.0",
        json!({"name": "widget", "stock": 75}),
    ));
    let reply = store.process_batch(req).await.unwrap();
    assert_eq!(reply.outbox_work.len(), 1);
    assert_eq!(reply.outbox_work[0].attempts, 1);
    let message_id = reply.outbox_work[0].message_id;

    // Cycle 2: the event persists, fans out and the work is claimed.
    let reply = store.process_batch(request(&me)).await.unwrap();
    assert_eq!(reply.perspective_work.len(), 1);
    let work = &reply.perspective_work[0];
    assert_eq!(work.event_id, message_id);
    assert_eq!(work.event_data, json!({"name": "widget", "stock": 75}));
    assert_eq!(work.version, 1);

    let events = store.load_events(stream).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].aggregate_type, "product");

    // Cycle 3: report completions; checkpoint advances.
    let mut req = request(&me);
    req.transitions.outbox_completions.push(message_id);
    req.transitions
        .perspective_event_completions
        .push(work.event_work_id);
    req.transitions.perspective_completions.push(PerspectiveReport {
        stream_id: stream,
        perspective_name: "inventory-product".to_string(),
        last_event_id: Some(work.event_id),
        error: None,
    });
    store.process_batch(req).await.unwrap();

    let checkpoint = store
        .checkpoint(stream, "inventory-product")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.status, CheckpointStatus::Completed);
    assert_eq!(checkpoint.last_event_id, Some(message_id));

    let row = store.outbox_message(message_id).await.unwrap().unwrap();
    assert!(row.status & 4 != 0);
    assert!(row.lease_expiry.is_none());
}

#[tokio::test]
#[serial]
#[ignore = "requires DATABASE_URL"]
async fn fuzzy_association_matching_in_sql() {
    let Some(pool) = connect().await else { return };
    let store = PgWorkStore::new(pool.clone(), scratch_schema("fuzzy"));
    store.apply_schema().await.unwrap();

    // Direct checks on the normalizer.
    let norm: Option<String> = sqlx::query_scalar(&format!(
        "SELECT {}normalize_message_type($1)",
        store.schema().infra_prefix
    ))
    .bind("T, A, Version=2.0.0.0, Culture=neutral, PublicKeyToken=abc")
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(norm.as_deref(), Some("T, A"));

    let bare: Option<String> = sqlx::query_scalar(&format!(
        "SELECT {}normalize_message_type($1)",
        store.schema().infra_prefix
    ))
    .bind("T")
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(bare.is_none(), "bare type names have no normalized form");

    // Scenario: association for "T, A" fires, association for "T, B" does
    // not.
    store
        .register_associations(&[
            MessageAssociation::perspective("T, A", "matching-perspective", "svc"),
            MessageAssociation::perspective("T, B", "other-perspective", "svc"),
        ])
        .await
        .unwrap();

    let me = instance("pg-fuzzy");
    let stream = Uuid::now_v7();
    let mut req = request(&me);
    req.new_messages.outbox.push(event_row(
        stream,
        "T, A, Version=2.0.0.0, Culture=neutral, PublicKeyToken=abc",
        json!({}),
    ));
    store.process_batch(req).await.unwrap();
    store.process_batch(request(&me)).await.unwrap();

    assert_eq!(
        store
            .perspective_events(stream, "matching-perspective")
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(store
        .perspective_events(stream, "other-perspective")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
#[serial]
#[ignore = "requires DATABASE_URL"]
async fn outbox_rows_commit_and_roll_back_with_business_data() {
    let Some(pool) = connect().await else { return };
    let schema = scratch_schema("txn");
    let store = PgWorkStore::new(pool.clone(), schema.clone());
    store.apply_schema().await.unwrap();

    let business_table = schema.table("txn_probe");
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (id uuid PRIMARY KEY)",
        business_table
    ))
    .execute(&pool)
    .await
    .unwrap();

    let stream = Uuid::now_v7();

    // Rolled back: neither the business row nor the outbox row survives.
    let rolled_back = event_row(stream, "ProductCreated, Inventory", json!({"n": 1}));
    let probe_id = Uuid::now_v7();
    {
        let mut tx = pool.begin().await.unwrap();
        sqlx::query(&format!("INSERT INTO {} (id) VALUES ($1)", business_table))
            .bind(probe_id)
            .execute(&mut *tx)
            .await
            .unwrap();
        store
            .enqueue_outbox_tx(&mut tx, std::slice::from_ref(&rolled_back))
            .await
            .unwrap();
        tx.rollback().await.unwrap();
    }
    assert!(store
        .outbox_message(rolled_back.message_id)
        .await
        .unwrap()
        .is_none());
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT count(*) FROM {} WHERE id = $1",
        business_table
    ))
    .bind(probe_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 0);

    // Committed: the batch function sees both together.
    let committed = event_row(stream, "ProductCreated, Inventory", json!({"n": 2}));
    {
        let mut tx = pool.begin().await.unwrap();
        sqlx::query(&format!("INSERT INTO {} (id) VALUES ($1)", business_table))
            .bind(Uuid::now_v7())
            .execute(&mut *tx)
            .await
            .unwrap();
        store
            .enqueue_outbox_tx(&mut tx, std::slice::from_ref(&committed))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }
    let me = instance("pg-txn");
    let reply = store.process_batch(request(&me)).await.unwrap();
    assert!(reply
        .outbox_work
        .iter()
        .any(|w| w.message_id == committed.message_id));
}

#[tokio::test]
#[serial]
#[ignore = "requires DATABASE_URL"]
async fn migrator_steps_and_resumes() {
    let Some(pool) = connect().await else { return };
    let schema = scratch_schema("migrate");
    let journal_path = std::env::temp_dir().join(format!(
        "wh-pg-journal-{}.json",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&journal_path);

    let migrator = Migrator::new(schema, &journal_path);
    migrator.init().unwrap();

    // Two single steps, then resume to the end.
    assert!(matches!(
        migrator.step(&pool).await.unwrap(),
        StepOutcome::Applied(_)
    ));
    assert!(matches!(
        migrator.step(&pool).await.unwrap(),
        StepOutcome::Applied(_)
    ));
    let applied = migrator.resume(&pool).await.unwrap();
    assert!(applied > 0);
    assert!(matches!(
        migrator.step(&pool).await.unwrap(),
        StepOutcome::AlreadyComplete
    ));

    std::fs::remove_file(&journal_path).unwrap();
}
