// ABOUTME: Integration tests for trigger capture, pull-apply replication, resync and schema sync
// ABOUTME: Needs two live PostgreSQL databases; run with --ignored and TEST_LEADER_URL/TEST_FOLLOWER_URL set

use std::env;
use tokio_postgres::Client;
use trigger_replicator::capture::trigger_name;
use trigger_replicator::log_store::{Direction, LogStore, OperationType};
use trigger_replicator::{EngineConfig, RecordRegistry, ReplicationEngine};

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let leader = env::var("TEST_LEADER_URL").ok()?;
    let follower = env::var("TEST_FOLLOWER_URL").ok()?;
    Some((leader, follower))
}

fn test_table_name(suffix: &str) -> String {
    format!("trigger_repl_test_{}", suffix)
}

async fn connect_both(leader_url: &str, follower_url: &str) -> (Client, Client) {
    let leader = trigger_replicator::postgres::connect(leader_url)
        .await
        .expect("Failed to connect to leader");
    let follower = trigger_replicator::postgres::connect(follower_url)
        .await
        .expect("Failed to connect to follower");
    (leader, follower)
}

/// Create the same table on both databases.
async fn setup_test_table(leader: &Client, follower: &Client, table: &str) {
    let ddl = format!(
        r#"
        DROP TABLE IF EXISTS "public"."{0}" CASCADE;
        CREATE TABLE "public"."{0}" (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 0,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        table
    );
    leader.batch_execute(&ddl).await.expect("leader setup");
    follower.batch_execute(&ddl).await.expect("follower setup");
}

async fn cleanup_test_table(leader: &Client, follower: &Client, table: &str) {
    let ddl = format!(r#"DROP TABLE IF EXISTS "public"."{}" CASCADE"#, table);
    let _ = leader.batch_execute(&ddl).await;
    let _ = follower.batch_execute(&ddl).await;
}

fn engine_for(leader_url: &str, follower_url: &str, follower_id: &str, tables: &str) -> ReplicationEngine {
    let config = format!(
        r#"
follower_id = "{}"
leader_url = "{}"
follower_url = "{}"
retry_base_delay_ms = 10
{}
"#,
        follower_id, leader_url, follower_url, tables
    );
    let config = EngineConfig::from_toml(&config).expect("config");
    ReplicationEngine::new(config, RecordRegistry::new()).expect("engine")
}

async fn row_name(client: &Client, table: &str, id: i32) -> Option<String> {
    client
        .query_opt(
            &format!(r#"SELECT name FROM "public"."{}" WHERE id = $1"#, table),
            &[&id],
        )
        .await
        .expect("row lookup")
        .map(|row| row.get(0))
}

async fn row_count(client: &Client, table: &str) -> i64 {
    client
        .query_one(&format!(r#"SELECT COUNT(*) FROM "public"."{}""#, table), &[])
        .await
        .expect("count")
        .get(0)
}

/// Test: installing bookkeeping and triggers twice is harmless
#[tokio::test]
#[ignore]
async fn test_prepare_databases_is_idempotent() {
    let (leader_url, follower_url) =
        get_test_urls().expect("TEST_LEADER_URL and TEST_FOLLOWER_URL must be set");
    let (leader, follower) = connect_both(&leader_url, &follower_url).await;
    let table = test_table_name("prepare");
    setup_test_table(&leader, &follower, &table).await;

    let engine = engine_for(
        &leader_url,
        &follower_url,
        "itest_prepare",
        &format!("[[tables]]\nname = \"{}\"\ndirection = \"bidirectional\"", table),
    );

    let first = engine.prepare_databases().await.expect("first prepare");
    assert_eq!(first.len(), 2, "one report per side");
    assert!(first.iter().all(|r| r.skipped_reason.is_none()));

    let second = engine.prepare_databases().await.expect("second prepare");
    assert!(second.iter().all(|r| r.created.is_empty()));

    cleanup_test_table(&leader, &follower, &table).await;
}

/// Test: leader insert, update and delete reach the follower without echoing back
#[tokio::test]
#[ignore]
async fn test_leader_changes_reach_follower() {
    let (leader_url, follower_url) =
        get_test_urls().expect("TEST_LEADER_URL and TEST_FOLLOWER_URL must be set");
    let (leader, follower) = connect_both(&leader_url, &follower_url).await;
    let table = test_table_name("downstream");
    setup_test_table(&leader, &follower, &table).await;

    let follower_id = "itest_downstream";
    let engine = engine_for(
        &leader_url,
        &follower_url,
        follower_id,
        &format!("[[tables]]\nname = \"{}\"\ndirection = \"bidirectional\"", table),
    );
    engine.prepare_databases().await.expect("prepare");

    leader
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{0}" (id, name) VALUES (1, 'bolts'), (2, 'nuts');
               UPDATE "public"."{0}" SET name = 'hex bolts' WHERE id = 1;"#,
            table
        ))
        .await
        .expect("leader writes");

    let results = engine.replicate_once(&table).await.expect("replicate");
    let down = results
        .iter()
        .find(|(d, _)| *d == Direction::LeaderToFollower)
        .map(|(_, stats)| stats.clone())
        .expect("leader to follower stats");
    assert_eq!(down.failed, 0);
    assert_eq!(row_name(&follower, &table, 1).await.as_deref(), Some("hex bolts"));
    assert_eq!(row_name(&follower, &table, 2).await.as_deref(), Some("nuts"));

    // Applied changes are suppressed on the follower and never queued back.
    let upstream = LogStore::new(&follower, follower_id, Direction::FollowerToLeader);
    assert_eq!(upstream.backlog(&table).await.expect("backlog"), 0);

    leader
        .batch_execute(&format!(r#"DELETE FROM "public"."{}" WHERE id = 2"#, table))
        .await
        .expect("leader delete");
    engine.replicate_once(&table).await.expect("replicate delete");
    assert_eq!(row_name(&follower, &table, 2).await, None);

    let downstream = LogStore::new(&leader, follower_id, Direction::LeaderToFollower);
    assert_eq!(downstream.backlog(&table).await.expect("backlog"), 0);

    cleanup_test_table(&leader, &follower, &table).await;
}

/// Test: follower writes on a bidirectional table reach the leader
#[tokio::test]
#[ignore]
async fn test_follower_changes_reach_leader() {
    let (leader_url, follower_url) =
        get_test_urls().expect("TEST_LEADER_URL and TEST_FOLLOWER_URL must be set");
    let (leader, follower) = connect_both(&leader_url, &follower_url).await;
    let table = test_table_name("upstream");
    setup_test_table(&leader, &follower, &table).await;

    let engine = engine_for(
        &leader_url,
        &follower_url,
        "itest_upstream",
        &format!("[[tables]]\nname = \"{}\"\ndirection = \"follower_to_leader\"", table),
    );
    engine.prepare_databases().await.expect("prepare");

    follower
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{}" (id, name, quantity) VALUES (7, 'counted', 12)"#,
            table
        ))
        .await
        .expect("follower insert");

    let results = engine.replicate_once(&table).await.expect("replicate");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, Direction::FollowerToLeader);
    assert_eq!(results[0].1.applied, 1);
    assert_eq!(row_name(&leader, &table, 7).await.as_deref(), Some("counted"));

    cleanup_test_table(&leader, &follower, &table).await;
}

/// Test: a rejected change lands in the failure ledger and replays after recovery
#[tokio::test]
#[ignore]
async fn test_failed_change_is_recorded_and_recovered() {
    let (leader_url, follower_url) =
        get_test_urls().expect("TEST_LEADER_URL and TEST_FOLLOWER_URL must be set");
    let (leader, follower) = connect_both(&leader_url, &follower_url).await;
    let table = test_table_name("recovery");
    setup_test_table(&leader, &follower, &table).await;

    let engine = engine_for(
        &leader_url,
        &follower_url,
        "itest_recovery",
        &format!("[[tables]]\nname = \"{}\"", table),
    );
    engine.prepare_databases().await.expect("prepare");

    follower
        .batch_execute(&format!(
            r#"ALTER TABLE "public"."{0}" ADD CONSTRAINT {0}_qty CHECK (quantity < 100)"#,
            table
        ))
        .await
        .expect("follower constraint");
    leader
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{}" (id, name, quantity) VALUES (1, 'bulk', 500)"#,
            table
        ))
        .await
        .expect("leader insert");

    let results = engine.replicate_once(&table).await.expect("replicate");
    assert_eq!(results[0].1.failed, 1);
    assert_eq!(row_name(&follower, &table, 1).await, None);

    let failures = engine.list_failed_data(Some(&table)).await.expect("list");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].retry_count, 3, "three attempts before ledgering");
    assert_eq!(failures[0].direction, Direction::LeaderToFollower);
    let failed_id = failures[0].log_entry_id;

    // The cursor moved past the failure, so another pass does not ledger it twice.
    engine.replicate_once(&table).await.expect("second pass");
    assert_eq!(
        engine.list_failed_data(Some(&table)).await.expect("list").len(),
        1
    );

    follower
        .batch_execute(&format!(
            r#"ALTER TABLE "public"."{0}" DROP CONSTRAINT {0}_qty"#,
            table
        ))
        .await
        .expect("drop constraint");

    let report = engine
        .manual_retry_failed_data(Some(&table))
        .await
        .expect("recovery");
    assert_eq!(report.tables.len(), 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(report.tables[0].earliest_failed_id, failed_id);
    assert_eq!(report.tables[0].new_cursor, failed_id - 1);
    let downstream = LogStore::new(&leader, "itest_recovery", Direction::LeaderToFollower);
    assert_eq!(downstream.cursor(&table).await.expect("cursor"), failed_id - 1);

    engine.replicate_once(&table).await.expect("replay");
    assert_eq!(row_name(&follower, &table, 1).await.as_deref(), Some("bulk"));
    assert!(engine
        .list_failed_data(Some(&table))
        .await
        .expect("list")
        .is_empty());

    cleanup_test_table(&leader, &follower, &table).await;
}

/// Test: a resync copies existing rows and skips log entries the copy already covers
#[tokio::test]
#[ignore]
async fn test_resync_copies_rows_and_moves_cursor() {
    let (leader_url, follower_url) =
        get_test_urls().expect("TEST_LEADER_URL and TEST_FOLLOWER_URL must be set");
    let (leader, follower) = connect_both(&leader_url, &follower_url).await;
    let table = test_table_name("resync");
    setup_test_table(&leader, &follower, &table).await;

    let engine = engine_for(
        &leader_url,
        &follower_url,
        "itest_resync",
        &format!("[[tables]]\nname = \"{}\"", table),
    );
    engine.prepare_databases().await.expect("prepare");

    leader
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{}" (id, name, quantity)
               SELECT g, 'item ' || g, g FROM generate_series(1, 2500) g"#,
            table
        ))
        .await
        .expect("seed leader");
    follower
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{}" (id, name) VALUES (9999, 'stale')"#,
            table
        ))
        .await
        .expect("seed follower");

    let load = engine
        .sync_table_from_leader_to_follower(&table)
        .await
        .expect("resync");
    assert_eq!(load.source_rows, 2500);
    assert_eq!(load.rows_copied, 2500);
    assert_eq!(row_count(&follower, &table).await, 2500);
    assert_eq!(row_name(&follower, &table, 9999).await, None);

    let results = engine.replicate_once(&table).await.expect("replicate");
    assert_eq!(results[0].1.fetched, 0, "copied entries are not replayed");

    cleanup_test_table(&leader, &follower, &table).await;
}

/// Test: schema sync adds a leader column and withholds destructive changes
#[tokio::test]
#[ignore]
async fn test_schema_sync_adds_missing_column() {
    let (leader_url, follower_url) =
        get_test_urls().expect("TEST_LEADER_URL and TEST_FOLLOWER_URL must be set");
    let (leader, follower) = connect_both(&leader_url, &follower_url).await;
    let table = test_table_name("schema");
    setup_test_table(&leader, &follower, &table).await;

    leader
        .batch_execute(&format!(
            r#"ALTER TABLE "public"."{}" ADD COLUMN sku TEXT"#,
            table
        ))
        .await
        .expect("leader alter");
    follower
        .batch_execute(&format!(
            r#"ALTER TABLE "public"."{}" ADD COLUMN local_note TEXT"#,
            table
        ))
        .await
        .expect("follower alter");

    let engine = engine_for(
        &leader_url,
        &follower_url,
        "itest_schema",
        &format!("[[tables]]\nname = \"{}\"", table),
    );

    let plan = engine
        .manual_sync_table_schema(&table, true)
        .await
        .expect("dry run");
    assert!(plan.dry_run);
    assert!(plan.statements.iter().any(|s| s.contains("sku")));
    assert!(plan.withheld.iter().any(|s| s.contains("local_note")));

    let applied = engine.sync_table_schema(&table).await.expect("sync");
    assert!(!applied.dry_run);

    let columns: Vec<String> = follower
        .query(
            "SELECT column_name::text FROM information_schema.columns
             WHERE table_schema = 'public' AND table_name = $1",
            &[&table],
        )
        .await
        .expect("columns")
        .iter()
        .map(|row| row.get(0))
        .collect();
    assert!(columns.contains(&"sku".to_string()));
    assert!(columns.contains(&"local_note".to_string()));

    cleanup_test_table(&leader, &follower, &table).await;
}

/// Test: recovering a failed update does not bring back a row deleted afterwards
#[tokio::test]
#[ignore]
async fn test_recovery_keeps_later_delete() {
    let (leader_url, follower_url) =
        get_test_urls().expect("TEST_LEADER_URL and TEST_FOLLOWER_URL must be set");
    let (leader, follower) = connect_both(&leader_url, &follower_url).await;
    let table = test_table_name("recovery_delete");
    setup_test_table(&leader, &follower, &table).await;

    let engine = engine_for(
        &leader_url,
        &follower_url,
        "itest_recovery_delete",
        &format!("[[tables]]\nname = \"{}\"", table),
    );
    engine.prepare_databases().await.expect("prepare");

    leader
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{}" (id, name, quantity) VALUES (1, 'widget', 5)"#,
            table
        ))
        .await
        .expect("leader insert");
    engine.replicate_once(&table).await.expect("initial copy");
    assert_eq!(row_name(&follower, &table, 1).await.as_deref(), Some("widget"));

    follower
        .batch_execute(&format!(
            r#"ALTER TABLE "public"."{0}" ADD CONSTRAINT {0}_qty CHECK (quantity < 100)"#,
            table
        ))
        .await
        .expect("follower constraint");
    leader
        .batch_execute(&format!(
            r#"UPDATE "public"."{}" SET quantity = 500 WHERE id = 1"#,
            table
        ))
        .await
        .expect("leader update");
    let results = engine.replicate_once(&table).await.expect("failing pass");
    assert_eq!(results[0].1.failed, 1);

    leader
        .batch_execute(&format!(r#"DELETE FROM "public"."{}" WHERE id = 1"#, table))
        .await
        .expect("leader delete");
    engine.replicate_once(&table).await.expect("delete pass");
    assert_eq!(row_name(&follower, &table, 1).await, None);

    follower
        .batch_execute(&format!(
            r#"ALTER TABLE "public"."{0}" DROP CONSTRAINT {0}_qty"#,
            table
        ))
        .await
        .expect("drop constraint");

    let report = engine
        .manual_retry_failed_data(Some(&table))
        .await
        .expect("recovery");
    assert_eq!(report.requeued, 0);
    assert_eq!(report.superseded, 1);

    engine.replicate_once(&table).await.expect("replay");
    assert_eq!(row_name(&follower, &table, 1).await, None, "deleted row stays deleted");
    assert!(engine
        .list_failed_data(Some(&table))
        .await
        .expect("list")
        .is_empty());

    cleanup_test_table(&leader, &follower, &table).await;
}

/// Test: concurrent edits of one row settle on the winner on both sides
#[tokio::test]
#[ignore]
async fn test_bidirectional_conflict_converges() {
    let (leader_url, follower_url) =
        get_test_urls().expect("TEST_LEADER_URL and TEST_FOLLOWER_URL must be set");
    let (leader, follower) = connect_both(&leader_url, &follower_url).await;
    let table = test_table_name("converge");
    setup_test_table(&leader, &follower, &table).await;

    let follower_id = "itest_converge";
    let engine = engine_for(
        &leader_url,
        &follower_url,
        follower_id,
        &format!(
            "[[tables]]\nname = \"{}\"\ndirection = \"bidirectional\"\nconflict_strategy = \"prefer_leader\"",
            table
        ),
    );
    engine.prepare_databases().await.expect("prepare");

    leader
        .batch_execute(&format!(
            r#"INSERT INTO "public"."{}" (id, name) VALUES (1, 'original')"#,
            table
        ))
        .await
        .expect("leader insert");
    engine.replicate_once(&table).await.expect("initial copy");
    assert_eq!(row_name(&follower, &table, 1).await.as_deref(), Some("original"));

    leader
        .batch_execute(&format!(
            r#"UPDATE "public"."{}" SET name = 'leader-edit' WHERE id = 1"#,
            table
        ))
        .await
        .expect("leader edit");
    follower
        .batch_execute(&format!(
            r#"UPDATE "public"."{}" SET name = 'follower-edit' WHERE id = 1"#,
            table
        ))
        .await
        .expect("follower edit");

    engine.replicate_once(&table).await.expect("replicate");
    assert_eq!(row_name(&follower, &table, 1).await.as_deref(), Some("leader-edit"));
    assert_eq!(row_name(&leader, &table, 1).await.as_deref(), Some("leader-edit"));

    // The losing follower edit is settled, not left to replay on a later pass.
    let upstream = LogStore::new(&follower, follower_id, Direction::FollowerToLeader);
    assert_eq!(upstream.backlog(&table).await.expect("backlog"), 0);
    engine.replicate_once(&table).await.expect("second pass");
    assert_eq!(row_name(&leader, &table, 1).await.as_deref(), Some("leader-edit"));
    assert_eq!(row_name(&follower, &table, 1).await.as_deref(), Some("leader-edit"));

    cleanup_test_table(&leader, &follower, &table).await;
}

/// Test: after schema sync alters the follower, a fresh diff finds nothing left to do
#[tokio::test]
#[ignore]
async fn test_schema_sync_converges_after_alter() {
    let (leader_url, follower_url) =
        get_test_urls().expect("TEST_LEADER_URL and TEST_FOLLOWER_URL must be set");
    let (leader, follower) = connect_both(&leader_url, &follower_url).await;
    let table = test_table_name("schema_converge");
    setup_test_table(&leader, &follower, &table).await;

    leader
        .batch_execute(&format!(
            r#"ALTER TABLE "public"."{0}" ADD COLUMN sku TEXT DEFAULT 'none';
               ALTER TABLE "public"."{0}" ADD COLUMN seq_no INTEGER;
               ALTER TABLE "public"."{0}" ALTER COLUMN quantity TYPE BIGINT;"#,
            table
        ))
        .await
        .expect("leader alter");
    follower
        .batch_execute(&format!(
            r#"ALTER TABLE "public"."{0}" ADD COLUMN seq_no SERIAL;
               ALTER TABLE "public"."{0}" ADD COLUMN local_note TEXT;"#,
            table
        ))
        .await
        .expect("follower alter");

    let engine = engine_for(
        &leader_url,
        &follower_url,
        "itest_schema_converge",
        &format!(
            "[[tables]]\nname = \"{}\"\nallow_schema_changes = true",
            table
        ),
    );

    let applied = engine.sync_table_schema(&table).await.expect("sync");
    assert!(!applied.statements.is_empty());
    assert!(applied.withheld.is_empty());

    let replan = engine
        .manual_sync_table_schema(&table, true)
        .await
        .expect("re-plan");
    assert!(
        replan.is_in_sync(),
        "left over after sync: {:?}",
        replan.statements
    );

    cleanup_test_table(&leader, &follower, &table).await;
}

/// Test: a table created on the follower by startup schema sync gets capture triggers
#[tokio::test]
#[ignore]
async fn test_startup_schema_sync_table_is_captured() {
    let (leader_url, follower_url) =
        get_test_urls().expect("TEST_LEADER_URL and TEST_FOLLOWER_URL must be set");
    let (leader, follower) = connect_both(&leader_url, &follower_url).await;
    let table = test_table_name("startup_created");
    setup_test_table(&leader, &follower, &table).await;
    follower
        .batch_execute(&format!(r#"DROP TABLE "public"."{}""#, table))
        .await
        .expect("drop follower table");

    let engine = engine_for(
        &leader_url,
        &follower_url,
        "itest_startup_created",
        &format!(
            "[[tables]]\nname = \"{}\"\ndirection = \"bidirectional\"\nschema_sync = \"startup\"",
            table
        ),
    );
    engine.start_replication().await.expect("start");
    tokio::time::timeout(std::time::Duration::from_secs(30), engine.stop_replication())
        .await
        .expect("stop finishes");

    let triggers: Vec<String> = follower
        .query(
            "SELECT t.tgname::text FROM pg_trigger t
             JOIN pg_class c ON c.oid = t.tgrelid
             WHERE c.relname = $1 AND NOT t.tgisinternal",
            &[&table],
        )
        .await
        .expect("triggers")
        .iter()
        .map(|row| row.get(0))
        .collect();
    for op in [OperationType::Insert, OperationType::Update, OperationType::Delete] {
        let name = trigger_name(&table, op);
        assert!(triggers.contains(&name), "missing {} in {:?}", name, triggers);
    }

    cleanup_test_table(&leader, &follower, &table).await;
}
