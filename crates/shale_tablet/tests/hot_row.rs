//! Hot-row protection at the transaction surface: which call paths are
//! gated, what serializes and what passes through.

mod common;

use std::time::Duration;

use common::{serving_master, target};
use shale_tablet::{
    BindVars, BoundQuery, Context, ExecuteOptions, HotRowProtectionConfig, HotRowProtectionMode,
    TabletConfig, TabletType, Value,
};

fn hot_row_config(max_concurrency: usize) -> TabletConfig {
    TabletConfig {
        hot_row_protection: HotRowProtectionConfig {
            mode: HotRowProtectionMode::Enable,
            max_concurrency,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn id_binds(a: i64, id: i64) -> BindVars {
    let mut binds = BindVars::new();
    binds.insert("a".to_string(), Value::Int(a));
    binds.insert("id".to_string(), Value::Int(id));
    binds
}

const HOT_UPDATE: &str = "update t1 set a = :a where id = :id";

#[tokio::test(flavor = "multi_thread")]
async fn contending_begin_executes_serialize() {
    let (server, db) = serving_master(hot_row_config(1)).await;
    db.set_execute_delay(Duration::from_millis(150));

    let mut tasks = Vec::new();
    for a in 0..2 {
        let server = server.clone();
        let master = target(TabletType::Master);
        tasks.push(tokio::spawn(async move {
            let ctx = Context::background();
            let (result, tx_id, _alias) = server
                .begin_execute(
                    &ctx,
                    Some(&master),
                    &[],
                    HOT_UPDATE,
                    &id_binds(a, 42),
                    0,
                    &ExecuteOptions::default(),
                )
                .await
                .expect("begin execute");
            server.commit(&ctx, Some(&master), tx_id).await.expect("commit");
            result
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }

    // Same row key: exactly one of the two waited for the other.
    assert_eq!(
        server
            .tx_serializer()
            .waits
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    assert_eq!(server.stats().wait_timings.count("TxSerializer"), 1);
    assert_eq!(server.tx_serializer().active_keys(), 0);
    assert_eq!(db.open_transaction_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn different_rows_do_not_serialize() {
    let (server, db) = serving_master(hot_row_config(1)).await;
    db.set_execute_delay(Duration::from_millis(100));

    let mut tasks = Vec::new();
    for id in [1, 2] {
        let server = server.clone();
        let master = target(TabletType::Master);
        tasks.push(tokio::spawn(async move {
            let ctx = Context::background();
            let (_result, tx_id, _alias) = server
                .begin_execute(
                    &ctx,
                    Some(&master),
                    &[],
                    HOT_UPDATE,
                    &id_binds(0, id),
                    0,
                    &ExecuteOptions::default(),
                )
                .await
                .expect("begin execute");
            server.rollback(&ctx, Some(&master), tx_id).await.expect("rollback");
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }

    assert_eq!(
        server
            .tx_serializer()
            .waits
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_transactions_are_gated() {
    let (server, db) = serving_master(hot_row_config(1)).await;
    db.set_execute_delay(Duration::from_millis(100));

    let mut tasks = Vec::new();
    for a in 0..2 {
        let server = server.clone();
        let master = target(TabletType::Master);
        tasks.push(tokio::spawn(async move {
            let queries = vec![BoundQuery {
                sql: HOT_UPDATE.to_string(),
                bind_vars: id_binds(a, 7),
            }];
            server
                .execute_batch(
                    &Context::background(),
                    Some(&master),
                    &queries,
                    true,
                    0,
                    &ExecuteOptions::default(),
                )
                .await
                .expect("batch")
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }

    assert_eq!(
        server
            .tx_serializer()
            .waits
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn begin_execute_batch_skips_the_gate() {
    let (server, db) = serving_master(hot_row_config(1)).await;
    db.set_execute_delay(Duration::from_millis(100));

    // Two contending batches on the same row: the begin-execute-batch path
    // does not consult the serializer at all.
    let mut tasks = Vec::new();
    for a in 0..2 {
        let server = server.clone();
        let master = target(TabletType::Master);
        tasks.push(tokio::spawn(async move {
            let queries = vec![BoundQuery {
                sql: HOT_UPDATE.to_string(),
                bind_vars: id_binds(a, 7),
            }];
            server
                .begin_execute_batch(
                    &Context::background(),
                    Some(&master),
                    &queries,
                    false,
                    &ExecuteOptions::default(),
                )
                .await
                .expect("begin execute batch")
        }));
    }
    let mut tx_ids = Vec::new();
    for task in tasks {
        let (_results, tx_id, _alias) = task.await.expect("join");
        tx_ids.push(tx_id);
    }
    for tx_id in tx_ids {
        server
            .commit(&Context::background(), Some(&target(TabletType::Master)), tx_id)
            .await
            .expect("commit");
    }

    assert_eq!(
        server
            .tx_serializer()
            .waits
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn reserved_connections_skip_the_gate() {
    let (server, db) = serving_master(hot_row_config(1)).await;
    db.set_execute_delay(Duration::from_millis(200));

    // First holder takes the row key through the normal gated path.
    let holder = {
        let server = server.clone();
        let master = target(TabletType::Master);
        tokio::spawn(async move {
            let ctx = Context::background();
            let (_result, tx_id, _alias) = server
                .begin_execute(
                    &ctx,
                    Some(&master),
                    &[],
                    HOT_UPDATE,
                    &id_binds(1, 9),
                    0,
                    &ExecuteOptions::default(),
                )
                .await
                .expect("begin execute");
            server.rollback(&ctx, Some(&master), tx_id).await.expect("rollback");
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A reserved-connection call on the same row must not queue behind it.
    let ctx = Context::background();
    let started = tokio::time::Instant::now();
    let (_result, tx_id, _alias) = server
        .begin_execute(
            &ctx,
            Some(&target(TabletType::Master)),
            &[],
            HOT_UPDATE,
            &id_binds(2, 9),
            77,
            &ExecuteOptions::default(),
        )
        .await
        .expect("reserved begin execute");
    assert_eq!(tx_id, 77);
    server
        .rollback(&ctx, Some(&target(TabletType::Master)), tx_id)
        .await
        .expect("rollback");

    assert!(
        started.elapsed() < Duration::from_millis(150 + 200),
        "reserved connections must not wait for the hot row queue"
    );
    assert_eq!(
        server
            .tx_serializer()
            .waits
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );

    holder.await.expect("join");
}

#[tokio::test]
async fn non_dml_queries_are_not_serialized() {
    let (server, _db) = serving_master(hot_row_config(1)).await;
    let ctx = Context::background();
    let master = target(TabletType::Master);

    // Selects and where-less updates produce no row key.
    for sql in ["select a from t1 where id = :id", "update t1 set a = :a"] {
        let mut binds = BindVars::new();
        binds.insert("a".to_string(), Value::Int(1));
        binds.insert("id".to_string(), Value::Int(1));
        let (_result, tx_id, _alias) = server
            .begin_execute(&ctx, Some(&master), &[], sql, &binds, 0, &ExecuteOptions::default())
            .await
            .expect("begin execute");
        server.rollback(&ctx, Some(&master), tx_id).await.expect("rollback");
    }

    assert_eq!(server.tx_serializer().active_keys(), 0);
    assert_eq!(
        server
            .tx_serializer()
            .waits
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}
