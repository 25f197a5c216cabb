//! Shared helpers for the tablet server integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use shale_tablet::testing::{fake_engines, FakeDb};
use shale_tablet::{
    DbConfig, TabletAlias, TabletConfig, TabletServer, TabletServerBuilder, TabletType, Target,
};

pub const KEYSPACE: &str = "ks";
pub const SHARD: &str = "-80";

pub fn target(tablet_type: TabletType) -> Target {
    Target::new(KEYSPACE, SHARD, tablet_type)
}

pub fn alias() -> TabletAlias {
    TabletAlias {
        cell: "zone1".to_string(),
        uid: 42,
    }
}

/// Route tracing output through the test harness; `RUST_LOG` filters it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A server wired to a fresh fake storage backend, still `NotConnected`.
pub fn build_server(config: TabletConfig) -> (Arc<TabletServer>, Arc<FakeDb>) {
    init_tracing();
    let db = FakeDb::new();
    let server = TabletServerBuilder::new(config, alias(), fake_engines(&db)).build();
    (server, db)
}

/// A server already serving as master, with the startup lifecycle log
/// cleared so tests see only their own events.
pub async fn serving_master(config: TabletConfig) -> (Arc<TabletServer>, Arc<FakeDb>) {
    let (server, db) = build_server(config);
    server
        .start_service(target(TabletType::Master), &DbConfig::default())
        .await
        .expect("start service");
    db.clear_lifecycle_log();
    (server, db)
}

/// Poll until `predicate` holds or the timeout elapses.
pub async fn wait_until(
    timeout: std::time::Duration,
    mut predicate: impl FnMut() -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    predicate()
}
