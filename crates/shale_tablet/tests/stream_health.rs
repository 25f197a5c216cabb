//! Health broadcast fan-out, cached replay, lameduck reporting and the
//! heartbeat lag surface.

mod common;

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{serving_master, target, wait_until};
use shale_tablet::{
    Context, RealtimeStats, StreamHealthResponse, TabletConfig, TabletType,
};

fn stats_with_qps(qps: f64) -> RealtimeStats {
    RealtimeStats {
        qps,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn late_subscriber_gets_the_cached_snapshot_then_live_updates() {
    let (server, _db) = serving_master(TabletConfig::default()).await;

    server.broadcast_health(11, stats_with_qps(1.0), Duration::from_secs(5));

    let received: Arc<Mutex<Vec<StreamHealthResponse>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let stream_server = server.clone();
    let stream = tokio::spawn(async move {
        let mut callback = move |response: &StreamHealthResponse| {
            let mut sink = sink.lock().unwrap();
            sink.push(response.clone());
            if sink.len() == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };
        stream_server
            .stream_health(&Context::background(), &mut callback)
            .await
    });

    // The cached snapshot arrives without any new broadcast.
    assert!(
        wait_until(Duration::from_secs(1), || received.lock().unwrap().len() == 1).await,
        "cached snapshot must be replayed"
    );
    assert_eq!(
        received.lock().unwrap()[0].tablet_externally_reparented_timestamp,
        11
    );

    // Broadcast only once the subscriber is registered for live updates.
    assert!(
        wait_until(Duration::from_secs(1), || server.health_subscriber_count() == 1).await
    );
    server.broadcast_health(12, stats_with_qps(2.0), Duration::from_secs(5));
    stream.await.expect("join").expect("stream health");

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[1].tablet_externally_reparented_timestamp, 12);
    assert!(received[1].serving);
    assert_eq!(received[1].target, target(TabletType::Master));
    assert_eq!(server.health_subscriber_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_cache_is_not_replayed() {
    let (server, _db) = serving_master(TabletConfig::default()).await;
    server.broadcast_health(1, stats_with_qps(1.0), Duration::ZERO);

    let received: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let stream_server = server.clone();
    let stream = tokio::spawn(async move {
        let mut callback = move |response: &StreamHealthResponse| {
            sink.lock()
                .unwrap()
                .push(response.tablet_externally_reparented_timestamp);
            ControlFlow::Break(())
        };
        stream_server
            .stream_health(&Context::background(), &mut callback)
            .await
    });

    assert!(
        wait_until(Duration::from_secs(1), || server.health_subscriber_count() == 1).await,
        "subscriber must register when there is nothing to replay"
    );
    assert!(received.lock().unwrap().is_empty());

    server.broadcast_health(2, stats_with_qps(1.0), Duration::from_secs(5));
    stream.await.expect("join").expect("stream health");
    assert_eq!(*received.lock().unwrap(), vec![2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn canceled_context_ends_the_stream_cleanly() {
    let (server, _db) = serving_master(TabletConfig::default()).await;

    let ctx = Context::background();
    let stream_ctx = ctx.clone();
    let stream_server = server.clone();
    let stream = tokio::spawn(async move {
        let mut callback = |_response: &StreamHealthResponse| ControlFlow::Continue(());
        stream_server.stream_health(&stream_ctx, &mut callback).await
    });

    assert!(
        wait_until(Duration::from_secs(1), || server.health_subscriber_count() == 1).await
    );
    ctx.cancel();
    stream.await.expect("join").expect("clean close on cancel");
    assert_eq!(server.health_subscriber_count(), 0);
}

#[tokio::test]
async fn lameduck_reports_not_serving_but_keeps_serving_queries() {
    let (server, _db) = serving_master(TabletConfig::default()).await;

    server.enter_lameduck();
    assert_eq!(server.get_state(), "NOT_SERVING");
    assert!(!server.is_serving());

    // Queries keep flowing while in lameduck.
    server
        .execute(
            &Context::background(),
            Some(&target(TabletType::Master)),
            "select 1",
            &shale_tablet::BindVars::new(),
            0,
            0,
            &shale_tablet::ExecuteOptions::default(),
        )
        .await
        .expect("lameduck keeps serving");

    // Broadcasts report the lameduck state.
    server.broadcast_health(0, stats_with_qps(0.0), Duration::from_secs(5));
    let cached_serving: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
    let sink = cached_serving.clone();
    let mut callback = move |response: &StreamHealthResponse| {
        *sink.lock().unwrap() = Some(response.serving);
        ControlFlow::Break(())
    };
    server
        .stream_health(&Context::background(), &mut callback)
        .await
        .expect("stream health");
    assert_eq!(*cached_serving.lock().unwrap(), Some(false));

    // Any serving-type change clears the flag, even a no-op one.
    server
        .set_serving_type(TabletType::Master, true, Vec::new())
        .await
        .expect("no-op transition");
    assert!(server.is_serving());
}

#[tokio::test]
async fn heartbeat_lag_is_zero_for_a_stopped_node() {
    let (server, db) = serving_master(TabletConfig::default()).await;

    // A serving replica reads the actual lag.
    server
        .set_serving_type(TabletType::Replica, true, Vec::new())
        .await
        .expect("replica");
    db.set_heartbeat_lag(Duration::from_secs(3));
    assert_eq!(server.heartbeat_lag().expect("lag"), Duration::from_secs(3));

    // Stopped node with a closed reader: report healthy-zero so the health
    // check may try to restart the query service.
    server
        .set_serving_type(TabletType::Master, true, Vec::new())
        .await
        .expect("master closes the reader");
    server
        .set_serving_type(TabletType::Master, false, Vec::new())
        .await
        .expect("stop");
    assert_eq!(server.heartbeat_lag().expect("lag"), Duration::ZERO);
}
