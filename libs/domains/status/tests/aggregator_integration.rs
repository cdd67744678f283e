//! End-to-end aggregator tests against a real Redis.
//!
//! These exercise the full path: worker event in, reduced state, snapshot
//! published on the status channel.

use domain_machine::{ServiceMapping, Structure};
use domain_status::{
    MachinePhase, StatusAggregator, StatusMessage, StatusPublisher, StatusReducer, UpdateType,
    WorkerState, run_subscriber,
};
use futures::StreamExt;
use std::time::Duration;
use test_utils::TestHub;
use tokio::sync::watch;

fn reducer(machine_id: &str) -> StatusReducer {
    let mapping = ServiceMapping::bundled();
    let structure = Structure::build_from_mapping(machine_id, "simulation:1", &mapping).unwrap();
    StatusReducer::new(
        machine_id,
        structure,
        "http://localhost:9200/health".to_string(),
    )
}

async fn next_snapshot(
    stream: &mut (impl futures::Stream<Item = redis::Msg> + Unpin),
) -> StatusMessage {
    let message = tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("timed out waiting for a status snapshot")
        .expect("status channel closed");
    let payload: String = message.get_payload().unwrap();
    serde_json::from_str(&payload).unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_aggregator_publishes_transitions_in_order() {
    let hub = TestHub::start().await;
    let manager = hub.manager().await;

    let publisher = StatusPublisher::new(manager.clone(), "m1");
    let (handle, task) = StatusAggregator::spawn(reducer("m1"), publisher);

    let client = redis::Client::open(hub.url()).unwrap();
    let mut pubsub = client.get_async_pubsub().await.unwrap();
    pubsub.subscribe("machine:status:m1").await.unwrap();
    let mut stream = pubsub.on_message();

    // Phase transition publishes machine_ready
    handle.machine_ready().await.unwrap();
    let snapshot = next_snapshot(&mut stream).await;
    assert_eq!(snapshot.update_type, UpdateType::MachineReady);
    assert_eq!(snapshot.status.machine.phase, MachinePhase::Ready);

    // Startup publishes initial after ready
    handle.publish_initial().await.unwrap();
    let snapshot = next_snapshot(&mut stream).await;
    assert_eq!(snapshot.update_type, UpdateType::Initial);

    // A worker event produces an event_driven snapshot
    handle
        .event(
            "machine:m1:worker:m1-simulation-0".to_string(),
            r#"{"event_type": "worker_registered", "timestamp": 1000,
                "data": {"status": "idle", "capabilities": ["simulation"]}}"#
                .to_string(),
        )
        .await
        .unwrap();
    let snapshot = next_snapshot(&mut stream).await;
    assert_eq!(snapshot.update_type, UpdateType::EventDriven);
    let worker = &snapshot.status.workers["m1-simulation-0"];
    assert!(worker.is_connected);
    assert_eq!(worker.status, WorkerState::Idle);

    // Malformed events are dropped without a publish; the next good event
    // still comes through
    handle
        .event(
            "machine:m1:worker:m1-simulation-0".to_string(),
            "not json".to_string(),
        )
        .await
        .unwrap();
    handle
        .event(
            "machine:m1:worker:m1-simulation-0".to_string(),
            r#"{"event_type": "job_started", "data": {"job_id": "j1"}}"#.to_string(),
        )
        .await
        .unwrap();
    let snapshot = next_snapshot(&mut stream).await;
    assert_eq!(
        snapshot.status.workers["m1-simulation-0"].status,
        WorkerState::Busy
    );

    // Shutdown publishes the final snapshot exactly once
    handle.shutdown().await;
    let snapshot = next_snapshot(&mut stream).await;
    assert_eq!(snapshot.update_type, UpdateType::Shutdown);
    assert_eq!(snapshot.status.machine.phase, MachinePhase::Shutdown);
    task.await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_subscriber_feeds_worker_events_to_aggregator() {
    let hub = TestHub::start().await;
    let manager = hub.manager().await;

    let publisher = StatusPublisher::new(manager.clone(), "m2");
    let (handle, task) = StatusAggregator::spawn(reducer("m2"), publisher);

    let (stop_tx, stop_rx) = watch::channel(false);
    let subscriber = tokio::spawn(run_subscriber(
        hub.url().to_string(),
        "m2".to_string(),
        handle.clone(),
        stop_rx,
    ));

    // Give the psubscribe a moment to land
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut conn = hub.connection().await;
    let _: i64 = redis::cmd("PUBLISH")
        .arg("machine:m2:worker:m2-simulation-0")
        .arg(
            r#"{"event_type": "worker_status_changed",
                "data": {"status": "busy", "current_job_id": "j42", "is_connected": true}}"#,
        )
        .query_async(&mut conn)
        .await
        .unwrap();

    // The watch mirror eventually reflects the event
    let mut snapshot_rx = handle.snapshot();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        {
            let snapshot = snapshot_rx.borrow();
            if let Some(worker) = snapshot.status.workers.get("m2-simulation-0") {
                if worker.status == WorkerState::Busy {
                    assert_eq!(worker.current_job_id.as_deref(), Some("j42"));
                    break;
                }
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "event never reached the aggregator"
        );
        let _ = tokio::time::timeout(Duration::from_millis(200), snapshot_rx.changed()).await;
    }

    let _ = stop_tx.send(true);
    subscriber.await.unwrap();
    handle.shutdown().await;
    task.await.unwrap();
}
