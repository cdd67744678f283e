//! The status aggregator.
//!
//! One task owns the [`StatusReducer`]; everything else talks to it through
//! a bounded inbox. Publishing is synchronous with reducer application, so
//! subscribers on the status channel observe every transition in order.
//! A `watch` channel mirrors the latest snapshot for the HTTP read-view.
//!
//! Companion tasks:
//! - [`run_subscriber`] consumes worker events from the machine's pub/sub
//!   pattern on a dedicated connection and reconnects forever with bounded
//!   backoff.
//! - [`run_poller`] periodically gathers the process table, per-service
//!   HTTP health and (optionally) the authoritative worker hashes.

use crate::error::StatusError;
use crate::events::parse_event;
use crate::metrics;
use crate::models::{MachinePhase, StatusMessage, UpdateType};
use crate::publisher::StatusPublisher;
use crate::reducer::StatusReducer;
use crate::sources::{HealthProbe, ProcessTableEntry, ProcessTableSource};
use chrono::Utc;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Data gathered by one poll cycle.
#[derive(Debug, Default)]
pub struct PollReport {
    pub table: Vec<ProcessTableEntry>,
    pub health: Vec<(String, bool)>,
    pub worker_hashes: Vec<(String, BTreeMap<String, String>)>,
    pub as_of_ms: i64,
}

/// Inbox of the reducer task.
#[derive(Debug)]
pub enum AggregatorMsg {
    /// A raw pub/sub message from a worker channel.
    Event { channel: String, payload: String },
    /// Periodic reconciliation data.
    Poll(PollReport),
    /// The startup orchestrator finished; phase becomes `ready`.
    MachineReady,
    /// Publish the post-ready initial snapshot.
    PublishInitial,
    /// Publish the final snapshot and stop.
    Shutdown { ack: oneshot::Sender<()> },
}

/// Cheap handle to the aggregator task.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<AggregatorMsg>,
    snapshot_rx: watch::Receiver<StatusMessage>,
}

impl AggregatorHandle {
    pub async fn event(&self, channel: String, payload: String) -> Result<(), StatusError> {
        self.tx
            .send(AggregatorMsg::Event { channel, payload })
            .await
            .map_err(|_| StatusError::ChannelClosed)
    }

    pub async fn poll(&self, report: PollReport) -> Result<(), StatusError> {
        self.tx
            .send(AggregatorMsg::Poll(report))
            .await
            .map_err(|_| StatusError::ChannelClosed)
    }

    pub async fn machine_ready(&self) -> Result<(), StatusError> {
        self.tx
            .send(AggregatorMsg::MachineReady)
            .await
            .map_err(|_| StatusError::ChannelClosed)
    }

    pub async fn publish_initial(&self) -> Result<(), StatusError> {
        self.tx
            .send(AggregatorMsg::PublishInitial)
            .await
            .map_err(|_| StatusError::ChannelClosed)
    }

    /// Ask for the final `shutdown` snapshot and wait until it is out.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(AggregatorMsg::Shutdown { ack }).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Latest snapshot, updated on every publish.
    pub fn snapshot(&self) -> watch::Receiver<StatusMessage> {
        self.snapshot_rx.clone()
    }
}

pub struct StatusAggregator;

impl StatusAggregator {
    /// Spawn the reducer task. Returns a handle and the join handle the
    /// application awaits on shutdown.
    pub fn spawn(
        reducer: StatusReducer,
        publisher: StatusPublisher,
    ) -> (AggregatorHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AggregatorMsg>(256);
        let (snapshot_tx, snapshot_rx) =
            watch::channel(reducer.snapshot(UpdateType::Initial));

        let task = tokio::spawn(async move {
            let mut reducer = reducer;

            async fn emit(
                reducer: &StatusReducer,
                publisher: &StatusPublisher,
                snapshot_tx: &watch::Sender<StatusMessage>,
                update_type: UpdateType,
            ) {
                let snapshot = reducer.snapshot(update_type);
                let _ = snapshot_tx.send(snapshot.clone());
                match publisher.publish(&snapshot).await {
                    Ok(()) => metrics::record_publish(update_type),
                    Err(e) => {
                        // Degrade to last-known state; the next transition
                        // publishes again.
                        warn!(error = %e, "Failed to publish status snapshot");
                        metrics::record_publish_error();
                    }
                }
            }

            while let Some(msg) = rx.recv().await {
                match msg {
                    AggregatorMsg::Event { channel, payload } => {
                        match parse_event(&channel, &payload) {
                            Ok(envelope) => {
                                metrics::record_event(&envelope.event);
                                reducer.apply_event(&envelope);
                                emit(&reducer, &publisher, &snapshot_tx, UpdateType::EventDriven)
                                    .await;
                            }
                            Err(e) => {
                                warn!(error = %e, "Dropping malformed worker event");
                                metrics::record_event_error();
                            }
                        }
                    }
                    AggregatorMsg::Poll(report) => {
                        reducer.apply_process_table(&report.table);
                        for (service_key, healthy) in &report.health {
                            reducer.apply_service_health(service_key, *healthy);
                        }
                        for (worker_id, fields) in &report.worker_hashes {
                            reducer.apply_worker_hash(worker_id, fields, report.as_of_ms);
                        }
                        metrics::record_poll_cycle();
                        emit(&reducer, &publisher, &snapshot_tx, UpdateType::Periodic).await;
                    }
                    AggregatorMsg::MachineReady => {
                        if reducer.set_phase(MachinePhase::Ready) {
                            emit(&reducer, &publisher, &snapshot_tx, UpdateType::MachineReady)
                                .await;
                        }
                    }
                    AggregatorMsg::PublishInitial => {
                        emit(&reducer, &publisher, &snapshot_tx, UpdateType::Initial).await;
                    }
                    AggregatorMsg::Shutdown { ack } => {
                        reducer.set_phase(MachinePhase::Shutdown);
                        emit(&reducer, &publisher, &snapshot_tx, UpdateType::Shutdown).await;
                        let _ = ack.send(());
                        break;
                    }
                }
            }
            info!("Status aggregator stopped");
        });

        (
            AggregatorHandle { tx, snapshot_rx },
            task,
        )
    }
}

/// Consume worker events from `machine:<machine_id>:worker:*`.
///
/// Runs until shutdown is signalled; connection failures reconnect with
/// exponential backoff capped at 30 s and never crash the process.
pub async fn run_subscriber(
    redis_url: String,
    machine_id: String,
    handle: AggregatorHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let pattern = format!("machine:{}:worker:*", machine_id);
    let mut consecutive_errors: u32 = 0;
    const MAX_BACKOFF_SECS: u64 = 30;

    loop {
        if *shutdown.borrow() {
            break;
        }
        match subscribe_once(&redis_url, &pattern, &handle, &mut shutdown).await {
            Ok(()) => break,
            Err(e) => {
                consecutive_errors += 1;
                let backoff_secs =
                    std::cmp::min(2u64.pow(consecutive_errors.min(5)), MAX_BACKOFF_SECS);
                warn!(
                    error = %e,
                    consecutive_errors = consecutive_errors,
                    backoff_secs = backoff_secs,
                    "Event subscription lost, backing off"
                );
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }
            }
        }
    }
    info!("Event subscriber stopped");
}

async fn subscribe_once(
    redis_url: &str,
    pattern: &str,
    handle: &AggregatorHandle,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), StatusError> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(pattern).await?;
    info!(pattern = %pattern, "Subscribed to worker events");

    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            message = stream.next() => {
                match message {
                    Some(message) => {
                        let channel = message.get_channel_name().to_string();
                        let payload: String = message.get_payload()?;
                        debug!(channel = %channel, "Worker event received");
                        if handle.event(channel, payload).await.is_err() {
                            // Aggregator is gone; nothing left to feed
                            return Ok(());
                        }
                    }
                    None => {
                        return Err(StatusError::Redis(redis::RedisError::from((
                            redis::ErrorKind::Io,
                            "pub/sub stream ended",
                        ))));
                    }
                }
            }
        }
    }
}

/// Periodically reconcile with the process table and backend health.
///
/// `redis` is optional: when present, worker hashes (`worker:<id>`) are
/// read back for reconciliation.
pub async fn run_poller(
    handle: AggregatorHandle,
    table: Arc<dyn ProcessTableSource>,
    probe: Arc<dyn HealthProbe>,
    redis: Option<ConnectionManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The immediate first tick would race startup publishing
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        let as_of_ms = Utc::now().timestamp_millis();
        let process_table = table.process_table().await;

        // Probe targets come from the latest snapshot so services that were
        // materialized by events are included too.
        let snapshot = handle.snapshot().borrow().clone();
        let mut health = Vec::new();
        for (key, runtime) in &snapshot.status.services {
            let port = runtime
                .port
                .or_else(|| snapshot.structure.services.get(key).and_then(|i| i.port));
            if let Some(port) = port {
                let url = format!("http://localhost:{}", port);
                health.push((key.clone(), probe.probe(&url).await));
            }
        }

        let mut worker_hashes = Vec::new();
        if let Some(redis) = redis.as_ref() {
            for worker_id in snapshot.status.workers.keys() {
                let mut conn = redis.clone();
                let result: Result<HashMap<String, String>, _> = redis::cmd("HGETALL")
                    .arg(format!("worker:{}", worker_id))
                    .query_async(&mut conn)
                    .await;
                match result {
                    Ok(fields) if !fields.is_empty() => {
                        worker_hashes.push((worker_id.clone(), fields.into_iter().collect()));
                    }
                    Ok(_) => {}
                    Err(e) => debug!(worker_id = %worker_id, error = %e, "Worker hash read failed"),
                }
            }
        }

        let report = PollReport {
            table: process_table,
            health,
            worker_hashes,
            as_of_ms,
        };
        if handle.poll(report).await.is_err() {
            break;
        }
    }
    info!("Status poller stopped");
}
