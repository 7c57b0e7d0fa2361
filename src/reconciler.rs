//! Sync Reconciler
//!
//! Drains the local queue against the record store.
//!
//! ```text
//! Pending --(Applied | DuplicateRejected | ValidationFailed)--> removed
//! Pending --(Error)--> Pending   (retried on a later pass)
//! ```
//!
//! One pass at a time: passes are serialised by `pass_lock`, and each pass
//! works on a snapshot of the queue. Rows are removed by id only, so a scan
//! of the same tag buffered after its earlier row was removed is never
//! touched by a pass that snapshotted the old row.

use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::models::{EpcCode, PendingWrite, SyncSummary, UpsertOutcome, UpsertRequest};
use crate::queue::LocalQueue;
use crate::remote::RemoteSink;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Sync reconciler events
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Pass started with this many pending records
    PassStarted { pending: usize },
    /// Pass finished
    PassCompleted(SyncSummary),
    /// Pass skipped or stopped because the record store is unreachable
    PassAborted { reason: String },
    /// Record store refused a buffered scan; it was dropped from the queue
    RecordRejected {
        tag: EpcCode,
        captured_at: DateTime<Utc>,
    },
}

/// Statistics about sync passes
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total passes run, including aborted ones
    pub total_passes: u64,
    /// Passes stopped early
    pub aborted_passes: u64,
    /// Records removed after the record store confirmed them
    pub records_delivered: u64,
    /// Upserts that failed and left the record queued
    pub records_failed: u64,
    /// Last pass completion time
    pub last_pass: Option<DateTime<Utc>>,
    /// Last error seen during a pass
    pub last_error: Option<String>,
    /// Average pass duration in ms
    pub avg_pass_duration_ms: f64,
}

pub struct SyncReconciler {
    queue: Arc<LocalQueue>,
    sink: Arc<dyn RemoteSink>,
    monitor: Arc<ConnectivityMonitor>,
    max_consecutive_connectivity_errors: u32,
    pass_lock: tokio::sync::Mutex<()>,
    stats: RwLock<SyncStats>,
    event_callback: Option<Box<dyn Fn(SyncEvent) + Send + Sync>>,
}

impl SyncReconciler {
    pub fn new(
        queue: Arc<LocalQueue>,
        sink: Arc<dyn RemoteSink>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            queue,
            sink,
            monitor,
            max_consecutive_connectivity_errors: 3,
            pass_lock: tokio::sync::Mutex::new(()),
            stats: RwLock::new(SyncStats::default()),
            event_callback: None,
        }
    }

    /// Consecutive connectivity failures after which a pass gives up
    pub fn with_max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_connectivity_errors = max.max(1);
        self
    }

    /// Set event callback
    pub fn on_event<F>(&mut self, callback: F)
    where
        F: Fn(SyncEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(Box::new(callback));
    }

    /// Get current stats
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Run one sync pass.
    ///
    /// Waits for a running pass to finish first. Errors only when the local
    /// queue cannot be read; remote failures are counted in the summary.
    pub async fn trigger_sync(&self) -> Result<SyncSummary> {
        let _pass = self.pass_lock.lock().await;

        if !self.monitor.is_online() {
            let summary = SyncSummary {
                still_pending: self.queue.pending_count()?,
                aborted: true,
                ..SyncSummary::default()
            };
            info!(pending = summary.still_pending, "network offline, sync skipped");
            self.emit_event(SyncEvent::PassAborted {
                reason: "network offline".into(),
            });
            self.record_pass(&summary, None, 0);
            return Ok(summary);
        }

        let start = Instant::now();
        let records = self.queue.snapshot_pending()?;
        if records.is_empty() {
            debug!("no offline data to sync");
            let summary = SyncSummary::default();
            self.record_pass(&summary, None, start.elapsed().as_millis() as u64);
            return Ok(summary);
        }

        info!(pending = records.len(), "syncing offline scans");
        self.emit_event(SyncEvent::PassStarted {
            pending: records.len(),
        });

        let mut summary = SyncSummary::default();
        let mut consecutive_connectivity_errors = 0;
        let mut last_error = None;

        for record in &records {
            if !self.monitor.is_online() {
                warn!("network dropped mid-sync, stopping pass");
                summary.aborted = true;
                break;
            }

            summary.attempted += 1;
            match self.sink.upsert(&UpsertRequest::from(record)).await {
                UpsertOutcome::Applied => {
                    consecutive_connectivity_errors = 0;
                    summary.applied += 1;
                    self.remove_delivered(record);
                }
                UpsertOutcome::DuplicateRejected => {
                    consecutive_connectivity_errors = 0;
                    summary.duplicate += 1;
                    info!(tag = %record.tag_id, "already recorded remotely, dropping local copy");
                    self.remove_delivered(record);
                }
                UpsertOutcome::ValidationFailed => {
                    consecutive_connectivity_errors = 0;
                    summary.rejected += 1;
                    warn!(tag = %record.tag_id, captured_at = %record.created_at, "record store refused buffered scan: not yet matched");
                    self.remove_delivered(record);
                    self.emit_event(SyncEvent::RecordRejected {
                        tag: record.tag_id.clone(),
                        captured_at: record.created_at,
                    });
                }
                UpsertOutcome::Error(e) => {
                    summary.failed += 1;
                    warn!(tag = %record.tag_id, error = %e, "sync failed, keeping record");
                    last_error = Some(e.to_string());

                    if e.is_connectivity() {
                        consecutive_connectivity_errors += 1;
                        if consecutive_connectivity_errors >= self.max_consecutive_connectivity_errors {
                            warn!(
                                errors = consecutive_connectivity_errors,
                                "record store unreachable, stopping pass"
                            );
                            self.monitor.update(false);
                            summary.aborted = true;
                            break;
                        }
                    } else {
                        consecutive_connectivity_errors = 0;
                    }
                }
            }
        }

        summary.still_pending = self.queue.pending_count()?;
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            attempted = summary.attempted,
            applied = summary.applied,
            duplicate = summary.duplicate,
            rejected = summary.rejected,
            failed = summary.failed,
            still_pending = summary.still_pending,
            duration_ms,
            "sync pass finished"
        );

        self.record_pass(&summary, last_error, duration_ms);
        if summary.aborted {
            self.emit_event(SyncEvent::PassAborted {
                reason: "record store unreachable".into(),
            });
        }
        self.emit_event(SyncEvent::PassCompleted(summary.clone()));

        Ok(summary)
    }

    fn remove_delivered(&self, record: &PendingWrite) {
        match self.queue.remove(&record.id) {
            Ok(true) => debug!(tag = %record.tag_id, id = %record.id, "synced & removed record"),
            Ok(false) => warn!(tag = %record.tag_id, id = %record.id, "synced record was already gone"),
            // Row stays queued and is delivered again on a later pass
            Err(e) => error!(tag = %record.tag_id, id = %record.id, error = %e, "failed to remove synced record"),
        }
    }

    fn record_pass(&self, summary: &SyncSummary, last_error: Option<String>, duration_ms: u64) {
        let mut stats = self.stats.write();
        stats.total_passes += 1;
        if summary.aborted {
            stats.aborted_passes += 1;
        }
        stats.records_delivered += (summary.applied + summary.duplicate + summary.rejected) as u64;
        stats.records_failed += summary.failed as u64;
        stats.last_pass = Some(Utc::now());
        if last_error.is_some() {
            stats.last_error = last_error;
        }

        let n = stats.total_passes as f64;
        stats.avg_pass_duration_ms = (stats.avg_pass_duration_ms * (n - 1.0) + duration_ms as f64) / n;
    }

    fn emit_event(&self, event: SyncEvent) {
        if let Some(ref callback) = self.event_callback {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::models::{EpcCode, OFFLINE_ORIGIN};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Sink answering per tag, `Applied` by default
    #[derive(Default)]
    struct ScriptedSink {
        outcomes: HashMap<String, UpsertOutcome>,
        calls: Mutex<Vec<UpsertRequest>>,
    }

    impl ScriptedSink {
        fn with(mut self, tag: &EpcCode, outcome: UpsertOutcome) -> Self {
            self.outcomes.insert(tag.to_string(), outcome);
            self
        }
    }

    #[async_trait]
    impl RemoteSink for ScriptedSink {
        async fn upsert(&self, request: &UpsertRequest) -> UpsertOutcome {
            self.calls.lock().push(request.clone());
            self.outcomes
                .get(request.tag_id.as_str())
                .cloned()
                .unwrap_or(UpsertOutcome::Applied)
        }
    }

    fn tag(n: u32) -> EpcCode {
        EpcCode::parse(&format!("E{:023}", n)).unwrap()
    }

    fn buffer(queue: &LocalQueue, n: u32, micros: i64) {
        queue
            .insert_if_absent(&tag(n), "ST-01", OFFLINE_ORIGIN, DateTime::from_timestamp_micros(micros).unwrap())
            .unwrap();
    }

    fn setup(sink: ScriptedSink, online: bool) -> (SyncReconciler, Arc<LocalQueue>, Arc<ScriptedSink>, Arc<ConnectivityMonitor>) {
        let queue = Arc::new(LocalQueue::open_in_memory().unwrap());
        let sink = Arc::new(sink);
        let monitor = Arc::new(ConnectivityMonitor::new(online));
        let reconciler = SyncReconciler::new(queue.clone(), sink.clone(), monitor.clone());
        (reconciler, queue, sink, monitor)
    }

    #[tokio::test]
    async fn test_partial_failure_isolation() {
        let sink = ScriptedSink::default()
            .with(&tag(1), UpsertOutcome::Error(RemoteError::Transient("deadlock".into())));
        let (reconciler, queue, sink, _) = setup(sink, true);
        buffer(&queue, 1, 100);
        buffer(&queue, 2, 200);

        let summary = reconciler.trigger_sync().await.unwrap();

        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.still_pending, 1);
        assert!(!summary.aborted);
        assert_eq!(sink.calls.lock().len(), 2);

        let remaining = queue.snapshot_pending().unwrap();
        assert_eq!(remaining[0].tag_id, tag(1));
    }

    #[tokio::test]
    async fn test_duplicate_and_rejected_are_removed() {
        let sink = ScriptedSink::default()
            .with(&tag(1), UpsertOutcome::DuplicateRejected)
            .with(&tag(2), UpsertOutcome::ValidationFailed);
        let (reconciler, queue, _, _) = setup(sink, true);
        buffer(&queue, 1, 100);
        buffer(&queue, 2, 200);
        buffer(&queue, 3, 300);

        let summary = reconciler.trigger_sync().await.unwrap();

        assert_eq!(summary.duplicate, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.still_pending, 0);
        assert_eq!(reconciler.stats().records_delivered, 3);
    }

    #[tokio::test]
    async fn test_event_time_is_capture_time() {
        let (reconciler, queue, sink, _) = setup(ScriptedSink::default(), true);
        buffer(&queue, 1, 1_700_000_000_123_456);

        reconciler.trigger_sync().await.unwrap();

        let calls = sink.calls.lock();
        assert_eq!(
            calls[0].event_time,
            DateTime::from_timestamp_micros(1_700_000_000_123_456).unwrap()
        );
        assert_eq!(calls[0].source_address, OFFLINE_ORIGIN);
    }

    #[tokio::test]
    async fn test_offline_skips_remote() {
        let (reconciler, queue, sink, _) = setup(ScriptedSink::default(), false);
        buffer(&queue, 1, 100);

        let summary = reconciler.trigger_sync().await.unwrap();

        assert_eq!(summary.attempted, 0);
        assert_eq!(summary.still_pending, 1);
        assert!(summary.aborted);
        assert!(sink.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stops_after_consecutive_connectivity_errors() {
        let unreachable = || UpsertOutcome::Error(RemoteError::Connectivity("refused".into()));
        let sink = ScriptedSink::default()
            .with(&tag(1), unreachable())
            .with(&tag(2), unreachable())
            .with(&tag(3), unreachable());
        let (reconciler, queue, sink, monitor) = setup(sink, true);
        let reconciler = reconciler.with_max_consecutive_errors(2);
        for n in 1..=4 {
            buffer(&queue, n, n as i64 * 100);
        }

        let summary = reconciler.trigger_sync().await.unwrap();

        assert!(summary.aborted);
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.still_pending, 4);
        assert_eq!(sink.calls.lock().len(), 2);
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (reconciler, _, sink, _) = setup(ScriptedSink::default(), true);
        let summary = reconciler.trigger_sync().await.unwrap();
        assert_eq!(summary, SyncSummary::default());
        assert!(sink.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_every_pass_counted_in_stats() {
        let (reconciler, _, _, monitor) = setup(ScriptedSink::default(), true);

        reconciler.trigger_sync().await.unwrap();
        monitor.update(false);
        reconciler.trigger_sync().await.unwrap();

        let stats = reconciler.stats();
        assert_eq!(stats.total_passes, 2);
        assert_eq!(stats.aborted_passes, 1);
        assert!(stats.last_pass.is_some());
    }

    /// Sink whose first call takes the station offline
    struct DisconnectingSink {
        monitor: Arc<ConnectivityMonitor>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl RemoteSink for DisconnectingSink {
        async fn upsert(&self, _request: &UpsertRequest) -> UpsertOutcome {
            *self.calls.lock() += 1;
            self.monitor.update(false);
            UpsertOutcome::Applied
        }
    }

    #[tokio::test]
    async fn test_stops_when_network_drops_mid_pass() {
        let queue = Arc::new(LocalQueue::open_in_memory().unwrap());
        let monitor = Arc::new(ConnectivityMonitor::new(true));
        let sink = Arc::new(DisconnectingSink {
            monitor: monitor.clone(),
            calls: Mutex::new(0),
        });
        let reconciler = SyncReconciler::new(queue.clone(), sink.clone(), monitor.clone());
        for n in 1..=3 {
            buffer(&queue, n, n as i64 * 100);
        }

        let summary = reconciler.trigger_sync().await.unwrap();

        assert!(summary.aborted);
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.still_pending, 2);
        assert_eq!(*sink.calls.lock(), 1);
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_rejected_scans_reported() {
        let sink = ScriptedSink::default().with(&tag(2), UpsertOutcome::ValidationFailed);
        let (mut reconciler, queue, _, _) = setup(sink, true);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        reconciler.on_event(move |event| sink_events.lock().push(event));
        buffer(&queue, 1, 100);
        buffer(&queue, 2, 200);

        reconciler.trigger_sync().await.unwrap();

        let rejected: Vec<_> = events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SyncEvent::RecordRejected { tag, captured_at } => Some((tag.clone(), *captured_at)),
                _ => None,
            })
            .collect();
        assert_eq!(
            rejected,
            vec![(tag(2), DateTime::from_timestamp_micros(200).unwrap())]
        );
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let (mut reconciler, queue, _, _) = setup(ScriptedSink::default(), true);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        reconciler.on_event(move |event| sink_events.lock().push(event));
        buffer(&queue, 1, 100);

        reconciler.trigger_sync().await.unwrap();

        let events = events.lock();
        assert!(matches!(events[0], SyncEvent::PassStarted { pending: 1 }));
        assert!(matches!(&events[1], SyncEvent::PassCompleted(s) if s.applied == 1));
    }
}
