//! Sync Scheduler
//!
//! Background task deciding when the reconciler runs:
//! - the station comes back online
//! - the periodic timer fires while online
//! - someone asks through a [`SyncHandle`]
//!
//! Designed to run as a tokio task until shutdown is signalled.

use crate::connectivity::ConnectivityMonitor;
use crate::reconciler::SyncReconciler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Requests a sync pass from a running scheduler.
///
/// Requests made while a pass is already queued are merged into it.
#[derive(Clone)]
pub struct SyncHandle {
    notify: Arc<Notify>,
}

impl SyncHandle {
    pub fn request_sync(&self) {
        self.notify.notify_one();
    }
}

pub struct SyncScheduler {
    reconciler: Arc<SyncReconciler>,
    monitor: Arc<ConnectivityMonitor>,
    interval: Duration,
    sync_on_start: bool,
    requests: Arc<Notify>,
}

impl SyncScheduler {
    pub fn new(
        reconciler: Arc<SyncReconciler>,
        monitor: Arc<ConnectivityMonitor>,
        interval: Duration,
    ) -> Self {
        Self {
            reconciler,
            monitor,
            interval,
            sync_on_start: true,
            requests: Arc::new(Notify::new()),
        }
    }

    /// Run a pass right away if the station is already online at start
    pub fn with_sync_on_start(mut self, enabled: bool) -> Self {
        self.sync_on_start = enabled;
        self
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            notify: self.requests.clone(),
        }
    }

    /// Run until `shutdown` changes or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut online = self.monitor.subscribe();

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        info!(interval_secs = self.interval.as_secs(), "sync scheduler started");

        if self.sync_on_start && *online.borrow_and_update() {
            self.run_pass("startup").await;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now_online = *online.borrow_and_update();
                    if now_online {
                        self.run_pass("reconnect").await;
                    }
                }
                _ = ticker.tick() => {
                    if self.monitor.is_online() {
                        self.run_pass("timer").await;
                    }
                }
                _ = self.requests.notified() => {
                    self.run_pass("request").await;
                }
            }
        }

        info!("sync scheduler stopped");
    }

    async fn run_pass(&self, trigger: &'static str) {
        debug!(trigger, "sync triggered");
        match self.reconciler.trigger_sync().await {
            Ok(summary) if summary.attempted > 0 => info!(trigger, %summary, "sync pass done"),
            Ok(_) => {}
            Err(e) => error!(trigger, error = %e, "sync pass failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EpcCode, UpsertOutcome, UpsertRequest, OFFLINE_ORIGIN};
    use crate::queue::LocalQueue;
    use crate::remote::RemoteSink;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteSink for CountingSink {
        async fn upsert(&self, _request: &UpsertRequest) -> UpsertOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            UpsertOutcome::Applied
        }
    }

    async fn wait_for_empty(queue: &LocalQueue) {
        for _ in 0..200 {
            if queue.pending_count().unwrap() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue was not drained");
    }

    type Fixture = (SyncScheduler, Arc<LocalQueue>, Arc<CountingSink>, Arc<ConnectivityMonitor>);

    fn setup_with(interval: Duration, online: bool) -> Fixture {
        let queue = Arc::new(LocalQueue::open_in_memory().unwrap());
        let sink = Arc::new(CountingSink::default());
        let monitor = Arc::new(ConnectivityMonitor::new(online));
        let reconciler = Arc::new(SyncReconciler::new(queue.clone(), sink.clone(), monitor.clone()));
        let scheduler = SyncScheduler::new(reconciler, monitor.clone(), interval);
        (scheduler, queue, sink, monitor)
    }

    fn setup() -> Fixture {
        setup_with(Duration::from_secs(3600), false)
    }

    fn buffer_one(queue: &LocalQueue) {
        let tag = EpcCode::parse("E00000000000000000000001").unwrap();
        queue.insert_if_absent(&tag, "ST-01", OFFLINE_ORIGIN, Utc::now()).unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_triggers_sync() {
        let (scheduler, queue, sink, monitor) = setup();
        buffer_one(&queue);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.run(shutdown_rx));

        tokio::task::yield_now().await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);

        monitor.update(true);
        wait_for_empty(&queue).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_explicit_request_triggers_sync() {
        let (scheduler, queue, sink, monitor) = setup();
        monitor.update(true);
        let handle = scheduler.handle();
        let scheduler = scheduler.with_sync_on_start(false);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.run(shutdown_rx));

        buffer_one(&queue);
        handle.request_sync();
        wait_for_empty(&queue).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

        drop(shutdown_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_timer_syncs_while_online() {
        let (scheduler, queue, sink, _) = setup_with(Duration::from_millis(50), true);
        let scheduler = scheduler.with_sync_on_start(false);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.run(shutdown_rx));

        // Already online, so only the timer can pick this up
        buffer_one(&queue);
        wait_for_empty(&queue).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_timer_idle_while_offline() {
        let (scheduler, queue, sink, _) = setup_with(Duration::from_millis(20), false);
        buffer_one(&queue);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.run(shutdown_rx));

        // Several ticks elapse
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending_count().unwrap(), 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
