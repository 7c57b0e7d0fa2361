//! Station
//!
//! Wires the queue, connectivity monitor, router and reconciler together
//! and exposes the surface the scanner front end talks to.

use crate::clock::CaptureClock;
use crate::config::{StationConfig, StationIdentity};
use crate::connectivity::{ConnectivityMonitor, Transition};
use crate::error::Result;
use crate::models::{SubmitOutcome, SyncSummary};
use crate::probe::ConnectivityProbe;
use crate::queue::LocalQueue;
use crate::reconciler::{SyncEvent, SyncReconciler, SyncStats};
use crate::remote::{HttpRemoteSink, RemoteSink};
use crate::router::WriteRouter;
use crate::scheduler::{SyncHandle, SyncScheduler};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Station {
    config: StationConfig,
    identity: StationIdentity,
    queue: Arc<LocalQueue>,
    monitor: Arc<ConnectivityMonitor>,
    router: WriteRouter,
    reconciler: Arc<SyncReconciler>,
}

impl Station {
    /// Open the on-disk queue from `config` and talk to the record store
    /// over HTTP
    pub fn connect(config: StationConfig) -> Result<Self> {
        let identity = config.identity();
        let sink = HttpRemoteSink::new(&config.remote, &identity)?;
        Self::open(config, Arc::new(sink))
    }

    /// Open the on-disk queue from `config` with a custom sink
    pub fn open(config: StationConfig, sink: Arc<dyn RemoteSink>) -> Result<Self> {
        config.validate()?;
        let queue = Arc::new(LocalQueue::open(&config.queue.path)?);
        Self::with_queue(config, sink, queue)
    }

    pub fn with_queue(
        config: StationConfig,
        sink: Arc<dyn RemoteSink>,
        queue: Arc<LocalQueue>,
    ) -> Result<Self> {
        config.validate()?;
        let identity = config.identity();
        let monitor = Arc::new(ConnectivityMonitor::default());
        let clock = Arc::new(CaptureClock::system());

        let router = WriteRouter::new(
            monitor.clone(),
            queue.clone(),
            sink.clone(),
            identity.clone(),
            clock,
        )
        .with_fallback(config.sync.fallback_to_buffer);

        let reconciler = SyncReconciler::new(queue.clone(), sink, monitor.clone())
            .with_max_consecutive_errors(config.sync.max_consecutive_connectivity_errors);

        info!(
            station = %identity.station_no,
            address = %identity.address,
            "station ready"
        );

        Ok(Self {
            config,
            identity,
            queue,
            monitor,
            router,
            reconciler: Arc::new(reconciler),
        })
    }

    pub fn identity(&self) -> &StationIdentity {
        &self.identity
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    /// Record one scan
    pub async fn submit(&self, raw_tag: &str) -> Result<SubmitOutcome> {
        self.router.submit(raw_tag).await
    }

    /// Scans still waiting for the record store
    pub fn pending_count(&self) -> Result<usize> {
        self.queue.pending_count()
    }

    /// Run one sync pass now
    pub async fn trigger_sync(&self) -> Result<SyncSummary> {
        self.reconciler.trigger_sync().await
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Override the probe's view of connectivity
    pub fn set_online(&self, online: bool) -> Transition {
        self.monitor.update(online)
    }

    pub fn queue_path(&self) -> Option<&Path> {
        self.queue.path()
    }

    pub fn stats(&self) -> SyncStats {
        self.reconciler.stats()
    }

    /// Register a sync event callback.
    ///
    /// Returns false once background tasks share the reconciler.
    pub fn on_sync_event<F>(&mut self, callback: F) -> bool
    where
        F: Fn(SyncEvent) + Send + Sync + 'static,
    {
        match Arc::get_mut(&mut self.reconciler) {
            Some(reconciler) => {
                reconciler.on_event(callback);
                true
            }
            None => false,
        }
    }

    /// Probe once and update the monitor
    pub async fn probe_once(&self) -> Result<Transition> {
        let probe = ConnectivityProbe::new(&self.config.probe, self.monitor.clone())?;
        Ok(probe.probe_once().await)
    }

    /// Start the connectivity probe and the sync scheduler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_background(&self) -> Result<BackgroundTasks> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let probe = ConnectivityProbe::new(&self.config.probe, self.monitor.clone())?;
        let scheduler = SyncScheduler::new(
            self.reconciler.clone(),
            self.monitor.clone(),
            self.config.sync.interval(),
        )
        .with_sync_on_start(self.config.sync.sync_on_start);
        let sync = scheduler.handle();

        let handles = vec![
            tokio::spawn(probe.run(shutdown_rx.clone())),
            tokio::spawn(scheduler.run(shutdown_rx)),
        ];

        Ok(BackgroundTasks {
            shutdown: shutdown_tx,
            handles,
            sync,
        })
    }
}

/// Handle to the probe and scheduler tasks
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    sync: SyncHandle,
}

impl BackgroundTasks {
    pub fn sync_handle(&self) -> SyncHandle {
        self.sync.clone()
    }

    /// Signal shutdown and wait for the tasks to stop.
    ///
    /// A sync pass in progress finishes its current record first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
    }
}
