//! Write Router
//!
//! Decides, per scan, whether to send it straight to the record store or
//! buffer it in the local queue.

use crate::clock::CaptureClock;
use crate::config::StationIdentity;
use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::models::{EpcCode, SubmitOutcome, UpsertOutcome, UpsertRequest, OFFLINE_ORIGIN};
use crate::queue::{InsertOutcome, LocalQueue};
use crate::remote::RemoteSink;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct WriteRouter {
    monitor: Arc<ConnectivityMonitor>,
    queue: Arc<LocalQueue>,
    sink: Arc<dyn RemoteSink>,
    identity: StationIdentity,
    clock: Arc<CaptureClock>,
    fallback_to_buffer: bool,
}

impl WriteRouter {
    pub fn new(
        monitor: Arc<ConnectivityMonitor>,
        queue: Arc<LocalQueue>,
        sink: Arc<dyn RemoteSink>,
        identity: StationIdentity,
        clock: Arc<CaptureClock>,
    ) -> Self {
        Self {
            monitor,
            queue,
            sink,
            identity,
            clock,
            fallback_to_buffer: true,
        }
    }

    /// Whether an online scan that cannot reach the record store is buffered
    /// instead of failing
    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_to_buffer = enabled;
        self
    }

    /// Route one scan.
    ///
    /// `Err` means the scan was neither recorded remotely nor buffered and
    /// must be reported to the operator as lost.
    pub async fn submit(&self, raw_tag: &str) -> Result<SubmitOutcome> {
        let tag = EpcCode::parse(raw_tag)?;
        let captured_at = self.clock.now();

        if self.monitor.is_online() {
            let request = UpsertRequest {
                tag_id: tag.clone(),
                station_id: self.identity.station_no.clone(),
                source_address: self.identity.address.clone(),
                event_time: captured_at,
            };

            match self.sink.upsert(&request).await {
                UpsertOutcome::Applied => {
                    info!(tag = %tag, "scan recorded");
                    return Ok(SubmitOutcome::Applied);
                }
                UpsertOutcome::DuplicateRejected => {
                    info!(tag = %tag, "scan already recorded today");
                    return Ok(SubmitOutcome::DuplicateRejected);
                }
                UpsertOutcome::ValidationFailed => {
                    warn!(tag = %tag, "scan refused by record store: not yet matched");
                    return Ok(SubmitOutcome::ValidationFailed);
                }
                UpsertOutcome::Error(e) if e.is_connectivity() => {
                    self.monitor.update(false);
                    if !self.fallback_to_buffer {
                        error!(tag = %tag, error = %e, "record store unreachable");
                        return Err(e.into());
                    }
                    warn!(tag = %tag, error = %e, "record store unreachable, buffering scan");
                }
                UpsertOutcome::Error(e) => {
                    error!(tag = %tag, error = %e, "upsert failed");
                    return Err(e.into());
                }
            }
        }

        self.buffer(&tag, captured_at)
    }

    fn buffer(&self, tag: &EpcCode, captured_at: DateTime<Utc>) -> Result<SubmitOutcome> {
        let inserted = self.queue.insert_if_absent(
            tag,
            &self.identity.station_no,
            OFFLINE_ORIGIN,
            captured_at,
        );

        match inserted {
            Ok(InsertOutcome::Inserted(write)) => {
                info!(tag = %tag, id = %write.id, "offline: scan saved locally");
                Ok(SubmitOutcome::Buffered)
            }
            Ok(InsertOutcome::DuplicatePending(_)) => {
                info!(tag = %tag, "offline: tag already waiting for sync");
                Ok(SubmitOutcome::DuplicatePending)
            }
            Err(e) => {
                error!(tag = %tag, error = %e, "scan lost: could not save locally");
                Err(e)
            }
        }
    }
}
