//! Connectivity Monitor
//!
//! Holds the station's online/offline flag. The flag is pushed in by a
//! probe and read by the write router; the sync scheduler subscribes to it
//! and starts a pass on every offline -> online transition.
//!
//! A fresh monitor starts **offline**: scans taken before the first
//! successful probe are buffered, and that first probe's transition runs
//! the start-up sync.

use tokio::sync::watch;
use tracing::{info, warn};

/// Change caused by an [`ConnectivityMonitor::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    CameOnline,
    WentOffline,
}

pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record a probe result
    pub fn update(&self, online: bool) -> Transition {
        let mut previous = online;
        self.tx.send_if_modified(|state| {
            previous = *state;
            if *state == online {
                false
            } else {
                *state = online;
                true
            }
        });

        match (previous, online) {
            (false, true) => {
                info!("network back online");
                Transition::CameOnline
            }
            (true, false) => {
                warn!("network offline, buffering scans locally");
                Transition::WentOffline
            }
            _ => Transition::Unchanged,
        }
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}
