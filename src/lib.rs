//! EPC Station - offline-first scan buffering and sync
//!
//! Records RFID scans against a remote record store, buffering them in a
//! local SQLite queue while the store is unreachable and replaying them
//! once the station is back online.
//!
//! ```text
//! scan ──► WriteRouter ──online──► RemoteSink ──► record store
//!              │                        ▲
//!           offline                     │
//!              ▼                        │
//!          LocalQueue ──► SyncReconciler┘
//!                              ▲
//!   ConnectivityProbe ──► ConnectivityMonitor ──► SyncScheduler
//! ```

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod models;
pub mod probe;
pub mod queue;
pub mod reconciler;
pub mod remote;
pub mod router;
pub mod scheduler;
pub mod station;

// Re-export commonly used types
pub use config::{StationConfig, StationIdentity};
pub use connectivity::{ConnectivityMonitor, Transition};
pub use error::{RemoteError, Result, StationError};
pub use models::{
    EpcCode, PendingWrite, SubmitOutcome, SyncState, SyncSummary, UpsertOutcome, UpsertRequest,
};
pub use queue::LocalQueue;
pub use reconciler::{SyncEvent, SyncReconciler, SyncStats};
pub use remote::{HttpRemoteSink, RemoteSink};
pub use scheduler::SyncHandle;
pub use station::{BackgroundTasks, Station};
