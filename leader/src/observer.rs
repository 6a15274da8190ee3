//! Notifications about the progress of a key sync. These are purely
//! diagnostic and have no bearing on the outcome of a sync.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::sync::SyncState;

/// A sink for progress reports of key syncs
pub trait SyncObserver: Send + Sync {
    /// A request to `worker` failed and may be retried after `wait`
    fn attempt_failed(&self, worker: &str, attempt: u32, wait: Option<Duration>, reason: &str);

    /// A sync with `worker` advanced to `state`
    fn transition(&self, worker: &str, state: SyncState);

    /// A sync with `worker` has concluded
    fn finished(&self, worker: &str, outcome: Result<(), &SyncError>);
}

/// Reports every notification as a `tracing` event
#[derive(Debug, Default, Copy, Clone)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn attempt_failed(&self, worker: &str, attempt: u32, wait: Option<Duration>, reason: &str) {
        match wait {
            Some(wait) => {
                warn!("Attempt {attempt} with worker {worker} failed, retrying in {wait:?}: {reason}")
            }
            None => warn!("Attempt {attempt} with worker {worker} failed, giving up: {reason}"),
        }
    }

    fn transition(&self, worker: &str, state: SyncState) {
        debug!("Sync with worker {worker}: {state:?}");
    }

    fn finished(&self, worker: &str, outcome: Result<(), &SyncError>) {
        match outcome {
            Ok(()) => info!("Successfully synced with worker {worker}."),
            Err(e) if e.is_trust_failure() => {
                error!("Refusing to sync with untrusted worker {worker}: {e}")
            }
            Err(e) => error!("Error syncing with worker {worker}: {e}"),
        }
    }
}
