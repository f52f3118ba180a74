//! Checkpointer thread
//!
//! The one thread that runs checkpoints. It evaluates the trigger policy on
//! every tick and serves explicit requests in between.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{GridError, Result};

use super::{Checkpoint, CheckpointCoordinator, CheckpointReason};

enum Request {
    Checkpoint(CheckpointReason, Sender<Result<Checkpoint>>),
    Shutdown,
}

/// Handle to the background checkpoint thread
pub struct Checkpointer {
    requests: Option<Sender<Request>>,
    handle: Option<JoinHandle<()>>,
}

impl Checkpointer {
    /// Start the thread; the trigger policy is checked every `tick`
    pub fn start(coordinator: Arc<CheckpointCoordinator>, tick: Duration) -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name("gridvault-checkpointer".to_string())
            .spawn(move || run_loop(coordinator, rx, tick))?;

        Ok(Self {
            requests: Some(tx),
            handle: Some(handle),
        })
    }

    /// Ask the thread for a checkpoint and wait for its outcome
    pub fn request(&self, reason: CheckpointReason) -> Result<Checkpoint> {
        let requests = self.requests.as_ref().ok_or(GridError::Shutdown)?;
        let (reply_tx, reply_rx) = channel::bounded(1);
        requests
            .send(Request::Checkpoint(reason, reply_tx))
            .map_err(|_| GridError::Shutdown)?;
        reply_rx.recv().map_err(|_| GridError::Shutdown)?
    }

    /// Stop the thread after any in-flight checkpoint completes
    pub fn stop(&mut self) {
        if let Some(tx) = self.requests.take() {
            let _ = tx.send(Request::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(coordinator: Arc<CheckpointCoordinator>, requests: Receiver<Request>, tick: Duration) {
    debug!(tick_ms = tick.as_millis() as u64, "checkpointer started");
    let ticker = channel::tick(tick);
    loop {
        crossbeam::select! {
            recv(requests) -> request => match request {
                Ok(Request::Checkpoint(reason, reply)) => {
                    let _ = reply.send(coordinator.checkpoint(reason));
                }
                Ok(Request::Shutdown) | Err(_) => break,
            },
            recv(ticker) -> _ => {
                if let Some(reason) = coordinator.should_trigger() {
                    if let Err(e) = coordinator.checkpoint(reason) {
                        warn!(%reason, error = %e, "triggered checkpoint failed");
                    }
                }
            }
        }
    }
    debug!("checkpointer stopped");
}
