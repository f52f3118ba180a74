//! Background WAL flusher
//!
//! Under [`WalSyncStrategy::Background`](crate::config::WalSyncStrategy)
//! appends only buffer; this thread bounds how long a record can stay
//! non-durable.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use tracing::{debug, warn};

use super::manager::WalManager;

/// Periodic fsync thread; stopped on [`WalFlusher::stop`] or drop
pub struct WalFlusher {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl WalFlusher {
    pub fn start(wal: Arc<WalManager>, interval: Duration) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(interval);

        let handle = thread::Builder::new()
            .name("gridvault-wal-flusher".to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "WAL flusher started");
                loop {
                    crossbeam::select! {
                        recv(ticker) -> _ => {
                            if wal.is_failed() {
                                break;
                            }
                            if let Err(e) = wal.flush() {
                                warn!(error = %e, "background WAL fsync failed");
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                if !wal.is_failed() {
                    if let Err(e) = wal.flush() {
                        warn!(error = %e, "final WAL fsync failed");
                    }
                }
                debug!("WAL flusher stopped");
            })?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread after one last fsync
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WalFlusher {
    fn drop(&mut self) {
        self.stop();
    }
}
