use super::SchemaRegistry;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// Refreshes a registry on a background thread.
///
/// Failures are logged and the last good snapshot stays in place.
/// The thread stops when the refresher is dropped.
pub struct RegistryRefresher {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RegistryRefresher {
    pub fn start(registry: Arc<dyn SchemaRegistry>, interval: Duration) -> std::io::Result<Self> {
        let (stop, stopped) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("registry-refresh".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        debug!("Refreshing schema registry");
                        if let Err(e) = registry.refresh() {
                            error!(error = %e, "Schema registry refresh failed");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the thread's receiver.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RegistryRefresher {
    fn drop(&mut self) {
        self.stop();
    }
}
