//! Cooperative cancellation shared by every long-lived simulation task.

use tokio::sync::watch;

/// Creates a linked shutdown handle/signal pair.
#[must_use]
pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

/// Owning side; dropping it without calling [`ShutdownHandle::shutdown`]
/// also releases all waiters.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Signals every subscriber. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Cloneable subscriber observed at every wait point.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is signalled (or the handle is gone).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_observes_shutdown() {
        let (handle, signal) = shutdown_channel();
        assert!(!signal.is_cancelled());
        handle.shutdown();
        assert!(signal.is_cancelled());
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn dropped_handle_releases_waiters() {
        let (handle, signal) = shutdown_channel();
        drop(handle);
        signal.cancelled().await;
    }
}
