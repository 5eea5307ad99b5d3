//! Generic periodic background worker, used to drive the session-expiry
//! sweep (spec §4.3: tokens are swept on a fixed interval) and any other
//! fixed-interval task a server collaborator needs.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::debug;

/// A task driven by [`BackgroundWorker`] on a fixed tick.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// Invoked once per tick.
    async fn on_tick(&mut self);

    /// Invoked once when the worker is told to stop.
    async fn shutdown(&mut self) {}
}

/// Drives a [`BackgroundRunnable`] on a fixed interval until stopped.
pub struct BackgroundWorker {
    stop_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl BackgroundWorker {
    /// Spawns `task`, calling `on_tick` every `period` until the worker is
    /// stopped.
    pub fn spawn<T: BackgroundRunnable>(name: &'static str, period: Duration, mut task: T) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        task.on_tick().await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            debug!(worker = name, "stopping background worker");
                            task.shutdown().await;
                            break;
                        }
                    }
                }
            }
        });
        Self { stop_tx, handle }
    }

    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}
