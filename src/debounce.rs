//! Trailing-edge debouncer
//!
//! Every `trigger()` restarts the quiet period; the action runs once the
//! triggers have been quiet for the whole window. The action runs on a single
//! worker task, so triggers that arrive while it is executing are coalesced
//! into exactly one follow-up run instead of overlapping it.
//!
//! Dropping the debouncer abandons a pending run but lets a running action
//! complete.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    /// Spawns the worker. Must be called from within a tokio runtime.
    pub fn new<F, Fut>(window: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            loop {
                if rx.recv().await.is_none() {
                    return;
                }

                loop {
                    match tokio::time::timeout(window, rx.recv()).await {
                        Ok(Some(())) => trace!("Debounce window restarted"),
                        // owner dropped: the pending run is abandoned
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }

                action().await;
            }
        });

        Self { tx }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}
