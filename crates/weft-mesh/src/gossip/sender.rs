//! Coalescing per-destination sender.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{BoxFuture, GossipData};
use crate::error::MeshError;

/// Function that delivers one coalesced batch.
pub type SendFn<D> = Arc<dyn Fn(D) -> BoxFuture<'static, Result<(), MeshError>> + Send + Sync>;

/// Buffers gossip for one destination and sends it from a background task.
///
/// Data queued while a send is in flight is merged into a single pending
/// value, so at most one message per destination is outstanding. Once the
/// sender is stopped, or a send fails, further data is discarded.
pub struct GossipSender<D: GossipData> {
    pending: Arc<Mutex<Option<D>>>,
    more: mpsc::Sender<()>,
    finished: CancellationToken,
}

impl<D: GossipData> GossipSender<D> {
    /// Spawns the sender task on the current runtime.
    #[must_use]
    pub fn spawn(send: SendFn<D>) -> Self {
        let pending = Arc::new(Mutex::new(None));
        let (more_tx, more_rx) = mpsc::channel(1);
        let finished = CancellationToken::new();
        tokio::spawn(run(
            Arc::clone(&pending),
            more_rx,
            finished.clone(),
            send,
        ));
        Self {
            pending,
            more: more_tx,
            finished,
        }
    }

    /// Queues `data`, merging it with anything not yet sent.
    pub fn send(&self, data: D) {
        if self.finished.is_cancelled() {
            return;
        }
        {
            let mut pending = self.pending.lock();
            match pending.as_mut() {
                Some(existing) => existing.merge(data),
                None => *pending = Some(data),
            }
        }
        let _ = self.more.try_send(());
    }

    /// Stops the background task. Pending data is dropped.
    pub fn stop(&self) {
        self.finished.cancel();
    }

    /// Returns true once the sender has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }
}

impl<D: GossipData> Drop for GossipSender<D> {
    fn drop(&mut self) {
        self.finished.cancel();
    }
}

impl<D: GossipData> std::fmt::Debug for GossipSender<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipSender")
            .field("pending", &self.pending.lock().is_some())
            .field("finished", &self.is_finished())
            .finish()
    }
}

async fn run<D: GossipData>(
    pending: Arc<Mutex<Option<D>>>,
    mut more: mpsc::Receiver<()>,
    finished: CancellationToken,
    send: SendFn<D>,
) {
    loop {
        tokio::select! {
            () = finished.cancelled() => break,
            prod = more.recv() => {
                if prod.is_none() {
                    break;
                }
                let next = pending.lock().take();
                let Some(data) = next else { continue };
                if let Err(err) = send(data).await {
                    debug!(error = %err, "gossip sender stopping");
                    finished.cancel();
                    break;
                }
            }
        }
    }
}
