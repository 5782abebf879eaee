//! `StreamBridge`: binds one remote connection to an orchestrator event
//! stream, propagating disconnect as abort.
//!
//! A thin layer that owns the request's lifetime and forwards events to
//! the transport — an axum SSE body the node binary streams out.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::types::OrchestratorEvent;

/// The per-connection sink a `StreamBridge` writes framed events to. The
/// node binary implements this over an axum SSE `Sender`; tests implement it
/// over a `Vec`.
#[async_trait::async_trait]
pub trait ClientSink: Send + Sync {
    /// Forward one event to the remote connection. Returns `Err` once the
    /// connection is gone — the bridge treats any error as a disconnect.
    async fn send(&self, event: &OrchestratorEvent) -> Result<(), ()>;
}

/// Byte-count threshold past which the bridge emits one backpressure warning
/// and never repeats it for the life of the connection.
const BACKPRESSURE_WARN_BYTES: usize = 1 << 20; // 1 MiB

/// Binds one orchestrator event channel to one `ClientSink`. `abort` is
/// shared with the orchestrator's request task: the bridge flips it the
/// moment the sink reports disconnect, and the orchestrator's suspension
/// points (adapter reads, tool dispatch) observe it on their next check.
pub struct StreamBridge {
    abort: Arc<AtomicBool>,
    buffered_bytes: AtomicUsize,
    warned: AtomicBool,
}

impl StreamBridge {
    pub fn new(abort: Arc<AtomicBool>) -> Self {
        Self {
            abort,
            buffered_bytes: AtomicUsize::new(0),
            warned: AtomicBool::new(false),
        }
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Drains `rx` until it closes or the sink reports disconnect, forwarding
    /// every event to `sink`. On disconnect, flips `abort` so the
    /// orchestrator's next suspension point observes cancellation and tears
    /// down the adapter via its escalated kill path.
    pub async fn run(&self, mut rx: mpsc::Receiver<OrchestratorEvent>, sink: Arc<dyn ClientSink>) {
        while let Some(event) = rx.recv().await {
            if self.abort.load(Ordering::SeqCst) {
                break;
            }
            self.track_backpressure(&event);
            if sink.send(&event).await.is_err() {
                self.abort.store(true, Ordering::SeqCst);
                break;
            }
        }
        // Drain whatever the orchestrator still pushes after we've stopped
        // forwarding, so its sender never blocks on a dead receiver.
        while rx.recv().await.is_some() {}
    }

    fn track_backpressure(&self, event: &OrchestratorEvent) {
        let approx_len = match event {
            OrchestratorEvent::Token { delta } => delta.len(),
            OrchestratorEvent::ToolExecuted { result, .. } => result.to_string().len(),
            _ => 64,
        };
        let total = self.buffered_bytes.fetch_add(approx_len, Ordering::Relaxed) + approx_len;
        if total > BACKPRESSURE_WARN_BYTES && !self.warned.swap(true, Ordering::SeqCst) {
            warn!(buffered_bytes = total, "stream backpressure threshold exceeded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct VecSink {
        events: Mutex<Vec<OrchestratorEvent>>,
        fail_after: Option<usize>,
    }

    #[async_trait::async_trait]
    impl ClientSink for VecSink {
        async fn send(&self, event: &OrchestratorEvent) -> Result<(), ()> {
            let mut events = self.events.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if events.len() >= limit {
                    return Err(());
                }
            }
            events.push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn forwards_every_event_until_channel_closes() {
        let abort = Arc::new(AtomicBool::new(false));
        let bridge = StreamBridge::new(abort.clone());
        let sink = Arc::new(VecSink { events: Mutex::new(Vec::new()), fail_after: None });
        let (tx, rx) = mpsc::channel(16);

        tx.send(OrchestratorEvent::Token { delta: "a".into() }).await.unwrap();
        tx.send(OrchestratorEvent::Token { delta: "b".into() }).await.unwrap();
        drop(tx);

        bridge.run(rx, sink.clone()).await;
        assert_eq!(sink.events.lock().unwrap().len(), 2);
        assert!(!abort.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn sink_failure_flips_abort_and_stops_forwarding() {
        let abort = Arc::new(AtomicBool::new(false));
        let bridge = StreamBridge::new(abort.clone());
        let sink = Arc::new(VecSink { events: Mutex::new(Vec::new()), fail_after: Some(1) });
        let (tx, rx) = mpsc::channel(16);

        tx.send(OrchestratorEvent::Token { delta: "a".into() }).await.unwrap();
        tx.send(OrchestratorEvent::Token { delta: "b".into() }).await.unwrap();
        tx.send(OrchestratorEvent::Token { delta: "c".into() }).await.unwrap();
        drop(tx);

        bridge.run(rx, sink.clone()).await;
        assert_eq!(sink.events.lock().unwrap().len(), 1);
        assert!(abort.load(Ordering::SeqCst));
    }
}
