//! Stream multiplexer: fans outgoing frames to the right client
//! connection by opaque handle.
//!
//! The mux owns connections for their lifetime; workers hold only the
//! handle and treat handle → connection strictly as a lookup. Per-handle
//! ordering is guaranteed by the single mpsc channel behind each
//! handle. A connection whose buffer stays saturated past the send
//! timeout is closed and its handle invalidated; subsequent sends are
//! silent no-ops.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use gantry_kernel::frames::ServerFrame;

/// Frames buffered per connection before back-pressure kicks in.
const CHANNEL_DEPTH: usize = 256;

struct ClientConn {
    sender: mpsc::Sender<ServerFrame>,
    /// Fired on unregister or forced close; the worker observes this as
    /// its client-gone signal.
    gone: CancellationToken,
}

pub struct StreamMux {
    connections: DashMap<String, ClientConn>,
    send_timeout: Duration,
}

impl StreamMux {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            send_timeout,
        }
    }

    /// Register a connection; the returned receiver is pumped by the
    /// transport task. Registering an existing handle replaces the old
    /// connection and fires its client-gone token.
    pub fn register(&self, handle: &str) -> mpsc::Receiver<ServerFrame> {
        let (sender, receiver) = mpsc::channel(CHANNEL_DEPTH);
        let conn = ClientConn {
            sender,
            gone: CancellationToken::new(),
        };
        if let Some(old) = self.connections.insert(handle.to_string(), conn) {
            warn!(handle = %handle, "handle re-registered; closing previous connection");
            old.gone.cancel();
        }
        debug!(handle = %handle, "client registered");
        receiver
    }

    /// Best-effort close; further sends to the handle drop silently.
    pub fn unregister(&self, handle: &str) {
        if let Some((_, conn)) = self.connections.remove(handle) {
            conn.gone.cancel();
            debug!(handle = %handle, "client unregistered");
        }
    }

    /// Deliver a frame. Returns `false` when the handle is unknown or
    /// the connection was dropped for saturation.
    pub async fn send(&self, handle: &str, frame: ServerFrame) -> bool {
        let Some(sender) = self
            .connections
            .get(handle)
            .map(|conn| conn.sender.clone())
        else {
            return false;
        };

        match sender.send_timeout(frame, self.send_timeout).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(
                    handle = %handle,
                    timeout_secs = self.send_timeout.as_secs(),
                    "send buffer saturated; closing connection"
                );
                self.unregister(handle);
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                self.unregister(handle);
                false
            }
        }
    }

    pub fn is_connected(&self, handle: &str) -> bool {
        self.connections.contains_key(handle)
    }

    /// Token fired when the client goes away; cloned so the worker can
    /// select on it while streaming.
    pub fn client_gone(&self, handle: &str) -> CancellationToken {
        self.connections
            .get(handle)
            .map(|conn| conn.gone.clone())
            // Unknown handle: behave as already gone.
            .unwrap_or_else(|| {
                let token = CancellationToken::new();
                token.cancel();
                token
            })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drop every connection (shutdown path).
    pub fn close_all(&self) {
        let handles: Vec<String> = self
            .connections
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for handle in handles {
            self.unregister(&handle);
        }
    }
}

impl Default for StreamMux {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_frame(text: &str) -> ServerFrame {
        ServerFrame::Token {
            content: text.into(),
        }
    }

    #[tokio::test]
    async fn frames_arrive_in_send_order() {
        let mux = StreamMux::default();
        let mut rx = mux.register("h1");

        for i in 0..10 {
            assert!(mux.send("h1", token_frame(&format!("t{i}"))).await);
        }

        for i in 0..10 {
            match rx.recv().await.unwrap() {
                ServerFrame::Token { content } => assert_eq!(content, format!("t{i}")),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn unknown_handle_is_silent_noop() {
        let mux = StreamMux::default();
        assert!(!mux.send("ghost", token_frame("x")).await);
    }

    #[tokio::test]
    async fn register_unregister_roundtrip() {
        let mux = StreamMux::default();
        let _rx = mux.register("h1");
        assert!(mux.is_connected("h1"));

        mux.unregister("h1");
        assert!(!mux.is_connected("h1"));
        // Idempotent and silent afterwards.
        mux.unregister("h1");
        assert!(!mux.send("h1", token_frame("x")).await);
    }

    #[tokio::test]
    async fn unregister_fires_client_gone() {
        let mux = StreamMux::default();
        let _rx = mux.register("h1");
        let gone = mux.client_gone("h1");
        assert!(!gone.is_cancelled());

        mux.unregister("h1");
        assert!(gone.is_cancelled());
    }

    #[tokio::test]
    async fn unknown_handle_reads_as_gone() {
        let mux = StreamMux::default();
        assert!(mux.client_gone("ghost").is_cancelled());
    }

    #[tokio::test]
    async fn saturated_connection_is_dropped() {
        let mux = StreamMux::new(Duration::from_millis(20));
        // Receiver never drained.
        let _rx = mux.register("slow");

        // Fill the buffer, then one more send must time out and close.
        for _ in 0..CHANNEL_DEPTH {
            assert!(mux.send("slow", token_frame("x")).await);
        }
        assert!(!mux.send("slow", token_frame("overflow")).await);
        assert!(!mux.is_connected("slow"));
    }

    #[tokio::test]
    async fn no_frames_cross_handles() {
        let mux = StreamMux::default();
        let mut rx1 = mux.register("h1");
        let mut rx2 = mux.register("h2");

        mux.send("h1", token_frame("for-1")).await;
        mux.send("h2", token_frame("for-2")).await;

        match rx1.recv().await.unwrap() {
            ServerFrame::Token { content } => assert_eq!(content, "for-1"),
            other => panic!("unexpected frame {other:?}"),
        }
        match rx2.recv().await.unwrap() {
            ServerFrame::Token { content } => assert_eq!(content, "for-2"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn reregistration_replaces_connection() {
        let mux = StreamMux::default();
        let _old = mux.register("h1");
        let old_gone = mux.client_gone("h1");

        let mut new_rx = mux.register("h1");
        assert!(old_gone.is_cancelled());

        mux.send("h1", token_frame("fresh")).await;
        assert!(matches!(
            new_rx.recv().await.unwrap(),
            ServerFrame::Token { .. }
        ));
    }
}
