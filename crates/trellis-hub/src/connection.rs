use axum::extract::ws::{CloseFrame, Message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::warn;
use trellis_core::protocol::{encode_message, ServerMsg};
use trellis_core::session::SessionId;

/// One open WebSocket. Outbound frames go through a bounded queue drained
/// by the connection's writer task.
pub struct Connection {
    pub conn_id: String,
    pub session_id: SessionId,
    sender: mpsc::Sender<Message>,
    last_seen: AsyncMutex<Instant>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(conn_id: String, session_id: SessionId, sender: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(Self {
            conn_id,
            session_id,
            sender,
            last_seen: AsyncMutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        })
    }

    pub async fn touch(&self) {
        let mut last = self.last_seen.lock().await;
        *last = Instant::now();
    }

    pub async fn last_seen(&self) -> Instant {
        *self.last_seen.lock().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    pub async fn send_text(&self, text: String) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.sender.send(Message::Text(text)).await.is_ok()
    }

    pub async fn send_msg(&self, msg: &ServerMsg) -> bool {
        match encode_message(msg) {
            Ok(text) => self.send_text(text).await,
            Err(err) => {
                warn!(event = "encode_failed", conn_id = %self.conn_id, error = %err);
                false
            }
        }
    }

    pub async fn ping(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.sender.send(Message::Ping(Vec::new())).await.is_ok()
    }

    /// Queues a close frame; later sends are refused.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self
            .sender
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: reason.to_string().into(),
            })))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_is_sent_once_and_blocks_later_frames() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::new("conn-1".to_string(), "s1".to_string(), tx);

        assert!(conn.send_msg(&ServerMsg::error("x", "y", None)).await);
        conn.close("bye").await;
        conn.close("again").await;
        assert!(!conn.send_text("late".to_string()).await);
        assert!(conn.is_closed());

        assert!(matches!(rx.recv().await, Some(Message::Text(_))));
        assert!(matches!(rx.recv().await, Some(Message::Close(_))));
        drop(conn);
        assert!(rx.recv().await.is_none());
    }
}
