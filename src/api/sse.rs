//! Request-scoped SSE session.
//!
//! Services emit named events into an unbounded channel; the handler
//! renders the receiving side as an `axum` SSE body. `done` is always
//! the final event and is sent exactly once — emissions after it are
//! dropped, and the error helper closes the session with the standard
//! envelope.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::errors::{support_ref, ErrorKind};

#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: Value,
}

#[derive(Clone)]
pub struct SseSession {
    tx: mpsc::UnboundedSender<SseFrame>,
    done: Arc<AtomicBool>,
}

impl SseSession {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SseFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                done: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Emit a named event. Silently dropped once `done` has been sent or
    /// the client has gone away.
    pub fn emit(&self, event: &str, data: Value) {
        if self.done.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(SseFrame {
            event: event.to_string(),
            data,
        });
    }

    pub fn field(&self, name: &str, value: &Value) {
        self.emit("field", json!({ "field": name, "value": value }));
    }

    /// Standard error envelope followed by `done`.
    pub fn error(&self, kind: ErrorKind, message: &str, endpoint: &str) {
        let support = support_ref(kind, endpoint);
        tracing::error!(kind = %kind, support_ref = %support, endpoint, "{message}");
        self.emit(
            "error",
            json!({
                "type": kind.as_str(),
                "message": kind.user_message(),
                "retryable": kind.is_retryable(),
                "supportRef": support,
            }),
        );
        self.done();
    }

    /// Terminal event; exactly once per session.
    pub fn done(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(SseFrame {
            event: "done".to_string(),
            data: json!({}),
        });
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

/// Render the receiving side as an axum SSE response body.
pub fn into_sse_response(
    rx: mpsc::UnboundedReceiver<SseFrame>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = UnboundedReceiverStream::new(rx).map(|frame| {
        let event = Event::default().event(frame.event);
        Ok(event
            .json_data(&frame.data)
            .unwrap_or_else(|_| Event::default().data("{}")))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(mut rx: mpsc::UnboundedReceiver<SseFrame>) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        while let Ok(f) = rx.try_recv() {
            frames.push(f);
        }
        frames
    }

    #[tokio::test]
    async fn test_done_is_final_and_exactly_once() {
        let (session, rx) = SseSession::channel();
        session.field("producer", &json!("Penfolds"));
        session.done();
        session.done();
        session.emit("result", json!({"late": true}));

        let frames = drain(rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames.last().unwrap().event, "done");
        assert_eq!(frames.iter().filter(|f| f.event == "done").count(), 1);
    }

    #[tokio::test]
    async fn test_field_event_shape() {
        let (session, rx) = SseSession::channel();
        session.field("vintage", &json!("2019"));
        let frames = drain(rx);
        assert_eq!(frames[0].event, "field");
        assert_eq!(frames[0].data["field"], "vintage");
        assert_eq!(frames[0].data["value"], "2019");
    }

    #[tokio::test]
    async fn test_error_emits_envelope_then_done() {
        let (session, rx) = SseSession::channel();
        session.error(ErrorKind::Timeout, "upstream timed out", "identifyTextStream");
        let frames = drain(rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "error");
        assert_eq!(frames[0].data["type"], "timeout");
        assert_eq!(frames[0].data["retryable"], true);
        assert_eq!(frames[0].data["supportRef"].as_str().unwrap().len(), 8);
        assert_eq!(frames[1].event, "done");
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_panic() {
        let (session, rx) = SseSession::channel();
        drop(rx);
        session.field("x", &json!(1));
        session.done();
    }
}
