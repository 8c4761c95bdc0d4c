//! The transport collaborator seam.
//!
//! A [`Transport`] delivers whole frames in both directions; framing, TCP,
//! TLS, and reconnection live behind this trait. The connection takes the
//! event stream exactly once and registers itself as the inbound sink.
//!
//! [`loopback`] provides an in-process pipe used by the test suite and local
//! development; it is not a network transport.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// What a transport can hand the connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete inbound frame.
    Frame(Bytes),
    /// The link dropped; the transport will try to restore it.
    Interrupted,
    /// The link is back; the connection re-announces its state.
    Resumed,
    /// The link is gone for good.
    Broken(String),
}

/// Bidirectional framed command delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes one frame, fire-and-forget.
    async fn oneway(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Hands over the inbound event stream; `None` after the first call.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// Notified once the client finished clearing in-flight messages after
    /// an interruption, so the transport may resume inbound delivery.
    fn interruption_processing_complete(&self) {}

    /// Shuts the link down.
    async fn close(&self) -> Result<(), TransportError>;
}

pub mod loopback {
    //! An in-process transport pair joined back to back.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::{Transport, TransportEvent};
    use crate::error::TransportError;

    /// One end of a loopback pipe.
    pub struct LoopbackTransport {
        to_peer: mpsc::Sender<TransportEvent>,
        events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
        closed: AtomicBool,
    }

    /// Builds a connected pair; frames written to one end arrive at the other.
    pub fn loopback_pair(capacity: usize) -> (LoopbackTransport, LoopbackTransport) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            LoopbackTransport {
                to_peer: b_tx,
                events: Mutex::new(Some(a_rx)),
                closed: AtomicBool::new(false),
            },
            LoopbackTransport {
                to_peer: a_tx,
                events: Mutex::new(Some(b_rx)),
                closed: AtomicBool::new(false),
            },
        )
    }

    impl LoopbackTransport {
        /// Injects a non-frame event into the peer's stream (test hook).
        pub async fn inject(&self, event: TransportEvent) -> Result<(), TransportError> {
            self.to_peer
                .send(event)
                .await
                .map_err(|_| TransportError::Closed)
        }
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn oneway(&self, frame: Bytes) -> Result<(), TransportError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.to_peer
                .send(TransportEvent::Frame(frame))
                .await
                .map_err(|_| TransportError::Closed)
        }

        fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
            self.events
                .lock()
                .ok()
                .and_then(|mut events| events.take())
        }

        async fn close(&self) -> Result<(), TransportError> {
            if !self.closed.swap(true, Ordering::SeqCst) {
                let _ = self
                    .to_peer
                    .send(TransportEvent::Broken("peer closed".to_string()))
                    .await;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::loopback::loopback_pair;
    use super::*;

    #[tokio::test]
    async fn frames_cross_the_pipe() {
        let (left, right) = loopback_pair(8);
        let mut right_events = right.take_events().expect("first take");

        left.oneway(Bytes::from_static(b"frame")).await.unwrap();
        match right_events.recv().await {
            Some(TransportEvent::Frame(frame)) => assert_eq!(&frame[..], b"frame"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_can_only_be_taken_once() {
        let (left, _right) = loopback_pair(8);
        assert!(left.take_events().is_some());
        assert!(left.take_events().is_none());
    }

    #[tokio::test]
    async fn close_breaks_the_peer() {
        let (left, right) = loopback_pair(8);
        let mut right_events = right.take_events().expect("first take");

        left.close().await.unwrap();
        assert!(matches!(
            right_events.recv().await,
            Some(TransportEvent::Broken(_))
        ));
        assert!(left.oneway(Bytes::from_static(b"late")).await.is_err());
    }
}
