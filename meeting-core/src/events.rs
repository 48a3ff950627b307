use shared_protocol::ServerMessage;
use tokio::sync::mpsc;

use crate::error::CoreError;

/// Producer half of the bounded event channel. `put` exerts backpressure
/// by blocking (awaiting) once the channel is full, matching spec's
/// "producer blocks rather than drops" contract; `try_put` is the
/// non-blocking variant for call sites that must never await (and which
/// report `EventChannelFull` instead).
#[derive(Clone)]
pub struct EventProducer {
    tx: mpsc::Sender<ServerMessage>,
}

impl EventProducer {
    pub async fn put(&self, event: ServerMessage) {
        // The receiver is held by the same session for its whole
        // lifetime; a closed channel here means the session is already
        // shutting down, so dropping the event is correct.
        let _ = self.tx.send(event).await;
    }

    pub fn try_put(&self, event: ServerMessage) -> Result<(), CoreError> {
        self.tx
            .try_send(event)
            .map_err(|_| CoreError::EventChannelFull)
    }
}

/// Consumer half of the bounded event channel, read by the transport
/// layer and forwarded to the client as JSON text frames.
pub struct EventConsumer {
    rx: mpsc::Receiver<ServerMessage>,
}

impl EventConsumer {
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }
}

/// Creates a bounded FIFO event channel with the given capacity.
pub fn channel(capacity: usize) -> (EventProducer, EventConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventProducer { tx }, EventConsumer { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_protocol::{SystemComponents, ServerMessage};

    #[tokio::test]
    async fn put_then_recv_preserves_order() {
        let (tx, mut rx) = channel(4);
        tx.put(ServerMessage::SystemStatus {
            status: "ready".into(),
            components: SystemComponents {
                audio: true,
                llm: false,
                rag: false,
            },
        })
        .await;
        tx.put(ServerMessage::SystemStatus {
            status: "busy".into(),
            components: SystemComponents {
                audio: true,
                llm: false,
                rag: false,
            },
        })
        .await;

        let first = rx.recv().await.unwrap();
        match first {
            ServerMessage::SystemStatus { status, .. } => assert_eq!(status, "ready"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn try_put_reports_full_channel() {
        let (tx, _rx) = channel(1);
        let msg = || ServerMessage::SystemStatus {
            status: "x".into(),
            components: SystemComponents {
                audio: true,
                llm: true,
                rag: true,
            },
        };
        assert!(tx.try_put(msg()).is_ok());
        assert!(tx.try_put(msg()).is_err());
    }
}
