//! Per-swap event dispatch.
//!
//! Every live swap owns one bounded event channel with a single consumer
//! task, so handlers run one at a time and never race on swap state. Each
//! event carries an optional reply channel whose resolution tells the
//! sender the event has been fully processed.

use tokio::sync::{mpsc, oneshot};

use crate::error::ProtocolError;

/// Event channel capacity; one slot keeps producers honest about ordering.
pub const EVENT_CHANNEL_SIZE: usize = 1;

pub struct Envelope<E> {
    pub event: E,
    pub reply: Option<oneshot::Sender<Result<(), ProtocolError>>>,
}

impl<E> Envelope<E> {
    pub fn new(event: E) -> (Self, oneshot::Receiver<Result<(), ProtocolError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                event,
                reply: Some(tx),
            },
            rx,
        )
    }

    pub fn fire_and_forget(event: E) -> Self {
        Self { event, reply: None }
    }
}

/// Enqueues an event and waits until the handler has processed it.
pub async fn deliver<E>(
    tx: &mpsc::Sender<Envelope<E>>,
    event: E,
) -> Result<(), ProtocolError> {
    let (envelope, reply) = Envelope::new(event);
    tx.send(envelope)
        .await
        .map_err(|_| ProtocolError::Cancelled)?;
    reply.await.map_err(|_| ProtocolError::Cancelled)?
}
