use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::Error;

/// A delivered message that must be settled exactly once.
pub trait Message: Send + 'static {
    fn data(&self) -> &[u8];

    /// Settles the message: `true` acknowledges it, `false` hands it back for redelivery.
    ///
    /// Returns immediately; the backend call happens in the background.
    fn done(self, ack: bool);
}

#[async_trait::async_trait]
pub trait Consumer: Send + Sync {
    type Message: Message;

    /// Opens the delivery stream. Only one stream may be active per consumer.
    async fn consume(&self) -> Result<Delivery<Self::Message>, Error>;

    /// Deletes the subscription and stops delivery. The topic is left alone.
    async fn remove(&self) -> Result<(), Error>;

    /// Whether the subscription still exists. Any failure counts as not alive.
    async fn alive(&self) -> bool;
}

/// Receiving end of a delivery stream.
///
/// Yields `None` once the receive loop has stopped, whatever the reason;
/// [`Delivery::finish`] tells which.
pub struct Delivery<M> {
    messages: ReceiverStream<M>,
    outcome: oneshot::Receiver<Result<(), Error>>,
    cancel: CancellationToken,
    _stop_on_drop: DropGuard,
}

impl<M> Delivery<M>
where
    M: Message,
{
    pub fn new(
        messages: mpsc::Receiver<M>,
        outcome: oneshot::Receiver<Result<(), Error>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            messages: ReceiverStream::new(messages),
            outcome,
            _stop_on_drop: cancel.clone().drop_guard(),
            cancel,
        }
    }

    pub async fn recv(&mut self) -> Option<M> {
        self.messages.next().await
    }

    /// Stops the receive loop. Messages already received stay with the caller.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stops the receive loop and reports how it ended.
    ///
    /// Messages still queued in the stream are handed back for redelivery.
    pub async fn finish(mut self) -> Result<(), Error> {
        self.cancel.cancel();

        while let Some(message) = self.messages.next().await {
            message.done(false);
        }

        // A loop that vanished without reporting was torn down with its runtime.
        (&mut self.outcome).await.unwrap_or(Ok(()))
    }
}

impl<M> Stream for Delivery<M> {
    type Item = M;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<M>> {
        self.get_mut().messages.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    type Settled = Arc<Mutex<Vec<(Vec<u8>, bool)>>>;

    struct RecordedMessage {
        data: Vec<u8>,
        settled: Settled,
    }

    impl Message for RecordedMessage {
        fn data(&self) -> &[u8] {
            &self.data
        }

        fn done(self, ack: bool) {
            self.settled.lock().unwrap().push((self.data.clone(), ack));
        }
    }

    #[tokio::test]
    async fn hand_back_queued_messages_on_finish() {
        let settled = Settled::default();
        let (sender, receiver) = mpsc::channel(2);
        let (outcome_sender, outcome) = oneshot::channel();
        let cancel = CancellationToken::new();

        for data in ["a", "b"] {
            let message = RecordedMessage {
                data: data.into(),
                settled: settled.clone(),
            };
            assert!(sender.send(message).await.is_ok());
        }

        let stopped = cancel.clone();
        tokio::spawn(async move {
            stopped.cancelled().await;
            let _ = outcome_sender.send(Ok(()));
            drop(sender);
        });

        let delivery = Delivery::new(receiver, outcome, cancel);

        assert!(delivery.finish().await.is_ok());
        assert_eq!(
            *settled.lock().unwrap(),
            vec![(b"a".to_vec(), false), (b"b".to_vec(), false)]
        );
    }

    #[tokio::test]
    async fn report_how_the_loop_ended() {
        let (sender, receiver) = mpsc::channel::<RecordedMessage>(1);
        let (outcome_sender, outcome) = oneshot::channel();
        let _ = outcome_sender.send(Err(Error::Removed("test-subscription".into())));
        drop(sender);

        let mut delivery = Delivery::new(receiver, outcome, CancellationToken::new());

        assert!(delivery.recv().await.is_none());
        assert!(matches!(delivery.finish().await, Err(Error::Removed(_))));
    }

    #[tokio::test]
    async fn stop_receive_loop_when_dropped() {
        let (_sender, receiver) = mpsc::channel::<RecordedMessage>(1);
        let (_outcome_sender, outcome) = oneshot::channel();
        let cancel = CancellationToken::new();

        drop(Delivery::new(receiver, outcome, cancel.clone()));

        assert!(cancel.is_cancelled());
    }
}
