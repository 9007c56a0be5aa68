// ── Recipient streams ──
//
// Consumer-side handles for a recipient's batch and notification
// endpoints.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::batch::Batch;
use crate::model::{Notification, RecipientId};

/// Items delivered to one recipient, in delivery order.
///
/// Dropping the handle closes the endpoint: live-push notifications are
/// then deferred and batches count as failed deliveries.
pub struct RecipientStream<T> {
    recipient: RecipientId,
    receiver: mpsc::Receiver<T>,
}

pub type BatchStream = RecipientStream<Batch>;
pub type NotificationStream = RecipientStream<Arc<Notification>>;

impl<T> RecipientStream<T> {
    pub(crate) fn new(recipient: RecipientId, receiver: mpsc::Receiver<T>) -> Self {
        Self {
            recipient,
            receiver,
        }
    }

    pub fn recipient(&self) -> &RecipientId {
        &self.recipient
    }

    /// Wait for the next item. `None` once the engine drops the endpoint.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Take an already-delivered item without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> RecipientReceiverStream<T> {
        RecipientReceiverStream {
            inner: ReceiverStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter backed by the recipient's `mpsc::Receiver`.
pub struct RecipientReceiverStream<T> {
    inner: ReceiverStream<T>,
}

impl<T> Stream for RecipientReceiverStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        // ReceiverStream is Unpin regardless of T.
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn stream_yields_in_order_then_ends() {
        let (tx, rx) = mpsc::channel(4);
        let stream = RecipientStream::new("r".into(), rx);
        assert_eq!(stream.recipient().as_str(), "r");

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        drop(tx);

        let items: Vec<i32> = stream.into_stream().collect().await;
        assert_eq!(items, vec![1, 2]);
    }

    #[test]
    fn recv_wakes_when_an_item_arrives() {
        let (tx, rx) = mpsc::channel(1);
        let mut stream = RecipientStream::new("r".into(), rx);
        let mut recv = tokio_test::task::spawn(stream.recv());
        tokio_test::assert_pending!(recv.poll());

        tx.try_send(3).unwrap();
        assert!(recv.is_woken());
        tokio_test::assert_ready_eq!(recv.poll(), Some(3));
    }

    #[tokio::test]
    async fn try_recv_does_not_wait() {
        let (tx, rx) = mpsc::channel(1);
        let mut stream = RecipientStream::new("r".into(), rx);
        assert_eq!(stream.try_recv(), None::<u8>);
        tx.send(7).await.unwrap();
        assert_eq!(stream.try_recv(), Some(7));
    }
}
