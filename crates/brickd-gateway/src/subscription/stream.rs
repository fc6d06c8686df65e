//! Consumer side of a device subscription

use std::pin::Pin;
use std::task::{Context, Poll};

use brickd_core::MessageClass;
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Outcome of handing one payload to a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// Buffer full: the payload was dropped and the slot closed
    Overflow,
    /// The consumer went away: the slot closed
    ConsumerGone,
    /// The slot was already closed; nothing was attempted
    Closed,
}

/// Producer side of a subscription, shared with the delivery callback
pub(crate) struct DeliverySlot {
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl DeliverySlot {
    pub(crate) fn new(sender: mpsc::Sender<Bytes>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    pub(crate) fn deliver(&self, payload: Bytes) -> Delivery {
        let mut sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Delivery::Closed;
        };

        match tx.try_send(payload) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                *sender = None;
                Delivery::Overflow
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                *sender = None;
                Delivery::ConsumerGone
            }
        }
    }

    /// Release the sender so the consumer sees end of stream after draining.
    /// Returns false if it was already released.
    pub(crate) fn close(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Stream of raw payloads delivered to one device for one message class.
///
/// The stream is lossy: if the consumer falls behind by more than the
/// configured buffer, the subscription is dropped and the stream ends after
/// the buffered payloads. It is not restartable; watch again for a new one.
/// Dropping the stream cancels the subscription.
pub struct DeviceStream {
    inner: ReceiverStream<Bytes>,
    watch: CancellationToken,
    device_id: String,
    class: MessageClass,
}

impl DeviceStream {
    pub(crate) fn new(
        receiver: mpsc::Receiver<Bytes>,
        watch: CancellationToken,
        device_id: String,
        class: MessageClass,
    ) -> Self {
        Self {
            inner: ReceiverStream::new(receiver),
            watch,
            device_id,
            class,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn class(&self) -> MessageClass {
        self.class
    }

    /// Stop delivery and unsubscribe. Payloads already buffered can still be read.
    pub fn cancel(&self) {
        self.watch.cancel();
    }
}

impl Stream for DeviceStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.watch.is_cancelled() {
            // Buffered payloads still drain, nothing new gets in
            self.inner.close();
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.watch.cancel();
    }
}

impl std::fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStream")
            .field("device_id", &self.device_id)
            .field("class", &self.class)
            .field("cancelled", &self.watch.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_first_overflow_closes_slot() {
        let (tx, _rx) = mpsc::channel(2);
        let slot = DeliverySlot::new(tx);

        assert_eq!(slot.deliver(Bytes::from("1")), Delivery::Delivered);
        assert_eq!(slot.deliver(Bytes::from("2")), Delivery::Delivered);
        assert_eq!(slot.deliver(Bytes::from("3")), Delivery::Overflow);
        assert_eq!(slot.deliver(Bytes::from("4")), Delivery::Closed);
        assert!(slot.is_closed());
    }

    #[test]
    fn test_dropped_consumer() {
        let (tx, rx) = mpsc::channel(2);
        let slot = DeliverySlot::new(tx);
        drop(rx);
        assert_eq!(slot.deliver(Bytes::from("1")), Delivery::ConsumerGone);
        assert!(!slot.close());
    }

    #[tokio::test]
    async fn test_stream_drains_then_ends_after_close() {
        let (tx, rx) = mpsc::channel(4);
        let slot = DeliverySlot::new(tx);
        let token = CancellationToken::new();
        let mut stream =
            DeviceStream::new(rx, token.clone(), "sensor-1".into(), MessageClass::Config);

        slot.deliver(Bytes::from("a"));
        slot.deliver(Bytes::from("b"));
        assert!(slot.close());

        assert_eq!(stream.next().await, Some(Bytes::from("a")));
        assert_eq!(stream.next().await, Some(Bytes::from("b")));
        assert_eq!(stream.next().await, None);

        drop(stream);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_without_slot_close() {
        let (tx, rx) = mpsc::channel(4);
        let slot = DeliverySlot::new(tx);
        let token = CancellationToken::new();
        let mut stream =
            DeviceStream::new(rx, token.clone(), "sensor-1".into(), MessageClass::Config);

        slot.deliver(Bytes::from("before"));
        stream.cancel();

        assert_eq!(stream.next().await, Some(Bytes::from("before")));
        assert_eq!(slot.deliver(Bytes::from("after")), Delivery::ConsumerGone);
        assert_eq!(stream.next().await, None);
    }
}
