//! Bounded channels connecting pipeline stages.
//!
//! A conduit is an `async_channel` underneath: FIFO per producer, and every
//! item is handed to exactly one receiver no matter how many clones of the
//! [`Receiver`] are reading. Closing keeps buffered items readable.
//!
//! Capacity 0 is a rendezvous: `send` only returns once a receiver has taken
//! the item. `async_channel` has no zero-capacity mode, so the item travels
//! through a one-slot buffer together with an acknowledgement the receiver
//! fires on delivery.

use crate::cancel::CancellationSignal;
use futures::stream::{Stream, StreamExt};
use tokio::sync::oneshot;

/// Why a send or receive returned without moving an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// The pipeline's cancellation signal was raised.
    Cancelled,
    /// On receive: the conduit is closed and drained.
    /// On send: every receiver is gone.
    Closed,
}

struct Envelope<T> {
    item: T,
    ack: Option<oneshot::Sender<()>>,
}

impl<T> Envelope<T> {
    fn open(self) -> T {
        if let Some(ack) = self.ack {
            // The sender may have been cancelled while waiting; nothing to do then.
            let _ = ack.send(());
        }
        self.item
    }
}

/// Create a conduit holding at most `capacity` undelivered items.
pub fn conduit<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = async_channel::bounded(capacity.max(1));
    (
        Sender {
            inner: tx,
            rendezvous: capacity == 0,
        },
        Receiver { inner: rx },
    )
}

/// Producing end of a conduit.
///
/// Not cloneable outside the crate: whoever holds a `Sender` is the producer
/// that closes it, and [`Sender::close`] consumes it.
pub struct Sender<T> {
    inner: async_channel::Sender<Envelope<T>>,
    rendezvous: bool,
}

impl<T> Sender<T> {
    /// Send one item, suspending while the conduit is full. Cancellation is
    /// checked first, so a raised signal wins over free capacity.
    pub async fn send(&self, item: T, signal: &CancellationSignal) -> Result<(), Halt> {
        let (ack, delivered) = if self.rendezvous {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        tokio::select! {
            biased;
            _ = signal.cancelled() => return Err(Halt::Cancelled),
            sent = self.inner.send(Envelope { item, ack }) => {
                if sent.is_err() {
                    return Err(Halt::Closed);
                }
            }
        }

        if let Some(delivered) = delivered {
            tokio::select! {
                biased;
                _ = signal.cancelled() => return Err(Halt::Cancelled),
                taken = delivered => {
                    // Envelope dropped unread: the receivers went away.
                    if taken.is_err() {
                        return Err(Halt::Closed);
                    }
                }
            }
        }

        Ok(())
    }

    /// Another handle onto the same conduit, for producers that share an
    /// output and are closed together by their owner.
    pub(crate) fn share(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            rendezvous: self.rendezvous,
        }
    }

    /// Close the conduit. Receivers still get everything already buffered.
    pub fn close(self) {
        self.inner.close();
    }

    /// Whether the conduit has been closed, by either side.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Consuming end of a conduit. Clones compete for items.
pub struct Receiver<T> {
    inner: async_channel::Receiver<Envelope<T>>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Receiver<T> {
    /// Next item, or `None` once the conduit is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        self.inner.recv().await.ok().map(Envelope::open)
    }

    /// Next item, racing the read against cancellation.
    pub async fn recv_until_cancelled(&self, signal: &CancellationSignal) -> Result<T, Halt> {
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(Halt::Cancelled),
            received = self.inner.recv() => match received {
                Ok(envelope) => Ok(envelope.open()),
                Err(_) => Err(Halt::Closed),
            },
        }
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Consume the conduit as a stream that ends when it is closed and drained.
    pub fn into_stream(self) -> impl Stream<Item = T> {
        self.inner.map(Envelope::open)
    }
}
