//! Fan-out broadcast primitive.
//!
//! One producer, many independently-paced consumers. Delivery is
//! best-effort and non-blocking: a receiver whose buffer is full drops the
//! value rather than stalling the publisher or other receivers. This is a
//! deliberate trade-off - the broadcaster carries liveness/progress events
//! (pre/post-dump notifications, exit codes), not data that must never be
//! lost, so a slow consumer can miss events. Consumers that need every
//! value must size their buffer accordingly.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

/// Default per-receiver buffer capacity.
const DEFAULT_CAPACITY: usize = 16;

struct Inner<T> {
    receivers: Vec<SyncSender<T>>,
    closed: bool,
}

/// Broadcasts cloned values to every attached receiver.
///
/// `attach`, `publish`, and `close` are all safe to call concurrently;
/// attaching after close yields an immediately-closed, empty receiver.
pub struct Broadcaster<T> {
    inner: Arc<Mutex<Inner<T>>>,
    capacity: usize,
}

impl<T> Broadcaster<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        // A panicked publisher leaves no partial state worth rejecting.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            capacity: self.capacity,
        }
    }
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broadcaster whose receivers buffer up to `capacity`
    /// values before further publishes are dropped for that receiver.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                receivers: Vec::new(),
                closed: false,
            })),
            capacity: capacity.max(1),
        }
    }

    /// Attach a fresh receiver. If the broadcaster is already closed the
    /// receiver observes end-of-stream immediately, with zero values.
    pub fn attach(&self) -> Receiver<T> {
        let (tx, rx) = sync_channel(self.capacity);
        let mut inner = self.lock();
        if !inner.closed {
            inner.receivers.push(tx);
        }
        // When closed, tx is dropped here and rx is already disconnected.
        rx
    }

    /// Deliver `value` to every currently-attached receiver,
    /// non-blockingly. Receivers with a full buffer miss this value;
    /// disconnected receivers are pruned.
    pub fn publish(&self, value: T) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        let mut dropped = 0usize;
        inner.receivers.retain(|tx| match tx.try_send(value.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        if dropped > 0 {
            tracing::trace!(dropped, "broadcast value dropped for slow receivers");
        }
    }

    /// Signal end-of-stream. Attached receivers drain whatever they have
    /// buffered and then see the channel close. Idempotent.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.receivers.clear();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::TryRecvError;

    #[test]
    fn test_fan_out_in_order() {
        let bc = Broadcaster::new();
        let r1 = bc.attach();
        let r2 = bc.attach();

        for i in 0..5 {
            bc.publish(i);
        }
        bc.close();

        assert_eq!(r1.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(r2.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_attach_after_close_is_empty_and_closed() {
        let bc = Broadcaster::new();
        bc.publish(1);
        bc.close();

        let rx = bc.attach();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn test_slow_receiver_drops_without_blocking() {
        let bc = Broadcaster::with_capacity(2);
        let slow = bc.attach();

        // Publishes beyond the buffer capacity must not block.
        for i in 0..10 {
            bc.publish(i);
        }
        bc.close();

        // The slow receiver sees only the first two values.
        assert_eq!(slow.iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_detached_receiver_is_pruned() {
        let bc = Broadcaster::new();
        let rx = bc.attach();
        drop(rx);
        bc.publish(42); // must not panic or error
        let rx2 = bc.attach();
        bc.publish(7);
        bc.close();
        assert_eq!(rx2.iter().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn test_concurrent_publish_and_attach() {
        let bc = Broadcaster::with_capacity(128);
        let publisher = {
            let bc = bc.clone();
            std::thread::spawn(move || {
                for i in 0..100 {
                    bc.publish(i);
                }
                bc.close();
            })
        };
        // Attaching concurrently with publishing must never panic; the
        // receiver observes a (possibly empty) in-order suffix.
        let rx = bc.attach();
        let seen: Vec<i32> = rx.iter().collect();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        publisher.join().unwrap();
    }
}
