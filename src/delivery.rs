//! Single-current-value broadcast channel for progressive image delivery.
//!
//! One producer publishes successive states of a single image request. Any
//! number of subscribers each receive their own ordered queue of updates,
//! starting with a replay of the value current at subscription time. The
//! last value stays readable synchronously, even after the channel finishes.
//!
//! `finish()` is idempotent: it ends every subscriber's sequence and runs the
//! registered finish handler exactly once. Publishing or subscribing after
//! finish is a programmer error and panics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flume::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::ImageError;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one delivery channel, stable across clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// One event observed by a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum Update<T> {
    Value(T),
    Failed(ImageError),
}

/// Result of polling a subscription without blocking.
#[derive(Debug, PartialEq)]
pub enum Next<T> {
    Update(Update<T>),
    /// Nothing queued yet; the producer may still publish.
    Pending,
    /// The channel finished (or was dropped) and the queue is drained.
    Ended,
}

type FinishHandler<T> = Box<dyn FnOnce(Option<&T>) + Send>;

struct ChannelState<T> {
    value: Option<T>,
    finished: bool,
    subscribers: Vec<Sender<Update<T>>>,
    finish_handler: Option<FinishHandler<T>>,
}

/// Shared handle to a delivery channel. Clones refer to the same channel.
pub struct DeliveryChannel<T> {
    id: ChannelId,
    state: Arc<Mutex<ChannelState<T>>>,
}

impl<T> Clone for DeliveryChannel<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> PartialEq for DeliveryChannel<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for DeliveryChannel<T> {}

impl<T> fmt::Debug for DeliveryChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryChannel")
            .field("id", &self.id)
            .field("finished", &self.state.lock().finished)
            .finish()
    }
}

impl<T: Clone + Send + 'static> DeliveryChannel<T> {
    pub fn new() -> Self {
        Self::from_parts(None)
    }

    /// Create a channel seeded with an initial current value.
    pub fn with_value(value: T) -> Self {
        Self::from_parts(Some(value))
    }

    fn from_parts(value: Option<T>) -> Self {
        Self {
            id: ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)),
            state: Arc::new(Mutex::new(ChannelState {
                value,
                finished: false,
                subscribers: Vec::new(),
                finish_handler: None,
            })),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The last published value, if any.
    pub fn current_value(&self) -> Option<T> {
        self.state.lock().value.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Number of subscribers whose sequence is still being consumed.
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .subscribers
            .iter()
            .filter(|tx| !tx.is_disconnected())
            .count()
    }

    /// Start a new independent sequence of updates.
    ///
    /// The current value, if any, is replayed as the first update.
    ///
    /// # Panics
    /// If the channel has already finished.
    pub fn subscribe(&self) -> Subscription<T> {
        let mut state = self.state.lock();
        assert!(
            !state.finished,
            "subscribe() called on finished delivery channel {}",
            self.id
        );

        let (tx, rx) = flume::unbounded();
        if let Some(value) = &state.value {
            let _ = tx.send(Update::Value(value.clone()));
        }
        state.subscribers.push(tx);

        Subscription { rx }
    }

    /// Replace the current value and deliver it to every subscriber.
    ///
    /// # Panics
    /// If the channel has already finished.
    pub fn publish(&self, value: T) {
        let mut state = self.state.lock();
        assert!(
            !state.finished,
            "publish() called on finished delivery channel {}",
            self.id
        );

        state
            .subscribers
            .retain(|tx| tx.send(Update::Value(value.clone())).is_ok());
        state.value = Some(value);
    }

    /// Deliver a failure to every current subscriber.
    ///
    /// The current value is kept and the channel stays open, so a later
    /// subscriber still observes the pre-failure state.
    ///
    /// # Panics
    /// If the channel has already finished.
    pub fn fail(&self, error: ImageError) {
        let mut state = self.state.lock();
        assert!(
            !state.finished,
            "fail() called on finished delivery channel {}",
            self.id
        );

        state
            .subscribers
            .retain(|tx| tx.send(Update::Failed(error.clone())).is_ok());
    }

    /// Register the handler run once when the channel finishes.
    ///
    /// The handler receives the last value. Registering again replaces a
    /// handler that has not run yet.
    pub fn on_finish<F>(&self, handler: F)
    where
        F: FnOnce(Option<&T>) + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.finished {
            trace!(channel = %self.id, "Finish handler registered after finish, ignored");
            return;
        }
        state.finish_handler = Some(Box::new(handler));
    }

    /// End every subscriber sequence and run the finish handler.
    ///
    /// Idempotent; only the first call has any effect.
    pub fn finish(&self) {
        let (handler, last) = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            state.subscribers.clear();
            (state.finish_handler.take(), state.value.clone())
        };

        trace!(channel = %self.id, "Delivery channel finished");

        // Runs outside the lock so the handler may read this channel.
        if let Some(handler) = handler {
            handler(last.as_ref());
        }
    }
}

impl<T: Clone + Send + 'static> Default for DeliveryChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's ordered view of a delivery channel.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription<T> {
    rx: Receiver<Update<T>>,
}

impl<T> Subscription<T> {
    /// Poll for the next update without blocking.
    pub fn try_next(&self) -> Next<T> {
        match self.rx.try_recv() {
            Ok(update) => Next::Update(update),
            Err(TryRecvError::Empty) => Next::Pending,
            Err(TryRecvError::Disconnected) => Next::Ended,
        }
    }

    /// Wait for the next update; `None` once the channel has finished.
    pub async fn recv_async(&self) -> Option<Update<T>> {
        self.rx.recv_async().await.ok()
    }
}

impl<T> Iterator for Subscription<T> {
    type Item = Update<T>;

    /// Blocks until the next update, ending when the channel finishes.
    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscriber_sees_all_updates_then_end() {
        let channel: DeliveryChannel<&'static str> = DeliveryChannel::new();
        let subscription = channel.subscribe();

        channel.publish("prefetching");
        channel.publish("degraded");
        channel.publish("prefetched");
        channel.finish();

        let seen: Vec<_> = subscription.collect();
        assert_eq!(
            seen,
            vec![
                Update::Value("prefetching"),
                Update::Value("degraded"),
                Update::Value("prefetched"),
            ]
        );
    }

    #[test]
    fn test_subscribe_replays_current_value() {
        let channel = DeliveryChannel::with_value(1u32);
        channel.publish(2);

        let subscription = channel.subscribe();
        channel.publish(3);

        assert_eq!(subscription.try_next(), Next::Update(Update::Value(2)));
        assert_eq!(subscription.try_next(), Next::Update(Update::Value(3)));
        assert_eq!(subscription.try_next(), Next::Pending);
    }

    #[test]
    fn test_each_subscription_is_independent() {
        let channel = DeliveryChannel::new();
        let first = channel.subscribe();
        channel.publish(10u32);
        let second = channel.subscribe();
        channel.publish(11);

        assert_eq!(first.try_next(), Next::Update(Update::Value(10)));
        assert_eq!(first.try_next(), Next::Update(Update::Value(11)));
        assert_eq!(second.try_next(), Next::Update(Update::Value(10)));
        assert_eq!(second.try_next(), Next::Update(Update::Value(11)));
    }

    #[test]
    fn test_finish_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let channel = DeliveryChannel::with_value(7u32);
        {
            let calls = Arc::clone(&calls);
            channel.on_finish(move |last| {
                assert_eq!(last, Some(&7));
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        channel.finish();
        channel.finish();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(channel.is_finished());
        assert_eq!(channel.current_value(), Some(7));
    }

    #[test]
    fn test_finish_ends_pending_subscription() {
        let channel = DeliveryChannel::<u32>::new();
        let subscription = channel.subscribe();
        assert_eq!(subscription.try_next(), Next::Pending);

        channel.finish();
        assert_eq!(subscription.try_next(), Next::Ended);
    }

    #[test]
    #[should_panic(expected = "subscribe() called on finished")]
    fn test_subscribe_after_finish_panics() {
        let channel = DeliveryChannel::<u32>::new();
        channel.finish();
        let _ = channel.subscribe();
    }

    #[test]
    #[should_panic(expected = "publish() called on finished")]
    fn test_publish_after_finish_panics() {
        let channel = DeliveryChannel::<u32>::new();
        channel.finish();
        channel.publish(1);
    }

    #[test]
    fn test_fail_keeps_channel_open() {
        let channel = DeliveryChannel::with_value(5u32);
        let early = channel.subscribe();
        channel.fail(ImageError::Cancelled);

        assert_eq!(early.try_next(), Next::Update(Update::Value(5)));
        assert_eq!(
            early.try_next(),
            Next::Update(Update::Failed(ImageError::Cancelled))
        );

        assert!(!channel.is_finished());
        let late = channel.subscribe();
        assert_eq!(late.try_next(), Next::Update(Update::Value(5)));
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let channel = DeliveryChannel::<u32>::new();
        let kept = channel.subscribe();
        let dropped = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);

        drop(dropped);
        channel.publish(1);
        assert_eq!(channel.subscriber_count(), 1);
        assert_eq!(kept.try_next(), Next::Update(Update::Value(1)));
    }

    #[test]
    fn test_clones_share_identity() {
        let channel = DeliveryChannel::<u32>::new();
        let clone = channel.clone();
        assert_eq!(channel, clone);
        assert_ne!(channel, DeliveryChannel::new());

        clone.publish(3);
        assert_eq!(channel.current_value(), Some(3));
    }

    #[tokio::test]
    async fn test_async_consumer_resumes_on_publish() {
        let channel = DeliveryChannel::<u32>::new();
        let subscription = channel.subscribe();

        let producer = channel.clone();
        let handle = tokio::spawn(async move {
            producer.publish(1);
            producer.publish(2);
            producer.finish();
        });

        let mut seen = Vec::new();
        while let Some(update) = subscription.recv_async().await {
            seen.push(update);
        }
        handle.await.unwrap();

        assert_eq!(seen, vec![Update::Value(1), Update::Value(2)]);
    }
}
