use super::{ChangeEvent, SubscriberQueue};
use futures_util::Stream;
use futures_util::stream;
use std::sync::Arc;

/// Receiving end of a change subscription.
///
/// Dropping the subscription (or calling [`unsubscribe`](Self::unsubscribe))
/// stops delivery to it; other subscriptions are unaffected.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub(crate) fn new(queue: Arc<SubscriberQueue>) -> Self {
        Self { queue }
    }

    /// Wait for the next event. Returns `None` once the subscription is
    /// closed and its buffer is drained.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            {
                let mut state = self.queue.state.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            // notify_one stores a permit, so a publish between the check and
            // this await is not lost
            self.queue.wake.notified().await;
        }
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.queue.state.lock().events.pop_front()
    }

    /// Events dropped on overflow since the last call.
    pub fn missed(&self) -> u64 {
        std::mem::take(&mut self.queue.state.lock().missed)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.state.lock().closed
    }

    pub fn id(&self) -> u64 {
        self.queue.id
    }

    /// Cancel the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Consume the subscription as a lazily produced stream of events.
    pub fn into_stream(self) -> impl Stream<Item = ChangeEvent> + Send {
        stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
    }
}
