//! The start/stop/close-aware queue behind dispatch.
//!
//! Both the consumer's unconsumed queue and the session executor's work
//! queue share these semantics: a stopped channel holds its contents and
//! makes receivers wait, a closed channel wakes every waiter with "no
//! item", and items can be pushed back to the front to preserve delivery
//! order across a rollback. An optional gate deadline keeps items invisible
//! until it passes, which is how delayed redelivery avoids holding any
//! thread.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

struct ChannelState<T> {
    queue: VecDeque<T>,
    running: bool,
    closed: bool,
    gate_until: Option<Instant>,
}

/// A bounded-wait dispatch queue with start/stop/close lifecycle.
pub struct DispatchChannel<T> {
    state: Mutex<ChannelState<T>>,
    notify: Notify,
}

impl<T> Default for DispatchChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DispatchChannel<T> {
    /// A stopped, open, empty channel.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState {
                queue: VecDeque::new(),
                running: false,
                closed: false,
                gate_until: None,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState<T>> {
        // Mutex poisoning cannot happen: no panic path runs under the lock.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Appends an item.
    pub fn enqueue(&self, item: T) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Pushes an item back to the front (rollback redispatch).
    pub fn enqueue_first(&self, item: T) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.queue.push_front(item);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Lets receivers make progress.
    pub fn start(&self) {
        self.lock().running = true;
        self.notify.notify_waiters();
    }

    /// Parks receivers without losing queued items.
    pub fn stop(&self) {
        self.lock().running = false;
        self.notify.notify_waiters();
    }

    /// Wakes every blocked receiver with "no item"; permanent.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.running = false;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Drains and returns everything queued.
    pub fn clear(&self) -> Vec<T> {
        let mut state = self.lock();
        let drained = state.queue.drain(..).collect();
        drop(state);
        self.notify.notify_waiters();
        drained
    }

    /// Holds queued items invisible until the deadline passes.
    pub fn gate_until(&self, deadline: Instant) {
        self.lock().gate_until = Some(deadline);
        self.notify.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Pops immediately if running, ungated, and non-empty.
    pub fn dequeue_no_wait(&self) -> Option<T> {
        let mut state = self.lock();
        if !state.running || state.closed {
            return None;
        }
        if let Some(gate) = state.gate_until {
            if Instant::now() < gate {
                return None;
            }
            state.gate_until = None;
        }
        state.queue.pop_front()
    }

    /// Waits for an item until the optional deadline.
    ///
    /// Returns `None` when the channel closes or the deadline passes; a
    /// stopped channel keeps the receiver parked rather than returning.
    pub async fn dequeue(&self, deadline: Option<Instant>) -> Option<T> {
        loop {
            let notified = self.notify.notified();

            let mut wake_at = deadline;
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if state.running {
                    match state.gate_until {
                        Some(gate) if Instant::now() < gate => {
                            wake_at = Some(wake_at.map_or(gate, |d| d.min(gate)));
                        }
                        other => {
                            if other.is_some() {
                                state.gate_until = None;
                            }
                            if let Some(item) = state.queue.pop_front() {
                                return Some(item);
                            }
                        }
                    }
                }
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return None;
                }
            }

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {
                            if deadline.is_some_and(|d| Instant::now() >= d) {
                                return None;
                            }
                        }
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Convenience wrapper: a millisecond timeout from now.
    pub async fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        self.dequeue(Some(Instant::now() + timeout)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn items_flow_in_fifo_order_when_running() {
        let channel = DispatchChannel::new();
        channel.start();
        channel.enqueue(1);
        channel.enqueue(2);
        channel.enqueue_first(0);
        assert_eq!(channel.dequeue_no_wait(), Some(0));
        assert_eq!(channel.dequeue_no_wait(), Some(1));
        assert_eq!(channel.dequeue_no_wait(), Some(2));
        assert_eq!(channel.dequeue_no_wait(), None);
    }

    #[tokio::test]
    async fn stopped_channel_parks_receivers_until_start() {
        let channel = std::sync::Arc::new(DispatchChannel::new());
        channel.enqueue(7);

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.dequeue(None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        channel.start();
        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn close_wakes_blocked_receivers_with_nothing() {
        let channel = std::sync::Arc::new(DispatchChannel::new());
        channel.start();
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.dequeue(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.close();
        assert_eq!(waiter.await.unwrap(), None);
        channel.enqueue(1);
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn timeout_expires_with_nothing() {
        let channel: DispatchChannel<u8> = DispatchChannel::new();
        channel.start();
        let start = Instant::now();
        assert_eq!(channel.dequeue_timeout(Duration::from_millis(50)).await, None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_hides_items_until_the_deadline() {
        let channel = DispatchChannel::new();
        channel.start();
        channel.enqueue(9);
        channel.gate_until(Instant::now() + Duration::from_millis(500));

        assert_eq!(channel.dequeue_no_wait(), None);
        let item = channel.dequeue(None).await;
        assert_eq!(item, Some(9));
        // Virtual time: the await above only completes once the gate passed.
    }
}
