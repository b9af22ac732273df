use super::{CompletionSource, QueueError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::mem;
use tokio_util::sync::CancellationToken;

struct State<T> {
    items: VecDeque<T>,
    /// Version of the outstanding wait, if the consumer is suspended
    waiting: Option<u64>,
    closed: bool,
}

/// Multi-producer, single-consumer FIFO with an awaitable dequeue
///
/// Lock order is always `state` then the completion source.
pub struct AwaitableQueue<T> {
    state: Mutex<State<T>>,
    completion: CompletionSource<T>,
}

impl<T> AwaitableQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                waiting: None,
                closed: false,
            }),
            completion: CompletionSource::new(),
        }
    }

    /// Hand `item` to the waiting consumer or append it
    ///
    /// A closed queue returns the item to the caller.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(item);
        }

        if let Some(version) = state.waiting.take() {
            match self.completion.try_complete(version, Ok(item)) {
                Ok(()) => return Ok(()),
                Err(Ok(item)) => state.items.push_back(item),
                Err(Err(_)) => {}
            }
        } else {
            state.items.push_back(item);
        }
        Ok(())
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Next item, suspending until one is enqueued
    ///
    /// Resolves synchronously when an item is already queued. A canceled wait
    /// never consumes an item: one that raced in is put back at the front.
    ///
    /// # Panics
    /// If another dequeue is already suspended on this queue.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<T, QueueError> {
        let version = {
            let mut state = self.state.lock();
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            if cancel.is_cancelled() {
                return Err(QueueError::Canceled);
            }
            assert!(
                state.waiting.is_none(),
                "AwaitableQueue supports a single waiting consumer"
            );
            let version = self.completion.issue();
            state.waiting = Some(version);
            version
        };

        let guard = WaitGuard {
            queue: self,
            version,
            armed: true,
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.completion.wait(version) => Some(result),
        };

        match outcome {
            Some(result) => {
                guard.disarm();
                result
            }
            None => {
                drop(guard);
                Err(QueueError::Canceled)
            }
        }
    }

    /// Close the queue, passing every remaining item to `on_each_remaining`
    ///
    /// A suspended consumer wakes with [`QueueError::Closed`]. Closing twice
    /// is a no-op.
    pub fn close<F>(&self, mut on_each_remaining: F)
    where
        F: FnMut(T),
    {
        let remaining = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(version) = state.waiting.take() {
                let _ = self.completion.try_complete(version, Err(QueueError::Closed));
            }
            mem::take(&mut state.items)
        };

        for item in remaining {
            on_each_remaining(item);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn abandon_wait(&self, version: u64) {
        let mut state = self.state.lock();
        if state.waiting == Some(version) {
            state.waiting = None;
        }
        if let Some(Ok(item)) = self.completion.reclaim(version) {
            if !state.closed {
                state.items.push_front(item);
            }
        }
    }
}

impl<T> Default for AwaitableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Ends an outstanding wait if the dequeue future stops early
struct WaitGuard<'a, T> {
    queue: &'a AwaitableQueue<T>,
    version: u64,
    armed: bool,
}

impl<T> WaitGuard<'_, T> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T> Drop for WaitGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.abandon_wait(self.version);
        }
    }
}
