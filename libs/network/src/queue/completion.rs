//! Reusable single-waiter completion
//!
//! A [`CompletionSource`] is issued, completed and awaited once per round,
//! then returns to idle for the next round without reallocating. Each round
//! is tagged with a version so a completion aimed at an earlier round can
//! never leak into a later one.

use super::QueueError;
use parking_lot::Mutex;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

enum Slot<T> {
    Idle,
    Pending(Option<Waker>),
    Completed(Result<T, QueueError>),
}

struct Inner<T> {
    version: u64,
    slot: Slot<T>,
}

/// `Idle -> Pending -> Completed -> Idle`, guarded by one mutex
pub struct CompletionSource<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> CompletionSource<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                version: 0,
                slot: Slot::Idle,
            }),
        }
    }

    /// Start a round and return its version
    ///
    /// # Panics
    /// If the previous round has not been consumed.
    pub fn issue(&self) -> u64 {
        let mut inner = self.inner.lock();
        assert!(
            matches!(inner.slot, Slot::Idle),
            "completion source issued while a round is outstanding"
        );
        inner.slot = Slot::Pending(None);
        inner.version
    }

    /// Complete round `version` if it is still pending
    ///
    /// The loser of a race gets its result handed back in `Err`.
    pub fn try_complete(
        &self,
        version: u64,
        result: Result<T, QueueError>,
    ) -> Result<(), Result<T, QueueError>> {
        let waker = {
            let mut inner = self.inner.lock();
            if inner.version != version || !matches!(inner.slot, Slot::Pending(_)) {
                return Err(result);
            }
            match mem::replace(&mut inner.slot, Slot::Completed(result)) {
                Slot::Pending(waker) => waker,
                _ => None,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// # Panics
    /// If round `version` was already completed.
    pub fn complete(&self, version: u64, result: Result<T, QueueError>) {
        if self.try_complete(version, result).is_err() {
            panic!("completion source round {} completed twice", version);
        }
    }

    /// Future resolving with the result of round `version`
    pub fn wait(&self, version: u64) -> Completion<'_, T> {
        Completion {
            source: self,
            version,
        }
    }

    /// End round `version` without awaiting it, returning any result it got
    pub fn reclaim(&self, version: u64) -> Option<Result<T, QueueError>> {
        let mut inner = self.inner.lock();
        if inner.version != version {
            return None;
        }
        inner.version = inner.version.wrapping_add(1);
        match mem::replace(&mut inner.slot, Slot::Idle) {
            Slot::Completed(result) => Some(result),
            _ => None,
        }
    }

    /// Version the next issued round will carry
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.inner.lock().slot, Slot::Idle)
    }
}

impl<T> Default for CompletionSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaits one round of a [`CompletionSource`]
#[must_use = "futures do nothing unless polled"]
pub struct Completion<'a, T> {
    source: &'a CompletionSource<T>,
    version: u64,
}

impl<T> Future for Completion<'_, T> {
    type Output = Result<T, QueueError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.source.inner.lock();
        assert_eq!(
            inner.version, self.version,
            "completion observed with a stale version"
        );
        match mem::replace(&mut inner.slot, Slot::Idle) {
            Slot::Completed(result) => {
                inner.version = inner.version.wrapping_add(1);
                Poll::Ready(result)
            }
            Slot::Pending(_) => {
                inner.slot = Slot::Pending(Some(cx.waker().clone()));
                Poll::Pending
            }
            Slot::Idle => panic!("completion awaited without being issued"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_round_resets_to_idle() {
        let source = CompletionSource::new();
        for round in 0..3u64 {
            let version = source.issue();
            assert_eq!(version, round);
            source.complete(version, Ok(round * 10));
            assert_eq!(source.wait(version).await, Ok(round * 10));
            assert!(source.is_idle());
        }
    }

    #[tokio::test]
    async fn test_wait_before_complete() {
        let source = Arc::new(CompletionSource::new());
        let version = source.issue();

        let completer = source.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            completer.complete(version, Ok("late"));
        });

        assert_eq!(source.wait(version).await, Ok("late"));
        handle.await.unwrap();
    }

    #[test]
    fn test_loser_gets_result_back() {
        let source = CompletionSource::new();
        let version = source.issue();
        assert!(source.try_complete(version, Ok(1)).is_ok());
        assert_eq!(source.try_complete(version, Ok(2)), Err(Ok(2)));
        assert_eq!(source.reclaim(version), Some(Ok(1)));

        // Round is over; late completions for it are refused
        assert_eq!(source.try_complete(version, Err(QueueError::Canceled)), Err(Err(QueueError::Canceled)));
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn test_double_complete_panics() {
        let source = CompletionSource::new();
        let version = source.issue();
        source.complete(version, Ok(()));
        source.complete(version, Ok(()));
    }

    #[tokio::test]
    #[should_panic(expected = "stale version")]
    async fn test_stale_version_panics() {
        let source = CompletionSource::<u8>::new();
        let version = source.issue();
        source.complete(version, Ok(1));
        let _ = source.wait(version).await;

        source.issue();
        let _ = source.wait(version).await;
    }

    #[test]
    #[should_panic(expected = "round is outstanding")]
    fn test_issue_twice_panics() {
        let source = CompletionSource::<u8>::new();
        source.issue();
        source.issue();
    }
}
