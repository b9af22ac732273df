//! Single-consumer async queues
//!
//! [`AwaitableQueue`] feeds each stage of a channel's pipeline. Its consumer
//! suspends on a reusable [`CompletionSource`], so waiting allocates nothing
//! per await.

mod awaitable;
mod completion;

pub use awaitable::AwaitableQueue;
pub use completion::{Completion, CompletionSource};

use thiserror::Error;

/// Why a wait ended without an item
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("wait canceled")]
    Canceled,

    #[error("queue closed")]
    Closed,
}
