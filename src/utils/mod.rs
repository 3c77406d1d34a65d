//! Shared utility functions for scribe_forge.

pub mod retry;

pub use retry::{is_retryable_message, retry_with_backoff, RetryPolicy};
