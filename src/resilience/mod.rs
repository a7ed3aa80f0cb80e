//! Resilience Module - Retries with backoff for external connections

mod retry;

pub use retry::{with_retry_async, RetryConfig};
