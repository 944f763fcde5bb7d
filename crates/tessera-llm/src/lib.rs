pub mod retry;

pub use retry::{calculate_backoff, is_retryable, RetryingClient};
