//! Utility modules

pub mod db_retry;
pub mod retry;
pub mod text;

pub use db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
pub use retry::{with_retry, RetryError, RetryPolicy};
