//! Reactive query cache for storefront data: keyed asynchronous reads with
//! staleness tracking, request de-duplication, retry, garbage collection and
//! synchronous change notification.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;

#[doc(hidden)]
pub use serde_json as __serde_json;
