//! Batch embedding
//!
//! - `provider`: external batch embedding API port
//! - `schedule`: load-aware poll intervals and retry backoff
//! - `monitor`: drives submitted jobs to completion, with synchronous fallback

pub mod monitor;
pub mod provider;
pub mod schedule;

pub use monitor::{CheckOutcome, EmbeddingMonitor, FallbackReport};
pub use provider::{
    EmbeddingError, EmbeddingFailure, EmbeddingOutput, EmbeddingProvider, EmbeddingRequest,
    JobStatusReport,
};
pub use schedule::{is_business_hours, poll_interval, retry_delay};
