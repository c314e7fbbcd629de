//! Poll scheduling for embedding jobs

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use kgraph_store::EmbeddingJobStatus;
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Weekday with the UTC hour in `[business_hours_start, business_hours_end)`
pub fn is_business_hours(config: &EmbeddingConfig, now: DateTime<Utc>) -> bool {
    let weekday = !matches!(now.weekday(), Weekday::Sat | Weekday::Sun);
    let hour = now.hour();
    weekday && hour >= config.business_hours_start && hour < config.business_hours_end
}

/// Delay before the next status poll; `None` for terminal statuses
pub fn poll_interval(
    config: &EmbeddingConfig,
    status: EmbeddingJobStatus,
    now: DateTime<Utc>,
) -> Option<Duration> {
    match status {
        EmbeddingJobStatus::Validating => Some(Duration::from_secs(config.validating_delay_secs)),
        EmbeddingJobStatus::InProgress | EmbeddingJobStatus::Finalizing => {
            let secs = if is_business_hours(config, now) {
                config.business_hours_interval_secs
            } else {
                config.off_hours_interval_secs
            };
            Some(Duration::from_secs(secs))
        }
        _ => None,
    }
}

/// Backoff after the `attempt`-th consecutive poll error (1-based):
/// `retry_base_delay * 2^(attempt - 1)`
pub fn retry_delay(config: &EmbeddingConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    Duration::from_secs(config.retry_base_delay_secs.saturating_mul(1u64 << exponent))
}
