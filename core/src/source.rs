//! Upstream read discipline: bounded retry with backoff and a deadline.
//!
//! Warehouse reads in production can stall; no engine operation may
//! block indefinitely. Every source read goes through `with_retry`,
//! which retries transient database errors up to a bounded count and
//! gives up with UpstreamTimeout once the deadline or attempt budget is
//! exhausted. Domain errors (DataGap, InvalidTransition, ...) are never
//! retried.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use std::time::{Duration, Instant};

pub fn with_retry<T, F>(source: &str, config: &EngineConfig, mut read: F) -> EngineResult<T>
where
    F: FnMut() -> EngineResult<T>,
{
    let deadline = Instant::now() + Duration::from_millis(config.source_deadline_ms);
    let attempts = config.source_retry_attempts.max(1);
    let mut last_detail = String::new();

    for attempt in 1..=attempts {
        match read() {
            Ok(value) => return Ok(value),
            // Only database-layer failures are transient.
            Err(EngineError::Database(e)) => {
                last_detail = e.to_string();
                log::warn!("source '{source}' read failed (attempt {attempt}/{attempts}): {e}");
            }
            Err(other) => return Err(other),
        }

        if Instant::now() >= deadline {
            return Err(EngineError::UpstreamTimeout {
                src: source.to_string(),
                attempts: attempt,
                detail: format!("deadline exceeded: {last_detail}"),
            });
        }
        std::thread::sleep(Duration::from_millis(
            config.source_retry_backoff_ms * attempt as u64,
        ));
    }

    Err(EngineError::UpstreamTimeout {
        src: source.to_string(),
        attempts,
        detail: last_detail,
    })
}
