//! Engine-wide defaults loaded from the environment.

use std::time::Duration;

use crate::error::{Result, ScanError};

const DEFAULT_BATCH_SIZE_BYTES: usize = 1024 * 1024;
const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RECOVERY_ATTEMPTS: usize = 5;
const DEFAULT_RETRY_DELAY_MS: u64 = 60;
const DEFAULT_SNAPSHOT_WAIT_ATTEMPTS: usize = 10;

/// Defaults applied to every scan opened through one client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanEngineConfig {
    /// Target size of one backend batch.
    pub batch_size_bytes: usize,
    /// Deadline for each individual backend RPC.
    pub rpc_timeout: Duration,
    /// Consecutive recovery attempts before a fault-tolerant scan gives up.
    pub recovery_attempts: usize,
    /// Base delay between attempts; doubles per attempt up to 32x.
    pub retry_delay: Duration,
    /// Waits for a snapshot to become safe before `Consistency` is raised.
    pub snapshot_wait_attempts: usize,
}

impl Default for ScanEngineConfig {
    fn default() -> Self {
        Self {
            batch_size_bytes: DEFAULT_BATCH_SIZE_BYTES,
            rpc_timeout: Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS),
            recovery_attempts: DEFAULT_RECOVERY_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            snapshot_wait_attempts: DEFAULT_SNAPSHOT_WAIT_ATTEMPTS,
        }
    }
}

impl ScanEngineConfig {
    /// Loads configuration from `HOLO_SCAN_*` variables with defaults.
    pub fn from_env() -> Result<Self> {
        let batch_size_bytes = parse_usize(
            std::env::var("HOLO_SCAN_BATCH_SIZE_BYTES").ok(),
            DEFAULT_BATCH_SIZE_BYTES,
        )?
        .max(1);
        let rpc_timeout_ms = parse_u64(
            std::env::var("HOLO_SCAN_RPC_TIMEOUT_MS").ok(),
            DEFAULT_RPC_TIMEOUT_MS,
        )?
        .max(1);
        let recovery_attempts = parse_usize(
            std::env::var("HOLO_SCAN_RECOVERY_ATTEMPTS").ok(),
            DEFAULT_RECOVERY_ATTEMPTS,
        )?;
        let retry_delay_ms = parse_u64(
            std::env::var("HOLO_SCAN_RETRY_DELAY_MS").ok(),
            DEFAULT_RETRY_DELAY_MS,
        )?;
        let snapshot_wait_attempts = parse_usize(
            std::env::var("HOLO_SCAN_SNAPSHOT_WAIT_ATTEMPTS").ok(),
            DEFAULT_SNAPSHOT_WAIT_ATTEMPTS,
        )?
        .max(1);

        Ok(Self {
            batch_size_bytes,
            rpc_timeout: Duration::from_millis(rpc_timeout_ms),
            recovery_attempts,
            retry_delay: Duration::from_millis(retry_delay_ms),
            snapshot_wait_attempts,
        })
    }

    /// Exponential backoff for retry `attempt`, capped at 32x the base delay.
    pub fn retry_backoff(&self, attempt: usize) -> Duration {
        let exp = 1u32 << attempt.min(5);
        self.retry_delay.saturating_mul(exp)
    }
}

fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw.trim().parse::<usize>().map_err(|_| {
            ScanError::invalid_argument(format!("invalid usize value: {raw}"))
        }),
        None => Ok(default_value),
    }
}

fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ScanError::invalid_argument(format!("invalid u64 value: {raw}"))),
        None => Ok(default_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_helpers_fall_back_and_reject_garbage() {
        assert_eq!(parse_usize(None, 7).expect("default"), 7);
        assert_eq!(parse_u64(Some(" 42 ".to_string()), 0).expect("value"), 42);
        assert!(parse_usize(Some("many".to_string()), 1).is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ScanEngineConfig {
            retry_delay: Duration::from_millis(10),
            ..ScanEngineConfig::default()
        };
        assert_eq!(config.retry_backoff(0), Duration::from_millis(10));
        assert_eq!(config.retry_backoff(2), Duration::from_millis(40));
        assert_eq!(config.retry_backoff(9), Duration::from_millis(320));
    }
}
