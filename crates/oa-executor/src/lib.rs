//! Payload execution.
//!
//! The protocol responder calls an [`Executor`] on `DREQ` arrival and
//! treats any `Err` as a provider-side cancellation (`DCAN`).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("payload execution failed: {0}")]
    Failed(String),
}

/// Runs (or simulates) a payload and returns result bytes.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, data: Bytes) -> Result<Bytes, ExecutorError>;
}

/// Simulates execution by sleeping a uniformly sampled duration between
/// configured bounds, then returning a fixed result.
pub struct SimulatedExecutor {
    min: Duration,
    max: Duration,
}

impl SimulatedExecutor {
    /// `max < min` falls back to `[0, 1]` seconds.
    pub fn new(min: Duration, max: Duration) -> Self {
        if max < min {
            return Self { min: Duration::ZERO, max: Duration::from_secs(1) };
        }
        Self { min, max }
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self { min: Duration::ZERO, max: Duration::from_secs(1) }
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn execute(&self, data: Bytes) -> Result<Bytes, ExecutorError> {
        let delay = oa_clock::uniform_duration(self.min, self.max);
        debug!(?delay, input_len = data.len(), "simulating execution");
        tokio::time::sleep(delay).await;
        Ok(Bytes::from_static(b"result"))
    }
}

/// Echoes the input back unchanged, useful for deterministic tests of the
/// surrounding protocol machinery without timing noise.
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, data: Bytes) -> Result<Bytes, ExecutorError> {
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_executor_returns_fixed_result() {
        let exec = SimulatedExecutor::new(Duration::ZERO, Duration::from_millis(5));
        let out = exec.execute(Bytes::from_static(b"payload")).await.unwrap();
        assert_eq!(out, Bytes::from_static(b"result"));
    }

    #[tokio::test]
    async fn invalid_range_falls_back_to_0_1s() {
        let exec = SimulatedExecutor::new(Duration::from_secs(5), Duration::from_secs(1));
        let start = std::time::Instant::now();
        exec.execute(Bytes::new()).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn echo_executor_roundtrips() {
        let exec = EchoExecutor;
        let out = exec.execute(Bytes::from_static(b"X")).await.unwrap();
        assert_eq!(out, Bytes::from_static(b"X"));
    }
}
