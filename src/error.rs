use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConformanceError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{operation} failed after {elapsed:.2?}: {reason}")]
    Setup {
        operation: String,
        elapsed: Duration,
        reason: String,
    },

    #[error("{0}")]
    Assertion(String),

    #[error("Cleanup error: {0}")]
    Cleanup(String),

    #[error("MQTT client error: {0}")]
    MqttClient(#[from] rumqttc::ClientError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large for a single-byte remaining length: {0} bytes")]
    FrameTooLarge(usize),
}

impl ConformanceError {
    pub fn setup(operation: impl Into<String>, started: Instant, reason: impl ToString) -> Self {
        ConformanceError::Setup {
            operation: operation.into(),
            elapsed: started.elapsed(),
            reason: reason.to_string(),
        }
    }

    pub fn timed_out(operation: impl Into<String>, budget: Duration) -> Self {
        ConformanceError::Setup {
            operation: operation.into(),
            elapsed: budget,
            reason: "timed out".to_string(),
        }
    }

    pub fn mismatch(
        what: &str,
        expected: impl std::fmt::Display,
        observed: impl std::fmt::Display,
    ) -> Self {
        ConformanceError::Assertion(format!("{what}: expected {expected}, observed {observed}"))
    }
}

pub type Result<T> = std::result::Result<T, ConformanceError>;

/// Logs and drops a best-effort cleanup failure.
pub fn swallow(result: Result<()>, what: &str) {
    if let Err(e) = result {
        tracing::warn!(what, error = %e, "cleanup failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_names_expected_and_observed() {
        let err = ConformanceError::mismatch("received QoS", 2, 0);
        assert_eq!(err.to_string(), "received QoS: expected 2, observed 0");
    }

    #[test]
    fn test_timed_out_reports_budget() {
        let err = ConformanceError::timed_out("subscribe", Duration::from_secs(5));
        assert_eq!(err.to_string(), "subscribe failed after 5.00s: timed out");
    }
}
