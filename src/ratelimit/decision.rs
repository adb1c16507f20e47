//! Admission decisions and the metadata reported with them.

use serde::Serialize;

/// Rate limit metadata for one key at the time of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    /// Configured maximum requests per window
    pub limit: u64,
    /// Admissions left before the next denial
    pub remaining: u64,
    /// Epoch milliseconds by which the key's quota is expected to be restored
    pub reset_time_ms: u64,
    /// Milliseconds until a blocked key is evaluated normally again
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl RateLimitInfo {
    /// Reset time in whole epoch seconds, rounded up.
    pub fn reset_time_secs(&self) -> u64 {
        self.reset_time_ms.div_ceil(1000)
    }

    /// Retry-after in whole seconds, rounded up; 0 when the key is not blocked.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms.map_or(0, |ms| ms.div_ceil(1000))
    }
}

/// The outcome of evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Metadata to report to the caller
    pub info: RateLimitInfo,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_round_up() {
        let info = RateLimitInfo {
            limit: 10,
            remaining: 0,
            reset_time_ms: 1_700_000_000_001,
            retry_after_ms: Some(4_999),
        };

        assert_eq!(info.reset_time_secs(), 1_700_000_001);
        assert_eq!(info.retry_after_secs(), 5);
    }

    #[test]
    fn test_retry_after_defaults_to_zero() {
        let info = RateLimitInfo {
            limit: 10,
            remaining: 3,
            reset_time_ms: 2_000,
            retry_after_ms: None,
        };

        assert_eq!(info.retry_after_secs(), 0);
        assert_eq!(info.reset_time_secs(), 2);
    }

    #[test]
    fn test_serialization_omits_absent_retry() {
        let decision = Decision {
            allowed: true,
            info: RateLimitInfo {
                limit: 3,
                remaining: 2,
                reset_time_ms: 1_000,
                retry_after_ms: None,
            },
        };

        let json = serde_json::to_value(decision).unwrap();
        assert_eq!(json["allowed"], true);
        assert_eq!(json["info"]["remaining"], 2);
        assert!(json["info"].get("retry_after_ms").is_none());
    }
}
