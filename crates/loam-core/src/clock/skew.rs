/// Warning emitted when a remote timestamp's wall time is far from ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSkewWarning {
    /// Wall time carried by the remote timestamp (ms).
    pub remote_ms: u64,
    /// Local physical wall time (ms).
    pub local_ms: u64,
    /// Detected skew in milliseconds (positive = remote is in the future).
    pub skew_ms: i64,
    /// The threshold that was exceeded.
    pub threshold_ms: u64,
    /// Human-readable warning message.
    pub message: String,
}

/// Default skew threshold in seconds (5 minutes).
pub const DEFAULT_SKEW_THRESHOLD_SECS: u64 = 300;

/// Check for clock skew between a remote wall time and the local wall time.
/// Returns `Some(warning)` if the absolute difference exceeds `threshold_ms`.
///
/// Timestamps are never rejected because of skew: ordering comes from the
/// counter/update rule, wall time is only a tie-break and debugging aid.
#[must_use]
pub fn check_clock_skew(remote_ms: u64, local_ms: u64, threshold_ms: u64) -> Option<ClockSkewWarning> {
    let skew_ms = i64::try_from(i128::from(remote_ms) - i128::from(local_ms)).unwrap_or(i64::MAX);
    let abs_skew = skew_ms.unsigned_abs();

    if abs_skew > threshold_ms {
        let direction = if skew_ms > 0 { "future" } else { "past" };
        let message = format!(
            "Clock skew detected: remote timestamp is {abs_skew} ms in the {direction}, threshold is {threshold_ms} ms"
        );

        Some(ClockSkewWarning {
            remote_ms,
            local_ms,
            skew_ms,
            threshold_ms,
            message,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_skew_within_threshold() {
        assert!(check_clock_skew(1_050, 1_000, 100).is_none());
    }

    #[test]
    fn future_skew() {
        let warning = check_clock_skew(1_200, 1_000, 100).expect("skew");
        assert_eq!(warning.skew_ms, 200);
        assert!(warning.message.contains("future"));
    }

    #[test]
    fn past_skew() {
        let warning = check_clock_skew(800, 1_000, 100).expect("skew");
        assert_eq!(warning.skew_ms, -200);
        assert!(warning.message.contains("past"));
    }
}
