use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use super::SyncError;
use super::protocol::{ClientMessage, ServerMessage};
use crate::config::SyncConfig;

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Abstraction over the channel between a replica and its hub.
///
/// One call delivers one message and returns whatever the hub sent back to
/// this replica in response.
pub trait SyncTransport {
    type Error: Display;

    /// Deliver `message` and collect the replies.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if delivery failed. Callers treat
    /// every transport error as transient.
    fn exchange(&mut self, message: &ClientMessage) -> Result<Vec<ServerMessage>, Self::Error>;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared flag for aborting a sync session or a migration run.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff: `initial`, doubled per attempt, capped at `max`,
/// giving up after `max_attempts` tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl Backoff {
    #[must_use]
    pub const fn from_config(config: &SyncConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.retry_initial_ms),
            max: Duration::from_millis(config.retry_max_ms),
            max_attempts: config.retry_max_attempts,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1_u32 << shift)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Outcome of one [`sync_with_retry`] exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Total time spent waiting between attempts.
    pub waited: Duration,
}

impl SyncReport {
    /// True if the first attempt succeeded.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.attempts <= 1
    }
}

/// Deliver `message`, retrying transport failures with `backoff`.
///
/// `sleep` performs the wait between attempts so callers (and tests) decide
/// how time passes. Cancellation is checked before every attempt.
///
/// # Errors
///
/// - [`SyncError::Cancelled`] if `cancel` fires.
/// - [`SyncError::Transport`] once `backoff.max_attempts` attempts failed.
pub fn sync_with_retry<T: SyncTransport>(
    transport: &mut T,
    message: &ClientMessage,
    backoff: &Backoff,
    cancel: &CancelFlag,
    sleep: &mut dyn FnMut(Duration),
) -> Result<(Vec<ServerMessage>, SyncReport), SyncError> {
    let mut report = SyncReport::default();
    let max_attempts = backoff.max_attempts.max(1);
    loop {
        if cancel.is_cancelled() {
            debug!(attempts = report.attempts, "sync cancelled");
            return Err(SyncError::Cancelled);
        }
        report.attempts += 1;
        match transport.exchange(message) {
            Ok(replies) => {
                debug!(
                    kind = message.kind(),
                    attempts = report.attempts,
                    replies = replies.len(),
                    "sync exchange complete"
                );
                return Ok((replies, report));
            }
            Err(err) if report.attempts >= max_attempts => {
                warn!(attempts = report.attempts, error = %err, "sync giving up");
                return Err(SyncError::Transport {
                    attempts: report.attempts,
                    last: err.to_string(),
                });
            }
            Err(err) => {
                let delay = backoff.delay(report.attempts);
                debug!(attempt = report.attempts, error = %err, delay_ms = delay.as_millis(), "sync retry");
                sleep(delay);
                report.waited += delay;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ReplicaId;

    struct Flaky {
        failures_left: u32,
        calls: u32,
    }

    impl SyncTransport for Flaky {
        type Error = String;

        fn exchange(&mut self, _: &ClientMessage) -> Result<Vec<ServerMessage>, String> {
            self.calls += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err("connection reset".to_string());
            }
            Ok(vec![ServerMessage::HeartbeatResponse { server_order: 0 }])
        }
    }

    fn heartbeat() -> ClientMessage {
        ClientMessage::Heartbeat {
            replica_id: ReplicaId::new("a").expect("id"),
            acked: None,
        }
    }

    fn backoff(max_attempts: u32) -> Backoff {
        Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
            max_attempts,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let b = backoff(10);
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(350));
        assert_eq!(b.delay(60), Duration::from_millis(350));
    }

    #[test]
    fn transient_failures_are_retried() {
        let mut transport = Flaky {
            failures_left: 2,
            calls: 0,
        };
        let mut slept = Vec::new();
        let (replies, report) = sync_with_retry(
            &mut transport,
            &heartbeat(),
            &backoff(5),
            &CancelFlag::new(),
            &mut |d| slept.push(d),
        )
        .expect("eventually succeeds");
        assert_eq!(replies.len(), 1);
        assert_eq!(report.attempts, 3);
        assert!(!report.is_clean());
        assert_eq!(slept, vec![Duration::from_millis(100), Duration::from_millis(200)]);
        assert_eq!(report.waited, Duration::from_millis(300));
    }

    #[test]
    fn attempts_are_bounded() {
        let mut transport = Flaky {
            failures_left: u32::MAX,
            calls: 0,
        };
        let err = sync_with_retry(
            &mut transport,
            &heartbeat(),
            &backoff(3),
            &CancelFlag::new(),
            &mut |_| {},
        )
        .expect_err("gives up");
        assert!(matches!(err, SyncError::Transport { attempts: 3, .. }));
        assert_eq!(transport.calls, 3);
    }

    #[test]
    fn cancel_stops_before_next_attempt() {
        let mut transport = Flaky {
            failures_left: u32::MAX,
            calls: 0,
        };
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let err = sync_with_retry(&mut transport, &heartbeat(), &backoff(10), &cancel, &mut |_| {
            trigger.cancel();
        })
        .expect_err("cancelled");
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(transport.calls, 1);
    }
}
