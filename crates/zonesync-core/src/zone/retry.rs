//! Retry policy: how long to honour server delay hints, and how often.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::ZoneId;
use crate::error::ZoneError;

/// Retry policy for transient remote errors.
///
/// The default retries for as long as the server keeps asking for it, waiting
/// exactly as long as it says.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries per call before giving up. `None` never gives up.
    pub max_attempts: Option<u32>,

    /// Longest hint worth waiting for. A call asked to wait longer gives up.
    /// `None` waits out any hint.
    #[serde(with = "opt_duration_secs")]
    pub max_delay: Option<Duration>,

    /// Extra random delay, as a fraction of the hint (0.1 = up to +10%), at most 1.0.
    pub jitter: f64,

    /// Also retry transient errors that came without a hint, after `fallback_delay`.
    pub retry_without_hint: bool,

    #[serde(with = "duration_secs")]
    pub fallback_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            max_delay: None,
            jitter: 0.0,
            retry_without_hint: false,
            fallback_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait for a server hint, or `None` when the hint is longer than
    /// `max_delay`.
    ///
    /// Never shorter than the hint. Jitter only lengthens the wait.
    pub fn delay_for(&self, hint: Duration) -> Option<Duration> {
        if self.max_delay.is_some_and(|max| hint > max) {
            return None;
        }
        if self.jitter.is_nan() || self.jitter <= 0.0 {
            return Some(hint);
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        let jittered = Duration::try_from_secs_f64(hint.as_secs_f64() * (1.0 + extra));
        Some(jittered.map_or(hint, |delay| delay.max(hint)))
    }

    /// Has a call that already retried `attempts` times run out of retries?
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Retry bookkeeping for one zone call.
pub(crate) struct RetryState<'a> {
    policy: &'a RetryPolicy,
    zone: &'a ZoneId,
    operation: &'static str,
    attempts: u32,
}

impl<'a> RetryState<'a> {
    pub(crate) fn new(policy: &'a RetryPolicy, zone: &'a ZoneId, operation: &'static str) -> Self {
        Self {
            policy,
            zone,
            operation,
            attempts: 0,
        }
    }

    /// Count one more round without waiting.
    pub(crate) fn note_attempt(&mut self) -> Result<u32, ZoneError> {
        if self.policy.is_exhausted(self.attempts) {
            return Err(ZoneError::RetriesExhausted {
                operation: self.operation,
                attempts: self.attempts,
            });
        }
        self.attempts += 1;
        Ok(self.attempts)
    }

    /// Sleep for the server's hint. Doesn't block the orchestration context.
    pub(crate) async fn wait(&mut self, hint: Duration) -> Result<(), ZoneError> {
        let Some(delay) = self.policy.delay_for(hint) else {
            warn!(
                zone = %self.zone,
                operation = self.operation,
                hint_secs = hint.as_secs_f64(),
                "server delay hint exceeds max_delay, giving up"
            );
            return Err(ZoneError::RetriesExhausted {
                operation: self.operation,
                attempts: self.attempts,
            });
        };
        let attempt = self.note_attempt()?;
        warn!(
            zone = %self.zone,
            operation = self.operation,
            attempt,
            delay_secs = delay.as_secs_f64(),
            "retrying after server delay hint"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

/// `Duration` as (fractional) seconds in config files.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// `Option<Duration>` as seconds or `null`.
mod opt_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&value.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
