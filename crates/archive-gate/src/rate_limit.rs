//! Rate Limiting Module
//!
//! NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
//! STIG: V-222578 - Implement replay-resistant authentication mechanisms
//! Implementation: Per (identity, origin) failure tracking with timed lockout

use crate::config::RateLimitSettings;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_LOCKOUT_SECS: u64 = 15 * 60;

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Failures that trip the lockout
    pub max_attempts: u32,
    /// Lockout duration once tripped
    pub lockout_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lockout_duration: Duration::from_secs(DEFAULT_LOCKOUT_SECS),
        }
    }
}

impl RateLimitConfig {
    /// Build from file settings, replacing non-positive values with defaults
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        let max_attempts = match u32::try_from(settings.max_login_attempts) {
            Ok(n) if n > 0 => n,
            _ => {
                warn!(
                    event = "rate_limit_config_fallback",
                    value = settings.max_login_attempts,
                    "max_login_attempts must be positive; using {DEFAULT_MAX_ATTEMPTS}"
                );
                DEFAULT_MAX_ATTEMPTS
            }
        };

        let lockout_duration = match u64::try_from(settings.lockout_duration_minutes) {
            Ok(m) if m > 0 => Duration::from_secs(m.saturating_mul(60)),
            _ => {
                warn!(
                    event = "rate_limit_config_fallback",
                    value = settings.lockout_duration_minutes,
                    "lockout_duration_minutes must be positive; using 15"
                );
                Duration::from_secs(DEFAULT_LOCKOUT_SECS)
            }
        };

        Self {
            max_attempts,
            lockout_duration,
        }
    }
}

/// Key of an attempt record: lowercased identity plus origin address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AttemptKey {
    identity: String,
    origin: String,
}

impl AttemptKey {
    fn new(identity: &str, origin: &str) -> Self {
        Self {
            identity: identity.trim().to_lowercase(),
            origin: origin.to_string(),
        }
    }
}

/// Authentication attempt record
///
/// NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
#[derive(Debug, Clone)]
struct AttemptRecord {
    failed_attempts: u32,
    /// Attempts admitted by `begin_attempt` and not yet settled
    in_flight: u32,
    first_failure: Instant,
    lockout_until: Option<Instant>,
}

impl AttemptRecord {
    fn new(now: Instant) -> Self {
        Self {
            failed_attempts: 0,
            in_flight: 0,
            first_failure: now,
            lockout_until: None,
        }
    }

    fn lockout_elapsed(&self, now: Instant) -> bool {
        self.lockout_until.is_some_and(|until| now >= until)
    }

    /// locked -> clear once the lockout has run out; in-flight attempts survive
    fn reset_if_elapsed(&mut self, now: Instant) {
        if self.lockout_elapsed(now) {
            let in_flight = self.in_flight;
            *self = Self::new(now);
            self.in_flight = in_flight;
        }
    }

    fn is_idle(&self) -> bool {
        self.failed_attempts == 0 && self.in_flight == 0 && self.lockout_until.is_none()
    }
}

fn ceil_secs(left: Duration) -> u64 {
    left.as_secs() + u64::from(left.subsec_nanos() > 0)
}

/// Why `begin_attempt` refused to admit an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptRefused {
    /// The key is locked out
    LockedOut {
        /// Seconds until the lockout lifts, at least 1
        remaining_secs: u64,
    },
    /// Recorded failures plus pending attempts already reach the threshold
    ///
    /// The refusal itself is counted as a failure; `locked` reports whether
    /// that engaged the lockout.
    Saturated {
        /// The lockout is now engaged
        locked: bool,
    },
}

/// An admitted authentication attempt
///
/// Settle it with [`AttemptGuard::failed`] or [`AttemptGuard::succeeded`].
/// Dropping it unsettled withdraws the attempt without counting it.
#[must_use = "an attempt must be settled as a failure or a success"]
pub struct AttemptGuard<'a> {
    limiter: &'a RateLimiter,
    key: Option<AttemptKey>,
}

impl AttemptGuard<'_> {
    /// Count the attempt as a failure; returns `true` when the key is now locked
    pub fn failed(mut self) -> bool {
        match self.key.take() {
            Some(key) => self.limiter.settle_failure(&key),
            None => false,
        }
    }

    /// Clear the key after a successful authentication
    pub fn succeeded(mut self) {
        if let Some(key) = self.key.take() {
            self.limiter.clear_key(&key);
        }
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.limiter.withdraw(&key);
        }
    }
}

/// Rate limiter for authentication attempts
///
/// NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
/// STIG: V-222578 - Replay-resistant authentication
/// Implementation: Each key is updated under its shard lock, so concurrent
/// failures against one key are all counted.
pub struct RateLimiter {
    config: RateLimitConfig,
    attempts: DashMap<AttemptKey, AttemptRecord>,
}

impl RateLimiter {
    /// Create a new rate limiter
    ///
    /// # NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            attempts: DashMap::new(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Record a failed authentication attempt
    ///
    /// Returns `true` when the key is locked after this failure.
    ///
    /// # NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
    /// # STIG: V-222578
    pub fn record_failure(&self, identity: &str, origin: &str) -> bool {
        let now = Instant::now();
        let key = AttemptKey::new(identity, origin);
        let mut record = self
            .attempts
            .entry(key.clone())
            .or_insert_with(|| AttemptRecord::new(now));
        record.reset_if_elapsed(now);
        self.count_failure(&key, &mut record, now)
    }

    /// Admit an authentication attempt against the key, or refuse it
    ///
    /// The check and the booking happen under the key's entry lock. Recorded
    /// failures plus admitted, unsettled attempts never exceed `max_attempts`,
    /// so concurrent guesses cannot outrun the lockout.
    ///
    /// # NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
    ///
    /// # Errors
    ///
    /// `AttemptRefused::LockedOut` while locked, `AttemptRefused::Saturated`
    /// when earlier attempts already use up the threshold. Both are counted.
    pub fn begin_attempt(
        &self,
        identity: &str,
        origin: &str,
    ) -> std::result::Result<AttemptGuard<'_>, AttemptRefused> {
        let now = Instant::now();
        let key = AttemptKey::new(identity, origin);
        let mut record = self
            .attempts
            .entry(key.clone())
            .or_insert_with(|| AttemptRecord::new(now));
        record.reset_if_elapsed(now);

        if let Some(until) = record.lockout_until {
            self.count_failure(&key, &mut record, now);
            return Err(AttemptRefused::LockedOut {
                remaining_secs: ceil_secs(until.saturating_duration_since(now)).max(1),
            });
        }

        if record.failed_attempts.saturating_add(record.in_flight) >= self.config.max_attempts {
            let locked = self.count_failure(&key, &mut record, now);
            return Err(AttemptRefused::Saturated { locked });
        }

        record.in_flight = record.in_flight.saturating_add(1);
        drop(record);
        Ok(AttemptGuard {
            limiter: self,
            key: Some(key),
        })
    }

    fn count_failure(&self, key: &AttemptKey, record: &mut AttemptRecord, now: Instant) -> bool {
        if record.failed_attempts == 0 {
            record.first_failure = now;
        }
        record.failed_attempts = record.failed_attempts.saturating_add(1);

        warn!(
            event = "auth_failure_recorded",
            identity = %key.identity,
            origin = %key.origin,
            failures = record.failed_attempts,
            max_attempts = self.config.max_attempts,
            "Failed authentication attempt"
        );

        if record.failed_attempts >= self.config.max_attempts && record.lockout_until.is_none() {
            record.lockout_until = Some(now + self.config.lockout_duration);
            warn!(
                event = "account_locked",
                identity = %key.identity,
                origin = %key.origin,
                lockout_secs = self.config.lockout_duration.as_secs(),
                "Lockout engaged"
            );
        }

        record.lockout_until.is_some()
    }

    fn settle_failure(&self, key: &AttemptKey) -> bool {
        let now = Instant::now();
        let mut record = self
            .attempts
            .entry(key.clone())
            .or_insert_with(|| AttemptRecord::new(now));
        record.in_flight = record.in_flight.saturating_sub(1);
        record.reset_if_elapsed(now);
        self.count_failure(key, &mut record, now)
    }

    fn withdraw(&self, key: &AttemptKey) {
        if let Some(mut record) = self.attempts.get_mut(key) {
            record.in_flight = record.in_flight.saturating_sub(1);
        }
        self.attempts.remove_if(key, |_, r| r.is_idle());
    }

    fn clear_key(&self, key: &AttemptKey) {
        if let Some((key, record)) = self.attempts.remove(key) {
            debug!(
                identity = %key.identity,
                origin = %key.origin,
                cleared = record.failed_attempts,
                "Clearing failed attempts after successful authentication"
            );
        }
    }

    /// Record a successful authentication, clearing the key
    ///
    /// # NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
    pub fn record_success(&self, identity: &str, origin: &str) {
        self.clear_key(&AttemptKey::new(identity, origin));
    }

    /// Whether the key is currently locked out
    pub fn is_locked_out(&self, identity: &str, origin: &str) -> bool {
        self.remaining_lockout_seconds(identity, origin) > 0
    }

    /// Seconds until the lockout lifts; 0 when not locked
    ///
    /// Rounded up so a locked key never reports 0.
    pub fn remaining_lockout_seconds(&self, identity: &str, origin: &str) -> u64 {
        let now = Instant::now();
        let key = AttemptKey::new(identity, origin);

        let remaining = match self.attempts.get(&key) {
            Some(record) => match record.lockout_until {
                Some(until) if until > now => Some(ceil_secs(until - now)),
                Some(_) => None,
                None => return 0,
            },
            None => return 0,
        };

        match remaining {
            Some(secs) => secs,
            None => {
                // Lockout elapsed: locked -> clear
                self.attempts
                    .remove_if(&key, |_, r| r.lockout_elapsed(now) && r.in_flight == 0);
                0
            }
        }
    }

    /// Failures recorded for the key in its current cycle
    pub fn failure_count(&self, identity: &str, origin: &str) -> u32 {
        let now = Instant::now();
        self.attempts
            .get(&AttemptKey::new(identity, origin))
            .filter(|r| !r.lockout_elapsed(now))
            .map_or(0, |r| r.failed_attempts)
    }

    /// Drop records whose lockout has elapsed
    ///
    /// Accumulating records are kept: they only leave through a success or
    /// a lockout. Returns the number of removed records.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.attempts.len();
        self.attempts.retain(|_, record| {
            if record.in_flight > 0 {
                return true;
            }
            match record.lockout_until {
                Some(until) => now < until,
                None => record.failed_attempts > 0,
            }
        });
        let removed = before.saturating_sub(self.attempts.len());
        if removed > 0 {
            debug!(removed, "Cleaned up expired rate limit records");
        }
        removed
    }

    /// Remove every record
    pub fn clear(&self) {
        self.attempts.clear();
    }

    /// Number of tracked keys
    pub fn tracked_keys(&self) -> usize {
        self.attempts.len()
    }

    /// Number of keys currently locked out
    pub fn locked_keys(&self) -> usize {
        let now = Instant::now();
        self.attempts
            .iter()
            .filter(|r| r.lockout_until.is_some_and(|until| now < until))
            .count()
    }
}
