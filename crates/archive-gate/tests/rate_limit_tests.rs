//! Login rate limiting integration tests
//!
//! NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
//! STIG: V-222578
//! Implementation: Lockout thresholds, key independence and concurrent failure
//! accounting

use archive_gate::rate_limit::{AttemptRefused, RateLimitConfig, RateLimiter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn limiter(max_attempts: u32, lockout: Duration) -> RateLimiter {
    RateLimiter::new(RateLimitConfig {
        max_attempts,
        lockout_duration: lockout,
    })
}

/// NIST 800-53: AC-7 - The threshold failure engages the lockout
#[test]
fn test_lockout_after_threshold() {
    let limiter = limiter(3, Duration::from_secs(60));

    assert!(!limiter.record_failure("alice", "10.0.0.1"));
    assert!(!limiter.record_failure("alice", "10.0.0.1"));
    assert!(!limiter.is_locked_out("alice", "10.0.0.1"));
    assert!(limiter.record_failure("alice", "10.0.0.1"));
    assert!(limiter.is_locked_out("alice", "10.0.0.1"));

    let remaining = limiter.remaining_lockout_seconds("alice", "10.0.0.1");
    assert!(remaining > 0 && remaining <= 60);
}

/// NIST 800-53: AC-7 - Attempts during a lockout keep it engaged and are counted
#[test]
fn test_attempts_while_locked_are_counted() {
    let limiter = limiter(3, Duration::from_secs(60));
    for _ in 0..3 {
        limiter.record_failure("alice", "10.0.0.1");
    }

    assert!(limiter.record_failure("alice", "10.0.0.1"));
    assert!(limiter.is_locked_out("alice", "10.0.0.1"));
    assert_eq!(limiter.failure_count("alice", "10.0.0.1"), 4);
}

/// NIST 800-53: AC-7 - Success before the threshold clears the count
#[test]
fn test_success_resets_failures() {
    let limiter = limiter(3, Duration::from_secs(60));
    limiter.record_failure("alice", "10.0.0.1");
    limiter.record_failure("alice", "10.0.0.1");
    limiter.record_success("alice", "10.0.0.1");

    assert_eq!(limiter.failure_count("alice", "10.0.0.1"), 0);
    assert!(!limiter.record_failure("alice", "10.0.0.1"));
    assert_eq!(limiter.tracked_keys(), 1);
}

/// NIST 800-53: AC-7 - Keys are per identity and origin pair
#[test]
fn test_keys_are_independent() {
    let limiter = limiter(2, Duration::from_secs(60));
    limiter.record_failure("alice", "10.0.0.1");
    limiter.record_failure("alice", "10.0.0.1");

    assert!(limiter.is_locked_out("alice", "10.0.0.1"));
    assert!(!limiter.is_locked_out("alice", "10.0.0.2"));
    assert!(!limiter.is_locked_out("bob", "10.0.0.1"));
    assert_eq!(limiter.locked_keys(), 1);
}

/// NIST 800-53: AC-7 - Identity matching ignores case
#[test]
fn test_identity_case_folded() {
    let limiter = limiter(2, Duration::from_secs(60));
    limiter.record_failure("Alice", "10.0.0.1");
    limiter.record_failure("ALICE", "10.0.0.1");

    assert!(limiter.is_locked_out("alice", "10.0.0.1"));
}

/// NIST 800-53: AC-7 - A lockout lifts after its duration
#[test]
fn test_lockout_expires() {
    let limiter = limiter(1, Duration::from_millis(50));
    assert!(limiter.record_failure("alice", "10.0.0.1"));
    assert!(limiter.is_locked_out("alice", "10.0.0.1"));

    thread::sleep(Duration::from_millis(80));

    assert!(!limiter.is_locked_out("alice", "10.0.0.1"));
    assert_eq!(limiter.remaining_lockout_seconds("alice", "10.0.0.1"), 0);
    assert_eq!(limiter.tracked_keys(), 0);
}

/// NIST 800-53: AC-7 - Cleanup drops elapsed lockouts
#[test]
fn test_cleanup_expired() {
    let limiter = limiter(1, Duration::from_millis(50));
    limiter.record_failure("alice", "10.0.0.1");
    limiter.record_failure("bob", "10.0.0.1");
    assert_eq!(limiter.tracked_keys(), 2);

    thread::sleep(Duration::from_millis(80));

    assert_eq!(limiter.cleanup_expired(), 2);
    assert_eq!(limiter.tracked_keys(), 0);
}

/// NIST 800-53: AC-7 - Concurrent failures against one key are all counted
#[test]
fn test_concurrent_failures_counted() {
    let limiter = Arc::new(limiter(5, Duration::from_secs(60)));

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                limiter.record_failure("alice", "10.0.0.1");
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(limiter.failure_count("alice", "10.0.0.1"), 20);
    assert!(limiter.is_locked_out("alice", "10.0.0.1"));
}

/// NIST 800-53: AC-7 - Concurrent attempts cannot outrun the threshold
#[test]
fn test_concurrent_attempts_admitted_up_to_threshold() {
    let limiter = Arc::new(limiter(5, Duration::from_secs(60)));
    let barrier = Arc::new(Barrier::new(20));
    let admitted = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let barrier = Arc::clone(&barrier);
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                let attempt = limiter.begin_attempt("alice", "10.0.0.1");
                // Every attempt is booked before any of them settles
                barrier.wait();
                if let Ok(attempt) = attempt {
                    admitted.fetch_add(1, Ordering::SeqCst);
                    attempt.failed();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 5);
    assert_eq!(limiter.failure_count("alice", "10.0.0.1"), 20);
    assert!(limiter.is_locked_out("alice", "10.0.0.1"));
}

/// NIST 800-53: AC-7 - A locked key refuses attempts and reports the remaining time
#[test]
fn test_locked_key_refuses_attempts() {
    let limiter = limiter(2, Duration::from_secs(60));
    limiter.record_failure("alice", "10.0.0.1");
    limiter.record_failure("alice", "10.0.0.1");

    let refused = limiter.begin_attempt("alice", "10.0.0.1").err();
    assert!(
        matches!(
            refused,
            Some(AttemptRefused::LockedOut { remaining_secs })
                if (1..=60).contains(&remaining_secs)
        ),
        "expected lockout, got {refused:?}"
    );
    assert_eq!(limiter.failure_count("alice", "10.0.0.1"), 3);
}

/// NIST 800-53: AC-7 - Maintenance never resets a key below the threshold
#[test]
fn test_cleanup_does_not_forgive_failures() {
    let limiter = limiter(3, Duration::from_millis(30));
    limiter.record_failure("alice", "10.0.0.1");
    limiter.record_failure("alice", "10.0.0.1");

    thread::sleep(Duration::from_millis(60));
    limiter.cleanup_expired();

    assert_eq!(limiter.tracked_keys(), 1);
    assert!(limiter.record_failure("alice", "10.0.0.1"));
}

/// NIST 800-53: AC-7 - Non-positive settings fall back to defaults
#[test]
fn test_settings_fallback() {
    let settings = archive_gate::config::RateLimitSettings {
        max_login_attempts: 0,
        lockout_duration_minutes: -5,
    };
    let config = RateLimitConfig::from_settings(&settings);
    let defaults = RateLimitConfig::default();

    assert_eq!(config.max_attempts, defaults.max_attempts);
    assert_eq!(config.lockout_duration, defaults.lockout_duration);
}
