//! Credential handling: password hashing, token generation, and the
//! auth-failure rate limiter.

pub mod middleware;

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{AppError, AppResult};

/// Opaque API tokens are 64 alphanumeric characters.
const TOKEN_LENGTH: usize = 64;

const MAX_AUTH_FAILURES: usize = 6;
const FAILURE_WINDOW: Duration = Duration::from_secs(10 * 60);

pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

pub fn hash_password(password: &str) -> AppResult<String> {
    let salt: Vec<u8> = rand::thread_rng()
        .sample_iter(&rand::distributions::Standard)
        .take(16)
        .collect();
    argon2::hash_encoded(password.as_bytes(), &salt, &argon2::Config::default())
        .map_err(|e| AppError::Internal(format!("password hash failed: {e}")))
}

pub fn verify_password(encoded: &str, password: &str) -> AppResult<bool> {
    argon2::verify_encoded(encoded, password.as_bytes())
        .map_err(|e| AppError::Internal(format!("password verify failed: {e}")))
}

/// Sliding-window limiter for authentication failures, keyed by client IP.
/// Login, registration, and token verification all share one instance.
#[derive(Default)]
pub struct AuthFailureLimiter {
    failures: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl AuthFailureLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors with `RateLimited` when the IP has burned through its budget.
    /// Call before checking credentials.
    pub fn check(&self, ip: IpAddr) -> AppResult<()> {
        let mut failures = self.failures.lock();
        let now = Instant::now();
        if let Some(entries) = failures.get_mut(&ip) {
            entries.retain(|t| now.duration_since(*t) < FAILURE_WINDOW);
            if entries.len() >= MAX_AUTH_FAILURES {
                return Err(AppError::RateLimited);
            }
        }
        Ok(())
    }

    /// Records one failed attempt.
    pub fn record_failure(&self, ip: IpAddr) {
        let mut failures = self.failures.lock();
        let now = Instant::now();
        let entries = failures.entry(ip).or_default();
        entries.retain(|t| now.duration_since(*t) < FAILURE_WINDOW);
        entries.push(now);
    }

    /// A successful authentication clears the IP's slate.
    pub fn record_success(&self, ip: IpAddr) {
        self.failures.lock().remove(&ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_long_and_alphanumeric() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn password_hash_round_trips() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password(&hash, "hunter2").unwrap());
        assert!(!verify_password(&hash, "hunter3").unwrap());
    }

    #[test]
    fn limiter_blocks_after_six_failures() {
        let limiter = AuthFailureLimiter::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        for _ in 0..MAX_AUTH_FAILURES {
            limiter.check(ip).unwrap();
            limiter.record_failure(ip);
        }
        assert!(matches!(limiter.check(ip), Err(AppError::RateLimited)));

        // Another IP is unaffected.
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        limiter.check(other).unwrap();

        // Success resets the window.
        limiter.record_success(ip);
        limiter.check(ip).unwrap();
    }
}
