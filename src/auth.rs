//! Interservice authentication.
//!
//! A token is `hex(HMAC-SHA256(secret, window))` where `window` is the current
//! UTC time advanced by 30 minutes, truncated to the hour and rendered as
//! `YYYY-MM-DDTHH:00:00.000Z`. Only one token is valid at any instant; there is
//! no grace period for the previous window, so peers whose clocks disagree
//! across a half-hour boundary will reject each other.

use std::fmt;

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

/// Request header carrying the token
pub const AUTH_HEADER: &str = "X-Interservice-Authentication-Token";

/// Environment variable holding the shared secret
pub const AUTH_KEY_ENV: &str = "INTERSERVICE_AUTHENTICATION_KEY";

type HmacSha256 = Hmac<Sha256>;

/// Authentication epoch derived from wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow(DateTime<Utc>);

impl TimeWindow {
    /// Window that is current at `now`.
    pub fn at(now: DateTime<Utc>) -> Self {
        let advanced = now + TimeDelta::minutes(30);
        let floored = advanced
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(advanced);
        Self(floored)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%S.000Z"))
    }
}

/// Compute the token a client should present at `now`.
pub fn generate_token(secret: &str, now: DateTime<Utc>) -> String {
    token_for_window(secret.as_bytes(), &TimeWindow::at(now)).unwrap_or_default()
}

fn token_for_window(secret: &[u8], window: &TimeWindow) -> Option<String> {
    // HMAC takes keys of any length, so this never fails in practice
    let mut mac = <HmacSha256 as KeyInit>::new_from_slice(secret).ok()?;
    mac.update(window.to_string().as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Validates bearer tokens against the rolling window.
#[derive(Clone)]
pub struct Verifier {
    secret: Vec<u8>,
}

impl Verifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Read the secret once from `INTERSERVICE_AUTHENTICATION_KEY`.
    ///
    /// An unset variable yields an empty key. Requests then only pass if the
    /// client also signs with an empty key, which is almost certainly a
    /// deployment mistake rather than a way to disable authentication.
    pub fn from_env() -> Self {
        let secret = std::env::var(AUTH_KEY_ENV).unwrap_or_default();
        if secret.is_empty() {
            warn!(
                "{} is not set; tokens are signed with an empty key",
                AUTH_KEY_ENV
            );
        }
        Self::new(secret)
    }

    pub fn verify(&self, token: Option<&str>) -> bool {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: Option<&str>, now: DateTime<Utc>) -> bool {
        let Some(token) = token else {
            debug!("request without authentication token");
            return false;
        };
        let Some(expected) = token_for_window(&self.secret, &TimeWindow::at(now)) else {
            return false;
        };
        let ok = constant_time_eq(expected.as_bytes(), token.as_bytes());
        if !ok {
            debug!("authentication token rejected");
        }
        ok
    }
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verifier")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}
