use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

const SALT_LEN: usize = 16;
const MIN_PIN_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("wrong PIN ({remaining} attempts left before lockout)")]
    WrongPin { remaining: u32 },

    #[error("too many failed attempts, retry in {}s", .retry_after.as_secs())]
    LockedOut { retry_after: Duration },

    #[error("a PIN is required")]
    PinRequired,

    #[error("no PIN is configured on this device")]
    PinNotSet,

    #[error("PIN must be at least 4 characters")]
    PinTooShort,

    #[error("stored PIN is malformed")]
    MalformedStoredPin,
}

impl AuthError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::LockedOut { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockoutConfig {
    /// Failures allowed before the first lockout.
    pub threshold: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            base: Duration::from_secs(60),
            max: Duration::from_secs(30 * 60),
        }
    }
}

/// Lockout after `failures` consecutive failures: zero below the threshold,
/// then `base * 2^(failures - threshold)` capped at `max`.
pub fn block_duration(failures: u32, cfg: &LockoutConfig) -> Duration {
    if failures < cfg.threshold {
        return Duration::ZERO;
    }
    let exp = failures - cfg.threshold;
    if exp >= 32 {
        return cfg.max;
    }
    cfg.base
        .checked_mul(1u32 << exp)
        .map_or(cfg.max, |d| d.min(cfg.max))
}

#[derive(Debug)]
struct Attempts {
    failures: u32,
    locked_until: Option<Instant>,
    last_failure: Instant,
}

impl Attempts {
    /// Nothing left to enforce: no active lockout, and quiet for `idle`.
    fn is_idle(&self, now: Instant, idle: Duration) -> bool {
        self.locked_until.is_none_or(|until| now >= until)
            && now.saturating_duration_since(self.last_failure) >= idle
    }
}

/// salt + HMAC-SHA256(key = salt, msg = pin)
#[derive(Clone)]
struct StoredPin {
    salt: [u8; SALT_LEN],
    mac: Vec<u8>,
}

impl StoredPin {
    fn mac_for(salt: &[u8], pin: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(salt).expect("HMAC accepts keys of any length");
        mac.update(pin.as_bytes());
        mac
    }

    fn new(pin: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mac = Self::mac_for(&salt, pin).finalize().into_bytes().to_vec();
        Self { salt, mac }
    }

    fn matches(&self, pin: &str) -> bool {
        Self::mac_for(&self.salt, pin).verify_slice(&self.mac).is_ok()
    }
}

/// Device-level PIN check with per-client lockout. Clients are keyed by
/// peer device id when known, otherwise by remote address.
pub struct PinGate {
    stored: Mutex<Option<StoredPin>>,
    attempts: Mutex<HashMap<String, Attempts>>,
    config: LockoutConfig,
}

impl PinGate {
    pub fn new(config: LockoutConfig) -> Self {
        Self {
            stored: Mutex::new(None),
            attempts: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    pub fn set_pin(&self, pin: &str) -> Result<(), AuthError> {
        if pin.chars().count() < MIN_PIN_LEN {
            return Err(AuthError::PinTooShort);
        }
        *self.stored.lock().unwrap_or_else(|e| e.into_inner()) = Some(StoredPin::new(pin));
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).clear();
        info!("Device PIN updated");
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.stored.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// `hex(salt):hex(mac)` for persisting.
    pub fn to_stored(&self) -> Option<String> {
        self.stored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| format!("{}:{}", hex::encode(s.salt), hex::encode(&s.mac)))
    }

    pub fn load_stored(&self, stored: &str) -> Result<(), AuthError> {
        let (salt, mac) = stored.split_once(':').ok_or(AuthError::MalformedStoredPin)?;
        let salt: [u8; SALT_LEN] = hex::decode(salt)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(AuthError::MalformedStoredPin)?;
        let mac = hex::decode(mac).map_err(|_| AuthError::MalformedStoredPin)?;
        if mac.len() != 32 {
            return Err(AuthError::MalformedStoredPin);
        }
        *self.stored.lock().unwrap_or_else(|e| e.into_inner()) = Some(StoredPin { salt, mac });
        Ok(())
    }

    pub fn verify(&self, client: &str, pin: Option<&str>) -> Result<(), AuthError> {
        self.verify_at(client, pin, Instant::now())
    }

    /// Check `pin` for `client` at time `now`. A locked-out client is
    /// rejected without evaluating the PIN; a correct PIN clears the
    /// failure count.
    pub fn verify_at(&self, client: &str, pin: Option<&str>, now: Instant) -> Result<(), AuthError> {
        let stored = self
            .stored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(AuthError::PinNotSet)?;

        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(until) = attempts.get(client).and_then(|a| a.locked_until) {
            if now < until {
                return Err(AuthError::LockedOut { retry_after: until - now });
            }
        }

        let Some(pin) = pin else {
            return Err(AuthError::PinRequired);
        };

        if stored.matches(pin) {
            attempts.remove(client);
            return Ok(());
        }

        let entry = attempts.entry(client.to_string()).or_insert(Attempts {
            failures: 0,
            locked_until: None,
            last_failure: now,
        });
        entry.failures += 1;
        entry.last_failure = now;
        let block = block_duration(entry.failures, &self.config);
        warn!(client, failures = entry.failures, "PIN verification failed");

        if block.is_zero() {
            return Err(AuthError::WrongPin {
                remaining: self.config.threshold - entry.failures,
            });
        }
        entry.locked_until = Some(now + block);
        warn!(client, lockout_secs = block.as_secs(), "Client locked out");
        Err(AuthError::LockedOut { retry_after: block })
    }

    /// Forget clients whose lockout has run out and who have not failed for
    /// the maximum block duration. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    pub fn prune_at(&self, now: Instant) -> usize {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let before = attempts.len();
        attempts.retain(|_, a| !a.is_idle(now, self.config.max));
        before - attempts.len()
    }

    pub fn failures(&self, client: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(client)
            .map_or(0, |a| a.failures)
    }
}

impl Default for PinGate {
    fn default() -> Self {
        Self::new(LockoutConfig::default())
    }
}
