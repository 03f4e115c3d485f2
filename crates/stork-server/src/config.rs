use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use stork_transfer::{DEFAULT_CHUNK_SIZE, Settings};

/// Process configuration, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub device_name: String,
    /// Identity, history database and partial files.
    pub data_dir: PathBuf,
    pub download_dir: PathBuf,
    /// Device PIN, hashed on startup. Only checked when `require_pin` is set.
    pub pin: Option<String>,
    /// PIN sent to the remote device in `send` mode.
    pub remote_pin: Option<String>,
    pub chunk_size: u64,
    pub batch_concurrency: usize,
    pub cleanup_interval: Duration,
    pub settings: Settings,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Settings::default();
        let settings = Settings {
            require_approval: env_or("STORK_REQUIRE_APPROVAL", defaults.require_approval)?,
            auto_approve_trusted: env_or("STORK_AUTO_APPROVE_TRUSTED", defaults.auto_approve_trusted)?,
            require_pin: env_or("STORK_REQUIRE_PIN", defaults.require_pin)?,
            approve_outbound: env_or("STORK_APPROVE_OUTBOUND", defaults.approve_outbound)?,
            encryption_enabled: env_or("STORK_ENCRYPTION", defaults.encryption_enabled)?,
            require_authentication: env_or(
                "STORK_REQUIRE_AUTH_FOR_ENCRYPTION",
                defaults.require_authentication,
            )?,
            approval_timeout: Duration::from_secs(env_or("STORK_APPROVAL_TIMEOUT_SECS", 300)?),
            resume_stale_after: Duration::from_secs(env_or::<u64>("STORK_RESUME_STALE_HOURS", 168)? * 3600),
            approval_retention: Duration::from_secs(env_or::<u64>("STORK_APPROVAL_RETENTION_HOURS", 24)? * 3600),
        };

        let device_name = std::env::var("STORK_DEVICE_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "stork".into());

        let config = Self {
            host: std::env::var("STORK_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("STORK_PORT", 8420)?,
            device_name,
            data_dir: std::env::var("STORK_DATA_DIR")
                .unwrap_or_else(|_| "./stork-data".into())
                .into(),
            download_dir: std::env::var("STORK_DOWNLOAD_DIR")
                .unwrap_or_else(|_| "./downloads".into())
                .into(),
            pin: non_empty("STORK_PIN"),
            remote_pin: non_empty("STORK_REMOTE_PIN"),
            chunk_size: env_or("STORK_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            batch_concurrency: env_or("STORK_BATCH_CONCURRENCY", 3)?,
            cleanup_interval: Duration::from_secs(env_or("STORK_CLEANUP_INTERVAL_SECS", 3600)?),
            settings,
        };
        if config.settings.require_pin && config.pin.is_none() {
            anyhow::bail!("STORK_REQUIRE_PIN is set but STORK_PIN is empty");
        }
        Ok(config)
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("stork.db")
    }

    pub fn partial_dir(&self) -> PathBuf {
        self.data_dir.join("partial")
    }
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {v:?}")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variables_use_defaults() {
        let port: u16 = env_or("STORK_TEST_UNSET_PORT_VARIABLE", 8420).unwrap();
        assert_eq!(port, 8420);
        let flag: bool = env_or("STORK_TEST_UNSET_FLAG_VARIABLE", true).unwrap();
        assert!(flag);
    }

    #[test]
    fn paths_live_under_data_dir() {
        let config = Config {
            host: "0.0.0.0".into(),
            port: 8420,
            device_name: "desk".into(),
            data_dir: PathBuf::from("/var/lib/stork"),
            download_dir: PathBuf::from("/srv/downloads"),
            pin: None,
            remote_pin: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_concurrency: 3,
            cleanup_interval: Duration::from_secs(3600),
            settings: Settings::default(),
        };
        assert_eq!(config.identity_path(), PathBuf::from("/var/lib/stork/identity.json"));
        assert_eq!(config.partial_dir(), PathBuf::from("/var/lib/stork/partial"));
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/stork/stork.db"));
    }
}
