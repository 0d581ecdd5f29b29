//! Engine configuration.
//!
//! Plain serde structs with a `Default` impl; stored as pretty JSON.

use std::path::Path;
use std::time::Duration;

use sc_crypto::CipherSuite;
use sc_proto::PaddingMode;
use serde::{Deserialize, Serialize};

use crate::destruct::{validate_ttl, DestructStart};
use crate::error::ConfigError;
use crate::sequence::SequencePolicy;

const MAX_TIMEOUT_SECS: u64 = 24 * 3600;
const MAX_KEY_AGE_SECS: u64 = 365 * 24 * 3600;
const MAX_TICK_MS: u64 = 60_000;
const MAX_WHEEL_SLOTS: u64 = 1 << 16;

fn check_range(field: &str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Invalid(format!(
            "{field} = {value} is outside {min}..={max}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RekeyPolicy {
    /// Rekey after this many messages (both directions) under one key
    pub after_messages: u64,
    /// Rekey once the key is this old
    pub after_secs: u64,
    /// How long to wait for the peer's accept (and, as responder, its commit)
    pub timeout_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Consecutive integrity failures that force a rekey
    pub max_integrity_failures: u32,
    /// How often each session actor checks its rekey triggers
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl RekeyPolicy {
    pub fn after(&self) -> Duration {
        Duration::from_secs(self.after_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// `base * 2^(attempt-1)`, capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let secs = self
            .backoff_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_secs);
        Duration::from_secs(secs)
    }
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self {
            after_messages: 100,
            after_secs: 7 * 24 * 3600,
            timeout_secs: 30,
            backoff_base_secs: 5,
            backoff_max_secs: 300,
            max_integrity_failures: 3,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestructSettings {
    /// Tick length of the timing wheel
    pub resolution_ms: u64,
    pub wheel_slots: usize,
    #[serde(default)]
    pub start: DestructStart,
}

impl DestructSettings {
    pub fn resolution(&self) -> Duration {
        Duration::from_millis(self.resolution_ms)
    }
}

impl Default for DestructSettings {
    fn default() -> Self {
        Self {
            resolution_ms: 1000,
            wheel_slots: 256,
            start: DestructStart::OnRead,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub handshake_timeout_secs: u64,
    pub sequence_policy: SequencePolicy,
    /// Offered / accepted cipher suites, most preferred first
    pub cipher_suites: Vec<CipherSuite>,
    pub padding: PaddingMode,
    /// Self-destruct timer for newly created chats (0 = off)
    pub default_ttl_secs: u32,
    pub rekey: RekeyPolicy,
    pub self_destruct: DestructSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 30,
            sequence_policy: SequencePolicy::Strict,
            cipher_suites: vec![CipherSuite::XChaCha20Poly1305, CipherSuite::Aes256Gcm],
            padding: PaddingMode::Buckets,
            default_ttl_secs: 0,
            rekey: RekeyPolicy::default(),
            self_destruct: DestructSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Every duration is bounded so deadlines computed from it fit in an
    /// `Instant`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cipher_suites.is_empty() {
            return Err(ConfigError::Invalid("cipher_suites must not be empty".into()));
        }
        check_range("handshake_timeout_secs", self.handshake_timeout_secs, 1, MAX_TIMEOUT_SECS)?;

        let rekey = &self.rekey;
        if rekey.after_messages == 0 {
            return Err(ConfigError::Invalid("rekey.after_messages must be > 0".into()));
        }
        check_range("rekey.after_secs", rekey.after_secs, 1, MAX_KEY_AGE_SECS)?;
        check_range("rekey.timeout_secs", rekey.timeout_secs, 1, MAX_TIMEOUT_SECS)?;
        check_range("rekey.backoff_max_secs", rekey.backoff_max_secs, 1, MAX_TIMEOUT_SECS)?;
        check_range(
            "rekey.backoff_base_secs",
            rekey.backoff_base_secs,
            1,
            rekey.backoff_max_secs,
        )?;
        check_range("rekey.poll_interval_ms", rekey.poll_interval_ms, 1, MAX_TICK_MS)?;

        let destruct = &self.self_destruct;
        check_range("self_destruct.resolution_ms", destruct.resolution_ms, 1, MAX_TICK_MS)?;
        check_range(
            "self_destruct.wheel_slots",
            destruct.wheel_slots as u64,
            1,
            MAX_WHEEL_SLOTS,
        )?;
        validate_ttl(self.default_ttl_secs)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.rekey.after_messages, 100);
        assert_eq!(config.rekey.after(), Duration::from_secs(604_800));
        assert_eq!(config.cipher_suites[0], CipherSuite::XChaCha20Poly1305);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RekeyPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(4), Duration::from_secs(40));
        assert_eq!(policy.backoff(10), Duration::from_secs(300));
        assert_eq!(policy.backoff(200), Duration::from_secs(300));
    }

    #[test]
    fn rejects_unsupported_default_ttl() {
        let config = EngineConfig {
            default_ttl_secs: 45,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_out_of_range_durations() {
        let huge_handshake = EngineConfig {
            handshake_timeout_secs: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(huge_handshake.validate(), Err(ConfigError::Invalid(_))));

        let mut config = EngineConfig::default();
        config.rekey.backoff_max_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.rekey.backoff_base_secs = config.rekey.backoff_max_secs + 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.rekey.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.self_destruct.resolution_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let mut config = EngineConfig::default();
        config.rekey.after_messages = 7;
        config.padding = PaddingMode::None;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.rekey.after_messages, 7);
        assert_eq!(loaded.padding, PaddingMode::None);
    }
}
