use std::time::Duration;

/// Runtime knobs for the translation layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Upper bound on a single Signaller wait. Expiring with work outstanding is logged as an
    /// anomaly; it is a liveness check, not a contract.
    pub signaller_timeout: Duration,
    /// Maintain the host → guest reverse index even without a diagnostics callback.
    pub always_track_host_objects: bool,
    /// Size of each heap block a conversion context falls back to once its inline buffer is full.
    pub conversion_block_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            signaller_timeout: Duration::from_secs(10),
            always_track_host_objects: false,
            conversion_block_bytes: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
}

const ENV_SIGNALLER_TIMEOUT_MS: &str = "AERO_VKBRIDGE_SIGNALLER_TIMEOUT_MS";
const ENV_REVERSE_INDEX: &str = "AERO_VKBRIDGE_REVERSE_INDEX";
const ENV_CONVERSION_BLOCK_BYTES: &str = "AERO_VKBRIDGE_CONVERSION_BLOCK_BYTES";

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`BridgeConfig::from_env`] but reads variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(raw) = lookup(ENV_SIGNALLER_TIMEOUT_MS) {
            let ms = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or(ConfigError::InvalidEnv(ENV_SIGNALLER_TIMEOUT_MS))?;
            cfg.signaller_timeout = Duration::from_millis(ms);
        }

        if let Some(raw) = lookup(ENV_REVERSE_INDEX) {
            cfg.always_track_host_objects = parse_bool(&raw).ok_or(ConfigError::InvalidEnv(ENV_REVERSE_INDEX))?;
        }

        if let Some(raw) = lookup(ENV_CONVERSION_BLOCK_BYTES) {
            cfg.conversion_block_bytes = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|bytes| *bytes >= 8)
                .ok_or(ConfigError::InvalidEnv(ENV_CONVERSION_BLOCK_BYTES))?;
        }

        Ok(cfg)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    let v = raw.trim();
    if v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
    {
        Some(true)
    } else if v == "0"
        || v.eq_ignore_ascii_case("false")
        || v.eq_ignore_ascii_case("no")
        || v.eq_ignore_ascii_case("off")
    {
        Some(false)
    } else {
        None
    }
}
