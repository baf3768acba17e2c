//! Startup configuration.
//!
//! Settings are read once from environment-style keys, validated, and turned
//! into typed values. Any error here is fatal: the service must not accept
//! traffic with a half-valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::auth::keys::SigningFamily;
use crate::auth::password::HashPrimitive;

/// Prefix shared by every recognized environment key.
pub const ENV_PREFIX: &str = "WARDEN_";

const DEFAULT_ACCESS_TOKEN_DURATION: Duration = Duration::from_secs(5 * 60);
const DEFAULT_REFRESH_TOKEN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_HASH_ITERATIONS: u32 = 4096;
const MIN_HASH_ITERATIONS: u32 = 1000;
const DEFAULT_HASH_KEY_LENGTH: usize = 32;
const HASH_KEY_LENGTH_RANGE: std::ops::RangeInclusive<usize> = 16..=128;
const DEFAULT_RATE_PER_SECOND: f64 = 2.0;
const DEFAULT_BURST: u32 = 2;
const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_DELETION_THRESHOLD: Duration = Duration::from_secs(3 * 60);

/// Configuration errors. All of them abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting WARDEN_{0}")]
    Missing(&'static str),

    #[error("invalid value for WARDEN_{key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    #[error("unable to read key file {}: {source}", path.display())]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unusable key material: {0}")]
    KeyMaterial(String),
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// PEM text given inline, or a path to a file holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    Inline(String),
    File(PathBuf),
}

impl KeyMaterial {
    /// Read the raw PEM bytes.
    pub fn load(&self) -> Result<Vec<u8>, ConfigError> {
        match self {
            KeyMaterial::Inline(pem) => Ok(pem.as_bytes().to_vec()),
            KeyMaterial::File(path) => std::fs::read(path).map_err(|source| ConfigError::KeyFile {
                path: path.clone(),
                source,
            }),
        }
    }
}

/// Token signing settings.
#[derive(Debug, Clone)]
pub struct SigningSettings {
    pub family: SigningFamily,
    /// Digest size in bits (256/384/512). `None` for EdDSA.
    pub size: Option<u16>,
    pub issuer: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    /// Shared secret for HMAC.
    pub secret: Option<String>,
    pub private_key: Option<KeyMaterial>,
    pub public_key: Option<KeyMaterial>,
}

/// Password digest settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HasherSettings {
    pub primitive: HashPrimitive,
    pub iterations: u32,
    pub key_length: usize,
}

impl Default for HasherSettings {
    fn default() -> Self {
        Self {
            primitive: HashPrimitive::Sha384,
            iterations: DEFAULT_HASH_ITERATIONS,
            key_length: DEFAULT_HASH_KEY_LENGTH,
        }
    }
}

/// Per-client rate limiter settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSettings {
    /// Steady refill rate, tokens per second.
    pub rate_per_second: f64,
    /// Bucket capacity.
    pub burst: u32,
    /// How often the idle-client sweep runs.
    pub evaluation_interval: Duration,
    /// Clients idle longer than this are evicted.
    pub deletion_threshold: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            rate_per_second: DEFAULT_RATE_PER_SECOND,
            burst: DEFAULT_BURST,
            evaluation_interval: DEFAULT_EVALUATION_INTERVAL,
            deletion_threshold: DEFAULT_DELETION_THRESHOLD,
        }
    }
}

/// All core settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub signing: SigningSettings,
    pub hasher: HasherSettings,
    pub rate_limit: RateLimitSettings,
}

impl Settings {
    /// Read settings from the process environment.
    ///
    /// | Variable                          | Default      |
    /// |-----------------------------------|--------------|
    /// | `WARDEN_SIGNING_METHOD`           | required     |
    /// | `WARDEN_SIGN_SIZE`                | required unless `EdDSA` |
    /// | `WARDEN_ISSUER`                   | required     |
    /// | `WARDEN_ACCESS_TOKEN_DURATION`    | `5 minutes`  |
    /// | `WARDEN_REFRESH_TOKEN_DURATION`   | `24 hours`   |
    /// | `WARDEN_SECRET_KEY`               | required for `HMAC` |
    /// | `WARDEN_PRIVATE_KEY[_PATH]`       | required for asymmetric |
    /// | `WARDEN_PUBLIC_KEY[_PATH]`        | required for asymmetric |
    /// | `WARDEN_HASH_METHOD`              | `SHA384`     |
    /// | `WARDEN_HASH_ITERATIONS`          | `4096`       |
    /// | `WARDEN_HASH_KEY_LENGTH`          | `32`         |
    /// | `WARDEN_RATE_LIMIT`               | `2`          |
    /// | `WARDEN_BURST_LIMIT`              | `2`          |
    /// | `WARDEN_RATE_EVALUATION_INTERVAL` | `1 minute`   |
    /// | `WARDEN_RATE_DELETION_TIME`       | `3 minutes`  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup of fully-prefixed keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        Ok(Self {
            signing: signing_settings(&env)?,
            hasher: hasher_settings(&env)?,
            rate_limit: rate_limit_settings(&env)?,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed, non-empty value for `key`.
    fn get(&self, key: &'static str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn duration_or(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        match self.get(key) {
            Some(raw) => parse_duration(&raw).map_err(|reason| ConfigError::invalid(key, reason)),
            None => Ok(default),
        }
    }

    fn parsed_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string())),
            None => Ok(default),
        }
    }

    /// Inline PEM under `key`, else a file path under `{key}_PATH`.
    fn key_material(&self, key: &'static str, path_key: &'static str) -> Option<KeyMaterial> {
        self.get(key)
            .map(KeyMaterial::Inline)
            .or_else(|| self.get(path_key).map(|p| KeyMaterial::File(PathBuf::from(p))))
    }
}

fn signing_settings<F>(env: &Env<F>) -> Result<SigningSettings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let family: SigningFamily = env
        .require("SIGNING_METHOD")?
        .parse()
        .map_err(|e: String| ConfigError::invalid("SIGNING_METHOD", e))?;

    let size = match family {
        SigningFamily::EdDsa => None,
        _ => {
            let raw = env.require("SIGN_SIZE")?;
            match raw.as_str() {
                "256" | "384" | "512" => Some(raw.parse::<u16>().map_err(|e| {
                    ConfigError::invalid("SIGN_SIZE", e.to_string())
                })?),
                other => {
                    return Err(ConfigError::invalid(
                        "SIGN_SIZE",
                        format!("expected 256, 384 or 512, got {other:?}"),
                    ));
                }
            }
        }
    };

    let issuer = env.require("ISSUER")?;
    let access_token_ttl = env.duration_or("ACCESS_TOKEN_DURATION", DEFAULT_ACCESS_TOKEN_DURATION)?;
    let refresh_token_ttl =
        env.duration_or("REFRESH_TOKEN_DURATION", DEFAULT_REFRESH_TOKEN_DURATION)?;

    let (secret, private_key, public_key) = match family {
        SigningFamily::Hmac => (Some(env.require("SECRET_KEY")?), None, None),
        _ => {
            let private_key = env
                .key_material("PRIVATE_KEY", "PRIVATE_KEY_PATH")
                .ok_or(ConfigError::Missing("PRIVATE_KEY"))?;
            let public_key = env
                .key_material("PUBLIC_KEY", "PUBLIC_KEY_PATH")
                .ok_or(ConfigError::Missing("PUBLIC_KEY"))?;
            (None, Some(private_key), Some(public_key))
        }
    };

    Ok(SigningSettings {
        family,
        size,
        issuer,
        access_token_ttl,
        refresh_token_ttl,
        secret,
        private_key,
        public_key,
    })
}

fn hasher_settings<F>(env: &Env<F>) -> Result<HasherSettings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = HasherSettings::default();
    let primitive = match env.get("HASH_METHOD") {
        Some(raw) => raw
            .parse()
            .map_err(|e: String| ConfigError::invalid("HASH_METHOD", e))?,
        None => defaults.primitive,
    };

    let iterations: u32 = env.parsed_or("HASH_ITERATIONS", defaults.iterations)?;
    if iterations < MIN_HASH_ITERATIONS {
        return Err(ConfigError::invalid(
            "HASH_ITERATIONS",
            format!("must be at least {MIN_HASH_ITERATIONS}"),
        ));
    }

    let key_length: usize = env.parsed_or("HASH_KEY_LENGTH", defaults.key_length)?;
    if !HASH_KEY_LENGTH_RANGE.contains(&key_length) {
        return Err(ConfigError::invalid(
            "HASH_KEY_LENGTH",
            format!(
                "must be between {} and {} bytes",
                HASH_KEY_LENGTH_RANGE.start(),
                HASH_KEY_LENGTH_RANGE.end()
            ),
        ));
    }

    Ok(HasherSettings {
        primitive,
        iterations,
        key_length,
    })
}

fn rate_limit_settings<F>(env: &Env<F>) -> Result<RateLimitSettings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = RateLimitSettings::default();

    let rate_per_second: f64 = env.parsed_or("RATE_LIMIT", defaults.rate_per_second)?;
    if !rate_per_second.is_finite() || rate_per_second <= 0.0 {
        return Err(ConfigError::invalid("RATE_LIMIT", "must be a positive number"));
    }

    let burst: u32 = env.parsed_or("BURST_LIMIT", defaults.burst)?;
    if burst == 0 {
        return Err(ConfigError::invalid("BURST_LIMIT", "must be at least 1"));
    }

    let evaluation_interval =
        env.duration_or("RATE_EVALUATION_INTERVAL", defaults.evaluation_interval)?;
    let deletion_threshold = env.duration_or("RATE_DELETION_TIME", defaults.deletion_threshold)?;

    Ok(RateLimitSettings {
        rate_per_second,
        burst,
        evaluation_interval,
        deletion_threshold,
    })
}

/// Parse `"<n> <unit>"` where unit is second(s), minute(s) or hour(s).
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let mut parts = raw.split_whitespace();
    let (Some(amount), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected \"<number> <unit>\", got {raw:?}"));
    };

    let amount: u64 = amount
        .parse()
        .map_err(|_| format!("{amount:?} is not a whole number"))?;
    if amount == 0 {
        return Err("duration must be greater than zero".into());
    }

    let unit_secs = match unit.to_ascii_lowercase().as_str() {
        "second" | "seconds" => 1,
        "minute" | "minutes" => 60,
        "hour" | "hours" => 60 * 60,
        other => return Err(format!("unknown time unit {other:?}")),
    };

    amount
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| "duration overflows".into())
}
