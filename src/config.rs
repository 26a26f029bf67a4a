//! Configuration types.
//!
//! Everything is read from environment variables. Unset or unparsable values
//! fall back to defaults; `Config::validate` catches combinations that make
//! no sense and is treated as a fatal startup error.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Fallback system prompt when none is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an assistant managing direct messages for a business account. \
Be helpful, friendly, and concise. Respond only to the most recent message or group of messages. \
Avoid mentioning that you are an AI unless directly asked. Keep responses brief and conversational. \
If asked about services, products, or business inquiries, respond professionally and ask for details.";

/// Appended to the system prompt when a thread has never received a bot reply.
pub const FIRST_INTERACTION_NOTE: &str =
    "This is your first interaction with this user. Be welcoming and friendly.";

/// Key/value lookup: `std::env::var` in production, a map in tests.
pub trait Lookup {
    fn get(&self, key: &str) -> Option<String>;

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(default)
    }

    /// `1`/`0` style flags, also accepting `true`/`false`.
    fn flag_or(&self, key: &str, default: bool) -> bool {
        match self.get(key).as_deref().map(str::trim) {
            Some("1") | Some("true") => true,
            Some("0") | Some("false") => false,
            _ => default,
        }
    }
}

/// Reads from the process environment.
pub struct Env;

impl Lookup for Env {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl<S: std::hash::BuildHasher> Lookup for std::collections::HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<String> {
        std::collections::HashMap::get(self, key).cloned()
    }
}

/// Backoff bounds for one polling lane.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub minimum: Duration,
    pub maximum: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            minimum: Duration::from_secs(60),
            maximum: Duration::from_secs(480),
            multiplier: 1.5,
        }
    }
}

impl BackoffConfig {
    /// Lane config from `{PREFIX}_MIN_INTERVAL_SECS` / `{PREFIX}_MAX_INTERVAL_SECS`,
    /// falling back to `CHECK_INTERVAL` and 8x the minimum.
    fn from_lookup(env: &impl Lookup, prefix: &str) -> Self {
        let check_interval: u64 = env.parse_or("CHECK_INTERVAL", 60);
        let min_secs: u64 = env.parse_or(&format!("{prefix}_MIN_INTERVAL_SECS"), check_interval);
        let max_secs: u64 =
            env.parse_or(&format!("{prefix}_MAX_INTERVAL_SECS"), min_secs.saturating_mul(8));
        Self {
            minimum: Duration::from_secs(min_secs),
            maximum: Duration::from_secs(max_secs),
            multiplier: env.parse_or("BACKOFF_MULTIPLIER", 1.5),
        }
    }

    fn validate(&self, lane: &str) -> Result<(), ConfigError> {
        if self.minimum.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: format!("{lane} minimum interval"),
                message: "must be greater than zero".into(),
            });
        }
        if self.minimum > self.maximum {
            return Err(ConfigError::InvalidValue {
                key: format!("{lane} interval"),
                message: format!(
                    "minimum {:?} exceeds maximum {:?}",
                    self.minimum, self.maximum
                ),
            });
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(ConfigError::InvalidValue {
                key: "BACKOFF_MULTIPLIER".into(),
                message: format!("{} must be a finite number >= 1", self.multiplier),
            });
        }
        Ok(())
    }
}

/// Per-thread pipeline behaviour.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Combine consecutive customer messages into one completion input.
    pub combine_messages: bool,
    /// Maximum messages per combined batch.
    pub combine_limit: usize,
    /// Include prior conversation in completion requests.
    pub preserve_context: bool,
    /// Maximum prior messages included as context.
    pub context_limit: usize,
    /// Bound on every MessageSource / CompletionService call.
    pub call_timeout: Duration,
    /// How long a draft waits for operator action before auto-release.
    pub auto_release_after: Duration,
    /// Prepended to every generated reply.
    pub response_prefix: String,
    pub system_prompt: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            combine_messages: true,
            combine_limit: 5,
            preserve_context: true,
            context_limit: 10,
            call_timeout: Duration::from_secs(30),
            auto_release_after: Duration::ZERO,
            response_prefix: String::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl PipelineConfig {
    fn from_lookup(env: &impl Lookup) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let system_prompt = match env.get("SYSTEM_PROMPT_FILE") {
            Some(path) => std::fs::read_to_string(&path)?.trim().to_string(),
            None => env.get("SYSTEM_PROMPT").unwrap_or(defaults.system_prompt),
        };
        Ok(Self {
            combine_messages: env.flag_or("COMBINE_MESSAGES", defaults.combine_messages),
            combine_limit: env.parse_or("COMBINE_LIMIT", defaults.combine_limit),
            preserve_context: env.flag_or("PRESERVE_CONTEXT", defaults.preserve_context),
            context_limit: env.parse_or("CONTEXT_MESSAGE_LIMIT", defaults.context_limit),
            call_timeout: Duration::from_secs(env.parse_or("CALL_TIMEOUT_SECS", 30)),
            auto_release_after: Duration::from_secs(env.parse_or("AUTO_RELEASE_AFTER_SECS", 0)),
            response_prefix: env.get("RESPONSE_PREFIX").unwrap_or_default(),
            system_prompt,
        })
    }
}

/// Completion service credentials.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub api_key: SecretString,
    pub model: String,
}

/// Message source bridge location.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    pub token: Option<SecretString>,
}

/// Store locations. `dashboard_path = None` disables dashboard mirroring.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub operational_path: PathBuf,
    pub dashboard_path: Option<PathBuf>,
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub pending_lane: BackoffConfig,
    pub inbox_lane: BackoffConfig,
    pub pipeline: PipelineConfig,
    pub completion: CompletionConfig,
    pub source: SourceConfig,
    pub stores: StoreConfig,
    pub admin_port: u16,
    pub log_dir: PathBuf,
    pub debug: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&Env)
    }

    pub fn from_lookup(env: &impl Lookup) -> Result<Self, ConfigError> {
        let api_key = env
            .get("OPENAI_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("OPENAI_API_KEY".into()))?;
        let base_url = env
            .get("SOURCE_BASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("SOURCE_BASE_URL".into()))?;

        let dashboard_path = match env.get("DASHBOARD_DB_PATH") {
            Some(p) if p.trim().eq_ignore_ascii_case("none") => None,
            Some(p) => Some(PathBuf::from(p)),
            None => Some(PathBuf::from("./data/dashboard.db")),
        };

        let config = Self {
            pending_lane: BackoffConfig::from_lookup(env, "PENDING"),
            inbox_lane: BackoffConfig::from_lookup(env, "INBOX"),
            pipeline: PipelineConfig::from_lookup(env)?,
            completion: CompletionConfig {
                api_key: SecretString::from(api_key),
                model: env
                    .get("OPENAI_MODEL")
                    .unwrap_or_else(|| "gpt-4.1-nano".to_string()),
            },
            source: SourceConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                token: env.get("SOURCE_TOKEN").map(SecretString::from),
            },
            stores: StoreConfig {
                operational_path: env
                    .get("OPERATIONAL_DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/operational.db")),
                dashboard_path,
            },
            admin_port: env.parse_or("ADMIN_PORT", 8080),
            log_dir: env
                .get("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./logs")),
            debug: env.flag_or("DEBUG_MODE", false),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pending_lane.validate("pending")?;
        self.inbox_lane.validate("inbox")?;
        if self.pipeline.combine_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "COMBINE_LIMIT".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.pipeline.call_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "CALL_TIMEOUT_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.entry("OPENAI_API_KEY".into()).or_insert("sk-test".into());
        map.entry("SOURCE_BASE_URL".into())
            .or_insert("http://localhost:9000/".into());
        map
    }

    #[test]
    fn defaults_follow_check_interval() {
        let cfg = Config::from_lookup(&env(&[("CHECK_INTERVAL", "30")])).unwrap();
        assert_eq!(cfg.inbox_lane.minimum, Duration::from_secs(30));
        assert_eq!(cfg.inbox_lane.maximum, Duration::from_secs(240));
        assert_eq!(cfg.pending_lane.multiplier, 1.5);
        assert!(cfg.pipeline.combine_messages);
        assert_eq!(cfg.pipeline.combine_limit, 5);
        assert_eq!(cfg.pipeline.context_limit, 10);
        assert_eq!(cfg.source.base_url, "http://localhost:9000");
        assert!(cfg.stores.dashboard_path.is_some());
    }

    #[test]
    fn per_lane_overrides() {
        let cfg = Config::from_lookup(&env(&[
            ("PENDING_MIN_INTERVAL_SECS", "120"),
            ("INBOX_MAX_INTERVAL_SECS", "960"),
            ("BACKOFF_MULTIPLIER", "2"),
        ]))
        .unwrap();
        assert_eq!(cfg.pending_lane.minimum, Duration::from_secs(120));
        assert_eq!(cfg.pending_lane.maximum, Duration::from_secs(960));
        assert_eq!(cfg.inbox_lane.minimum, Duration::from_secs(60));
        assert_eq!(cfg.inbox_lane.maximum, Duration::from_secs(960));
        assert_eq!(cfg.inbox_lane.multiplier, 2.0);
    }

    #[test]
    fn flags_accept_numeric_and_words() {
        let cfg = Config::from_lookup(&env(&[
            ("COMBINE_MESSAGES", "0"),
            ("PRESERVE_CONTEXT", "false"),
            ("DEBUG_MODE", "1"),
        ]))
        .unwrap();
        assert!(!cfg.pipeline.combine_messages);
        assert!(!cfg.pipeline.preserve_context);
        assert!(cfg.debug);
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let map: HashMap<String, String> =
            [("SOURCE_BASE_URL".to_string(), "http://x".to_string())].into();
        let err = Config::from_lookup(&map).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(k) if k == "OPENAI_API_KEY"));
    }

    #[test]
    fn rejects_min_above_max() {
        let err = Config::from_lookup(&env(&[
            ("INBOX_MIN_INTERVAL_SECS", "100"),
            ("INBOX_MAX_INTERVAL_SECS", "50"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_shrinking_multiplier_and_zero_limit() {
        assert!(Config::from_lookup(&env(&[("BACKOFF_MULTIPLIER", "0.5")])).is_err());
        assert!(Config::from_lookup(&env(&[("COMBINE_LIMIT", "0")])).is_err());
    }

    #[test]
    fn dashboard_can_be_disabled() {
        let cfg = Config::from_lookup(&env(&[("DASHBOARD_DB_PATH", "none")])).unwrap();
        assert!(cfg.stores.dashboard_path.is_none());
    }

    #[test]
    fn system_prompt_from_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "  Be terse.\n").unwrap();
        let path = tmp.path().to_string_lossy().to_string();
        let cfg = Config::from_lookup(&env(&[("SYSTEM_PROMPT_FILE", &path)])).unwrap();
        assert_eq!(cfg.pipeline.system_prompt, "Be terse.");
    }
}
