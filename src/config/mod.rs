//! Configuration management module
//!
//! Provides centralized configuration including:
//! - Credentials and bot settings (`BotConfig`), resolved from the environment
//!   or `.config.env` files
//! - Log file paths
//! - Build information (version)
//!
//! Missing credentials are fatal: `BotConfig::load` returns an error and the
//! binary exits before connecting anywhere.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Directory name under `$HOME` for logs and the optional `.config.env`.
const APP_DIR: &str = ".gemini-relay";

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_PREFIX: &str = ".";
pub const DEFAULT_HISTORY_LIMIT: usize = 5;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Used when a channel has no override and `DEFAULT_SYSTEM_PROMPT` is unset.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Jarvis, a friendly and capable assistant living in a Discord server. \
Keep replies short and to the point, answer in the language you are addressed in, and use emojis sparingly.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set (environment or .config.env)")]
    Missing(&'static str),

    #[error("invalid value for {key} ({value:?}): {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Sampling parameters sent with every generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.95,
            top_k: 40,
            max_output_tokens: 8192,
        }
    }
}

/// Everything the bot needs at runtime. Built once in `main`, shared read-only.
#[derive(Clone)]
pub struct BotConfig {
    pub discord_token: String,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_api_base: String,
    pub port: u16,
    pub default_system_prompt: String,
    pub command_prefix: String,
    pub history_limit: usize,
    pub request_timeout: Duration,
    pub image_dir: PathBuf,
    /// Register slash commands on this guild only (instant) instead of globally.
    pub guild_id: Option<u64>,
    pub generation: GenerationSettings,
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("discord_token", &mask_secret(&self.discord_token))
            .field("gemini_api_key", &mask_secret(&self.gemini_api_key))
            .field("gemini_model", &self.gemini_model)
            .field("gemini_api_base", &self.gemini_api_base)
            .field("port", &self.port)
            .field("command_prefix", &self.command_prefix)
            .field("history_limit", &self.history_limit)
            .field("request_timeout", &self.request_timeout)
            .field("image_dir", &self.image_dir)
            .field("guild_id", &self.guild_id)
            .finish()
    }
}

impl BotConfig {
    /// Resolve every key from the process environment, then `./.config.env`,
    /// then `~/.gemini-relay/.config.env`.
    pub fn load() -> Result<Self, ConfigError> {
        let files: Vec<PathBuf> = config_env_candidates()
            .into_iter()
            .filter(|p| p.is_file())
            .collect();
        for f in &files {
            debug!("Config: using {}", f.display());
        }
        let config = Self::from_lookup(|key| {
            if let Ok(v) = std::env::var(key) {
                return Some(v);
            }
            files.iter().find_map(|p| value_from_config_env_file(p, key))
        })?;
        info!("Config: loaded {:?}", config);
        Ok(config)
    }

    /// Build a config from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let discord_token = get("DISCORD_BOT_TOKEN").ok_or(ConfigError::Missing("DISCORD_BOT_TOKEN"))?;
        let gemini_api_key = get("GEMINI_API_KEY").ok_or(ConfigError::Missing("GEMINI_API_KEY"))?;

        let port = match get("PORT") {
            Some(v) => v.parse::<u16>().map_err(|e| ConfigError::Invalid {
                key: "PORT",
                value: v.clone(),
                reason: e.to_string(),
            })?,
            None => DEFAULT_PORT,
        };

        let history_limit = match get("HISTORY_LIMIT") {
            Some(v) => match v.parse::<usize>() {
                Ok(0) => {
                    return Err(ConfigError::Invalid {
                        key: "HISTORY_LIMIT",
                        value: v,
                        reason: "must be at least 1".to_string(),
                    })
                }
                Ok(n) => n,
                Err(e) => {
                    return Err(ConfigError::Invalid {
                        key: "HISTORY_LIMIT",
                        value: v,
                        reason: e.to_string(),
                    })
                }
            },
            None => DEFAULT_HISTORY_LIMIT,
        };

        let timeout_secs = match get("REQUEST_TIMEOUT_SECS") {
            Some(v) => match v.parse::<u64>() {
                Ok(n) if n > 0 => n,
                Ok(_) => {
                    return Err(ConfigError::Invalid {
                        key: "REQUEST_TIMEOUT_SECS",
                        value: v,
                        reason: "must be at least 1".to_string(),
                    })
                }
                Err(e) => {
                    return Err(ConfigError::Invalid {
                        key: "REQUEST_TIMEOUT_SECS",
                        value: v,
                        reason: e.to_string(),
                    })
                }
            },
            None => DEFAULT_TIMEOUT_SECS,
        };

        let gemini_api_base = get("GEMINI_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        url::Url::parse(&gemini_api_base).map_err(|e| ConfigError::Invalid {
            key: "GEMINI_API_BASE",
            value: gemini_api_base.clone(),
            reason: e.to_string(),
        })?;

        let guild_id = match get("DISCORD_GUILD_ID") {
            Some(v) => Some(v.parse::<u64>().map_err(|e| ConfigError::Invalid {
                key: "DISCORD_GUILD_ID",
                value: v.clone(),
                reason: e.to_string(),
            })?),
            None => None,
        };

        Ok(Self {
            discord_token,
            gemini_api_key,
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            gemini_api_base: gemini_api_base.trim_end_matches('/').to_string(),
            port,
            default_system_prompt: get("DEFAULT_SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            command_prefix: get("COMMAND_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            history_limit,
            request_timeout: Duration::from_secs(timeout_secs),
            image_dir: get("IMAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_image_dir),
            guild_id,
            generation: GenerationSettings::default(),
        })
    }
}

/// Candidate `.config.env` files, in lookup order.
fn config_env_candidates() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        out.push(cwd.join(".config.env"));
    }
    if let Ok(home) = std::env::var("HOME") {
        out.push(Path::new(&home).join(APP_DIR).join(".config.env"));
    }
    out
}

/// Read `KEY=value` from a .config.env-style file. Comment lines and blank values are skipped.
fn value_from_config_env_file(path: &Path, key: &str) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    parse_config_env(&content, key)
}

fn parse_config_env(content: &str, key: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}

/// Mask a secret for logging (shows only first/last few characters).
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Path helpers and build information.
pub struct Config;

impl Config {
    /// Get the log file path
    ///
    /// Returns a path in the user's home directory: `$HOME/.gemini-relay/debug.log`
    /// Falls back to a temporary directory if HOME is not available.
    pub fn log_file_path() -> PathBuf {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(APP_DIR).join("debug.log");
        }
        std::env::temp_dir().join("gemini-relay-debug.log")
    }

    /// Ensure the log directory exists
    pub fn ensure_log_directory() -> std::io::Result<()> {
        let log_path = Self::log_file_path();
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Temporary directory for generated images awaiting upload.
    pub fn default_image_dir() -> PathBuf {
        std::env::temp_dir().join("gemini-relay-images")
    }

    /// Returns the package version from CARGO_PKG_VERSION.
    pub fn version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    const CREDS: [(&str, &str); 2] = [("DISCORD_BOT_TOKEN", "discord-token-123"), ("GEMINI_API_KEY", "gemini-key-456")];

    #[test]
    fn missing_discord_token_is_fatal() {
        let err = BotConfig::from_lookup(lookup_from(&[("GEMINI_API_KEY", "k")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DISCORD_BOT_TOKEN"));
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        let err = BotConfig::from_lookup(lookup_from(&[("DISCORD_BOT_TOKEN", "t"), ("GEMINI_API_KEY", "   ")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("GEMINI_API_KEY"));
    }

    #[test]
    fn defaults_applied() {
        let cfg = BotConfig::from_lookup(lookup_from(&CREDS)).unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.command_prefix, ".");
        assert_eq!(cfg.history_limit, 5);
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.gemini_model, DEFAULT_MODEL);
        assert_eq!(cfg.default_system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert!(cfg.guild_id.is_none());
    }

    #[test]
    fn overrides_parsed() {
        let mut pairs = CREDS.to_vec();
        pairs.extend([
            ("PORT", "8080"),
            ("HISTORY_LIMIT", "3"),
            ("GEMINI_API_BASE", "http://127.0.0.1:9999/v1beta/"),
            ("DISCORD_GUILD_ID", "42"),
        ]);
        let cfg = BotConfig::from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.history_limit, 3);
        assert_eq!(cfg.gemini_api_base, "http://127.0.0.1:9999/v1beta");
        assert_eq!(cfg.guild_id, Some(42));
    }

    #[test]
    fn invalid_port_rejected() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("PORT", "eighty"));
        let err = BotConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PORT", .. }));
    }

    #[test]
    fn zero_history_limit_rejected() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("HISTORY_LIMIT", "0"));
        assert!(BotConfig::from_lookup(lookup_from(&pairs)).is_err());
    }

    #[test]
    fn config_env_parsing() {
        let content = "# comment\nGEMINI_API_KEY = \"abc\"\nDISCORD_BOT_TOKEN=\nPORT=7000\n";
        assert_eq!(parse_config_env(content, "GEMINI_API_KEY").as_deref(), Some("abc"));
        assert_eq!(parse_config_env(content, "DISCORD_BOT_TOKEN"), None);
        assert_eq!(parse_config_env(content, "PORT").as_deref(), Some("7000"));
    }

    #[test]
    fn debug_output_masks_secrets() {
        let cfg = BotConfig::from_lookup(lookup_from(&CREDS)).unwrap();
        let dbg = format!("{:?}", cfg);
        assert!(!dbg.contains("discord-token-123"));
        assert!(dbg.contains("disc...-123"));
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("short"), "****");
        assert_eq!(mask_secret("verylongtoken12345"), "very...2345");
    }
}
