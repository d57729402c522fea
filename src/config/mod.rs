//! Configuration loading for the integration hub.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `HUB_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "HUB_";
const REDACTED: &str = "[REDACTED]";

/// Application configuration derived from `HUB_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    /// Hex-encoded 256-bit key used by the token cipher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    #[serde(default = "default_oauth_state_ttl_seconds")]
    pub oauth_state_ttl_seconds: u64,
    /// Public base URL providers redirect back to (`{base}/oauth/callback/{provider}`).
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    /// Client-side page the OAuth callback redirects to once the flow completes.
    #[serde(default = "default_client_completion_url")]
    pub client_completion_url: String,
    /// `redis://` connection string; unset selects the in-process cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_url: Option<String>,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_provider_http_timeout_seconds")]
    pub provider_http_timeout_seconds: u64,
    #[serde(default = "default_idempotency_ttl_seconds")]
    pub idempotency_ttl_seconds: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, ProviderCredentials>,
    #[serde(default)]
    pub token_refresh: TokenRefreshConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// OAuth client registration for a single provider.
///
/// Environment variables: `HUB_PROVIDER_{SLUG}_CLIENT_ID`, `HUB_PROVIDER_{SLUG}_CLIENT_SECRET`,
/// and the optional `HUB_PROVIDER_{SLUG}_OAUTH_BASE` / `HUB_PROVIDER_{SLUG}_API_BASE` overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ProviderCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

impl ProviderCredentials {
    /// Both halves of the client registration are present.
    pub fn is_complete(&self) -> bool {
        self.client_id.as_deref().is_some_and(|v| !v.is_empty())
            && self.client_secret.as_deref().is_some_and(|v| !v.is_empty())
    }
}

/// Token refresh sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TokenRefreshConfig {
    /// How often the proactive refresh sweep runs (default: 900).
    ///
    /// Environment variable: `HUB_TOKEN_REFRESH_INTERVAL_SECONDS`
    #[serde(default = "default_token_refresh_interval_seconds")]
    pub interval_seconds: u64,
    /// Tokens expiring within this window are refreshed (default: 1800).
    ///
    /// Environment variable: `HUB_TOKEN_REFRESH_LOOKAHEAD_SECONDS`
    #[serde(default = "default_token_refresh_lookahead_seconds")]
    pub lookahead_seconds: u64,
    /// How often already-expired connections are demoted (default: 300).
    ///
    /// Environment variable: `HUB_TOKEN_EXPIRY_SWEEP_SECONDS`
    #[serde(default = "default_token_expiry_sweep_seconds")]
    pub expiry_sweep_seconds: u64,
}

/// Health and sync sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    /// Environment variable: `HUB_SYNC_INTERVAL_SECONDS`
    #[serde(default = "default_sync_interval_seconds")]
    pub sync_interval_seconds: u64,
    /// Sync interval assigned to new connections.
    ///
    /// Environment variable: `HUB_SYNC_DEFAULT_CONNECTION_INTERVAL_MINUTES`
    #[serde(default = "default_sync_default_connection_interval_minutes")]
    pub default_connection_interval_minutes: i32,
    /// Environment variable: `HUB_HEALTH_INTERVAL_SECONDS`
    #[serde(default = "default_health_interval_seconds")]
    pub health_interval_seconds: u64,
    /// Continuous time in ERROR before the critical notification fires.
    ///
    /// Environment variable: `HUB_HEALTH_CRITICAL_THRESHOLD_SECONDS`
    #[serde(default = "default_health_critical_threshold_seconds")]
    pub health_critical_threshold_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            encryption_key: None,
            oauth_state_ttl_seconds: default_oauth_state_ttl_seconds(),
            callback_base_url: default_callback_base_url(),
            client_completion_url: default_client_completion_url(),
            cache_url: None,
            cache_max_entries: default_cache_max_entries(),
            provider_http_timeout_seconds: default_provider_http_timeout_seconds(),
            idempotency_ttl_seconds: default_idempotency_ttl_seconds(),
            providers: BTreeMap::new(),
            token_refresh: TokenRefreshConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for TokenRefreshConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_token_refresh_interval_seconds(),
            lookahead_seconds: default_token_refresh_lookahead_seconds(),
            expiry_sweep_seconds: default_token_expiry_sweep_seconds(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval_seconds: default_sync_interval_seconds(),
            default_connection_interval_minutes: default_sync_default_connection_interval_minutes(),
            health_interval_seconds: default_health_interval_seconds(),
            health_critical_threshold_seconds: default_health_critical_threshold_seconds(),
        }
    }
}

impl TokenRefreshConfig {
    /// Validate token refresh configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_seconds < 10 {
            return Err(ConfigError::InvalidInterval {
                field: "token refresh interval",
                value: self.interval_seconds,
            });
        }
        if self.expiry_sweep_seconds < 10 {
            return Err(ConfigError::InvalidInterval {
                field: "token expiry sweep interval",
                value: self.expiry_sweep_seconds,
            });
        }
        if self.lookahead_seconds == 0 || self.lookahead_seconds > 86_400 {
            return Err(ConfigError::InvalidRefreshLookahead {
                value: self.lookahead_seconds,
            });
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_seconds)
    }

    pub fn lookahead(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lookahead_seconds as i64)
    }
}

impl SchedulerConfig {
    /// Validate health and sync sweep bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_interval_seconds < 10 {
            return Err(ConfigError::InvalidInterval {
                field: "sync interval",
                value: self.sync_interval_seconds,
            });
        }
        if self.health_interval_seconds < 10 {
            return Err(ConfigError::InvalidInterval {
                field: "health interval",
                value: self.health_interval_seconds,
            });
        }
        if self.default_connection_interval_minutes < 1 {
            return Err(ConfigError::InvalidConnectionSyncInterval {
                value: self.default_connection_interval_minutes,
            });
        }
        Ok(())
    }

    pub fn critical_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.health_critical_threshold_seconds as i64)
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Decodes the hex encryption key into raw bytes.
    pub fn encryption_key_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        let key = self
            .encryption_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingEncryptionKey)?;
        let bytes = hex::decode(key.trim()).map_err(|e| ConfigError::InvalidEncryptionKeyHex {
            error: e.to_string(),
        })?;
        if bytes.len() != 32 {
            return Err(ConfigError::InvalidEncryptionKeyLength {
                length: bytes.len(),
            });
        }
        Ok(bytes)
    }

    pub fn oauth_state_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.oauth_state_ttl_seconds as i64)
    }

    pub fn provider_http_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_http_timeout_seconds)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_seconds)
    }

    /// Redirect URI registered with providers for the given slug.
    pub fn redirect_uri_for(&self, provider: &str) -> String {
        format!(
            "{}/oauth/callback/{}",
            self.callback_base_url.trim_end_matches('/'),
            provider
        )
    }

    pub fn provider(&self, slug: &str) -> Option<&ProviderCredentials> {
        self.providers.get(slug)
    }

    /// Whether the profile permits developer conveniences such as the sandbox connector.
    pub fn is_development_profile(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec![REDACTED.to_string()];
        }
        if config.encryption_key.is_some() {
            config.encryption_key = Some(REDACTED.to_string());
        }
        if config.cache_url.is_some() {
            config.cache_url = Some(REDACTED.to_string());
        }
        if config.database_url.contains('@') {
            config.database_url = REDACTED.to_string();
        }
        for credentials in config.providers.values_mut() {
            if credentials.client_secret.is_some() {
                credentials.client_secret = Some(REDACTED.to_string());
            }
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.encryption_key_bytes()?;

        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        if self.oauth_state_ttl_seconds == 0 {
            return Err(ConfigError::InvalidOAuthStateTtl {
                value: self.oauth_state_ttl_seconds,
            });
        }

        if self.provider_http_timeout_seconds == 0 {
            return Err(ConfigError::InvalidInterval {
                field: "provider http timeout",
                value: self.provider_http_timeout_seconds,
            });
        }

        for (field, value) in [
            ("HUB_CALLBACK_BASE_URL", &self.callback_base_url),
            ("HUB_CLIENT_COMPLETION_URL", &self.client_completion_url),
        ] {
            url::Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
                field,
                value: value.clone(),
                error: e.to_string(),
            })?;
        }

        for (slug, credentials) in &self.providers {
            if credentials.client_id.is_some() != credentials.client_secret.is_some() {
                return Err(ConfigError::IncompleteProviderCredentials {
                    provider: slug.clone(),
                });
            }
        }

        self.token_refresh.validate()?;
        self.scheduler.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://integration-hub.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_oauth_state_ttl_seconds() -> u64 {
    300 // 5 minutes
}

fn default_callback_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_client_completion_url() -> String {
    "http://localhost:3000/integrations/complete".to_string()
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_provider_http_timeout_seconds() -> u64 {
    15
}

fn default_idempotency_ttl_seconds() -> u64 {
    86_400 // 24 hours
}

fn default_token_refresh_interval_seconds() -> u64 {
    900 // 15 minutes
}

fn default_token_refresh_lookahead_seconds() -> u64 {
    1800 // 30 minutes
}

fn default_token_expiry_sweep_seconds() -> u64 {
    300 // 5 minutes
}

fn default_sync_interval_seconds() -> u64 {
    3600 // hourly
}

fn default_sync_default_connection_interval_minutes() -> i32 {
    60
}

fn default_health_interval_seconds() -> u64 {
    21_600 // 6 hours
}

fn default_health_critical_threshold_seconds() -> u64 {
    86_400 // 24 hours
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("no operator tokens configured; set HUB_OPERATOR_TOKEN or HUB_OPERATOR_TOKENS")]
    MissingOperatorTokens,
    #[error("encryption key is missing; set HUB_ENCRYPTION_KEY environment variable")]
    MissingEncryptionKey,
    #[error("encryption key is not valid hex: {error}")]
    InvalidEncryptionKeyHex { error: String },
    #[error("encryption key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidEncryptionKeyLength { length: usize },
    #[error("oauth state ttl must be positive, got {value}")]
    InvalidOAuthStateTtl { value: u64 },
    #[error("{field} must be at least 10 seconds, got {value}")]
    InvalidInterval { field: &'static str, value: u64 },
    #[error("token refresh lookahead must be between 1 and 86400 seconds, got {value}")]
    InvalidRefreshLookahead { value: u64 },
    #[error("default connection sync interval must be at least 1 minute, got {value}")]
    InvalidConnectionSyncInterval { value: i32 },
    #[error("{field} is not a valid URL '{value}': {error}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        error: String,
    },
    #[error("provider {provider} needs both CLIENT_ID and CLIENT_SECRET")]
    IncompleteProviderCredentials { provider: String },
}

/// Loads configuration using layered `.env` files and `HUB_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration; the process environment wins over files.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let config = Self::from_layered(&mut layered, profile_hint);
        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn from_layered(layered: &mut BTreeMap<String, String>, profile_hint: String) -> AppConfig {
        let profile = take_string(layered, "PROFILE").unwrap_or(profile_hint);

        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            split_list(&tokens)
        } else if let Some(token) = take_string(layered, "OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };

        let token_refresh = TokenRefreshConfig {
            interval_seconds: take_parsed(layered, "TOKEN_REFRESH_INTERVAL_SECONDS")
                .unwrap_or_else(default_token_refresh_interval_seconds),
            lookahead_seconds: take_parsed(layered, "TOKEN_REFRESH_LOOKAHEAD_SECONDS")
                .unwrap_or_else(default_token_refresh_lookahead_seconds),
            expiry_sweep_seconds: take_parsed(layered, "TOKEN_EXPIRY_SWEEP_SECONDS")
                .unwrap_or_else(default_token_expiry_sweep_seconds),
        };

        let scheduler = SchedulerConfig {
            sync_interval_seconds: take_parsed(layered, "SYNC_INTERVAL_SECONDS")
                .unwrap_or_else(default_sync_interval_seconds),
            default_connection_interval_minutes: take_parsed(
                layered,
                "SYNC_DEFAULT_CONNECTION_INTERVAL_MINUTES",
            )
            .unwrap_or_else(default_sync_default_connection_interval_minutes),
            health_interval_seconds: take_parsed(layered, "HEALTH_INTERVAL_SECONDS")
                .unwrap_or_else(default_health_interval_seconds),
            health_critical_threshold_seconds: take_parsed(
                layered,
                "HEALTH_CRITICAL_THRESHOLD_SECONDS",
            )
            .unwrap_or_else(default_health_critical_threshold_seconds),
        };

        AppConfig {
            profile,
            api_bind_addr: take_string(layered, "API_BIND_ADDR")
                .unwrap_or_else(default_api_bind_addr),
            log_level: take_string(layered, "LOG_LEVEL").unwrap_or_else(default_log_level),
            log_format: take_string(layered, "LOG_FORMAT").unwrap_or_else(default_log_format),
            database_url: take_string(layered, "DATABASE_URL")
                .unwrap_or_else(default_database_url),
            db_max_connections: take_parsed(layered, "DB_MAX_CONNECTIONS")
                .unwrap_or_else(default_db_max_connections),
            db_acquire_timeout_ms: take_parsed(layered, "DB_ACQUIRE_TIMEOUT_MS")
                .unwrap_or_else(default_db_acquire_timeout_ms),
            operator_tokens,
            encryption_key: take_string(layered, "ENCRYPTION_KEY"),
            oauth_state_ttl_seconds: take_parsed(layered, "OAUTH_STATE_TTL_SECONDS")
                .unwrap_or_else(default_oauth_state_ttl_seconds),
            callback_base_url: take_string(layered, "CALLBACK_BASE_URL")
                .unwrap_or_else(default_callback_base_url),
            client_completion_url: take_string(layered, "CLIENT_COMPLETION_URL")
                .unwrap_or_else(default_client_completion_url),
            cache_url: take_string(layered, "CACHE_URL"),
            cache_max_entries: take_parsed(layered, "CACHE_MAX_ENTRIES")
                .unwrap_or_else(default_cache_max_entries),
            provider_http_timeout_seconds: take_parsed(layered, "PROVIDER_HTTP_TIMEOUT_SECONDS")
                .unwrap_or_else(default_provider_http_timeout_seconds),
            idempotency_ttl_seconds: take_parsed(layered, "IDEMPOTENCY_TTL_SECONDS")
                .unwrap_or_else(default_idempotency_ttl_seconds),
            providers: collect_provider_credentials(layered),
            token_refresh,
            scheduler,
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn take_parsed<T: std::str::FromStr>(layered: &mut BTreeMap<String, String>, key: &str) -> Option<T> {
    layered.remove(key).and_then(|v| v.trim().parse().ok())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Collects `PROVIDER_{SLUG}_{SETTING}` keys; slugs are lowercased.
fn collect_provider_credentials(
    layered: &mut BTreeMap<String, String>,
) -> BTreeMap<String, ProviderCredentials> {
    const SETTINGS: [&str; 4] = ["_CLIENT_ID", "_CLIENT_SECRET", "_OAUTH_BASE", "_API_BASE"];

    let mut providers: BTreeMap<String, ProviderCredentials> = BTreeMap::new();
    let keys: Vec<String> = layered
        .keys()
        .filter(|k| k.starts_with("PROVIDER_"))
        .cloned()
        .collect();

    for key in keys {
        let Some(rest) = key.strip_prefix("PROVIDER_") else {
            continue;
        };
        let Some(setting) = SETTINGS.iter().find(|s| rest.ends_with(*s)) else {
            continue;
        };
        let slug = rest[..rest.len() - setting.len()].to_lowercase();
        if slug.is_empty() {
            continue;
        }
        let Some(value) = take_string(layered, &key) else {
            continue;
        };

        let entry = providers.entry(slug).or_default();
        match *setting {
            "_CLIENT_ID" => entry.client_id = Some(value),
            "_CLIENT_SECRET" => entry.client_secret = Some(value),
            "_OAUTH_BASE" => entry.oauth_base = Some(value),
            "_API_BASE" => entry.api_base = Some(value),
            _ => {}
        }
    }

    providers
}
