use crate::global;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing PBX feed credentials (set BUFFALO_PBX_USERNAME and BUFFALO_PBX_PASSWORD)")]
    MissingCredentials,
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pbx: PbxConfig,
    pub provider: ProviderConfig,
    pub dispatch: DispatchConfig,
    pub supabase: SupabaseConfig,
    pub storage: StorageConfig,
    pub flags: FlagsConfig,
    pub cleanup: CleanupConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PbxConfig {
    pub wss_url: String,
    pub username: String,
    pub password: String,
    /// Extension the monitor itself registers as; calls to it are never spied on.
    pub own_extension: String,
    pub sip_host: String,
    pub sip_port: u16,
    /// Feature code dialled before the agent extension to join the call silently.
    pub spy_prefix: String,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub max_reconnect_delay_secs: u64,
}

impl Default for PbxConfig {
    fn default() -> Self {
        Self {
            wss_url: "wss://pbx.hovernetworks.net/spop".to_string(),
            username: String::new(),
            password: String::new(),
            own_extension: String::new(),
            sip_host: "142.93.69.92".to_string(),
            sip_port: 5060,
            spy_prefix: "*44".to_string(),
            ping_interval_secs: 30,
            ping_timeout_secs: 10,
            max_reconnect_delay_secs: 60,
        }
    }
}

impl PbxConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs.max(1))
    }

    pub fn own_extension(&self) -> Option<String> {
        let ext = self.own_extension.trim();
        (!ext.is_empty()).then(|| ext.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    /// Public base URL the provider calls back into (voice, status, recording webhooks).
    pub webhook_base_url: String,
    pub api_base_url: String,
    pub call_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            webhook_base_url: String::new(),
            api_base_url: "https://api.twilio.com/2010-04-01".to_string(),
            call_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub enabled: bool,
    pub project_id: String,
    pub region: String,
    pub queue_name: String,
    pub service_account_email: String,
    /// Base URL of this service as reachable by the queue.
    pub service_url: String,
    pub api_base_url: String,
    /// Static OAuth token for the queue API. Empty means use the metadata server.
    pub access_token: String,
    pub local_transcription_url: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            project_id: String::new(),
            region: String::new(),
            queue_name: "transcription-queue".to_string(),
            service_account_email: String::new(),
            service_url: "http://localhost:8080".to_string(),
            api_base_url: "https://cloudtasks.googleapis.com/v2".to_string(),
            access_token: String::new(),
            local_transcription_url: "http://localhost:8000/api/tasks/transcribe-audio"
                .to_string(),
        }
    }
}

impl DispatchConfig {
    pub fn is_complete(&self) -> bool {
        !self.project_id.is_empty() && !self.region.is_empty() && !self.queue_name.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_role_key: String,
    pub audio_bucket: String,
    pub feature_flags_table: String,
}

impl Default for SupabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            service_role_key: String::new(),
            audio_bucket: "audio-files".to_string(),
            feature_flags_table: "feature_flags".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    Supabase,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub local_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagSource {
    #[default]
    Static,
    Supabase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagsConfig {
    pub source: FlagSource,
    pub monitor_key: String,
    pub monitor_default: bool,
    pub poll_interval_secs: u64,
    pub cache_ttl_secs: u64,
    pub overrides: HashMap<String, bool>,
}

impl Default for FlagsConfig {
    fn default() -> Self {
        Self {
            source: FlagSource::Static,
            monitor_key: "pbx-monitor".to_string(),
            monitor_default: true,
            poll_interval_secs: 30,
            cache_ttl_secs: 60,
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_wait_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load the config file (writing defaults on first run), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
            info!("Loaded config from {:?}", config_path);
            config
        } else {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default();
            if let Err(e) = config.save() {
                warn!("Could not write default config: {}", e);
            }
            config
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Overlay values from the environment. `lookup` is injectable for tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |field: &mut String, name: &str| {
            if let Some(value) = lookup(name) {
                *field = value;
            }
        };

        text(&mut self.pbx.wss_url, "BUFFALO_PBX_WSS_URL");
        text(&mut self.pbx.username, "BUFFALO_PBX_USERNAME");
        text(&mut self.pbx.password, "BUFFALO_PBX_PASSWORD");
        text(&mut self.pbx.own_extension, "BUFFALO_SIP_USERNAME");
        text(&mut self.pbx.sip_host, "BUFFALO_SIP_HOST");
        text(&mut self.pbx.spy_prefix, "BUFFALO_SPY_PREFIX");

        text(&mut self.provider.account_sid, "TWILIO_ACCOUNT_SID");
        text(&mut self.provider.auth_token, "TWILIO_AUTH_TOKEN");
        text(&mut self.provider.from_number, "TWILIO_PHONE_NUMBER");
        text(&mut self.provider.webhook_base_url, "TWILIO_WEBHOOK_BASE_URL");

        text(&mut self.dispatch.project_id, "GCP_PROJECT_ID");
        text(&mut self.dispatch.region, "GCP_REGION");
        text(&mut self.dispatch.queue_name, "GCP_TASK_QUEUE_NAME");
        text(
            &mut self.dispatch.service_account_email,
            "CLOUD_TASKS_SERVICE_ACCOUNT_EMAIL",
        );
        text(&mut self.dispatch.service_url, "CLOUD_RUN_SERVICE_URL");
        text(&mut self.dispatch.access_token, "CLOUD_TASKS_ACCESS_TOKEN");

        text(&mut self.supabase.url, "SUPABASE_URL");
        text(&mut self.supabase.service_role_key, "SUPABASE_SERVICE_ROLE_KEY");
        text(&mut self.supabase.audio_bucket, "SUPABASE_AUDIO_BUCKET");
        text(
            &mut self.supabase.feature_flags_table,
            "SUPABASE_FEATURE_FLAGS_TABLE",
        );

        if let Some(raw) = lookup("BUFFALO_SIP_PORT") {
            self.pbx.sip_port = parse_number("BUFFALO_SIP_PORT", &raw)?;
        }
        if let Some(raw) = lookup("BUFFALO_PBX_PING_INTERVAL") {
            self.pbx.ping_interval_secs = parse_number("BUFFALO_PBX_PING_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("BUFFALO_PBX_PING_TIMEOUT") {
            self.pbx.ping_timeout_secs = parse_number("BUFFALO_PBX_PING_TIMEOUT", &raw)?;
        }
        if let Some(raw) = lookup("BUFFALO_PBX_MAX_RECONNECT_DELAY") {
            self.pbx.max_reconnect_delay_secs =
                parse_number("BUFFALO_PBX_MAX_RECONNECT_DELAY", &raw)?;
        }
        if let Some(raw) = lookup("RECORDING_POLL_INTERVAL") {
            self.cleanup.poll_interval_secs = parse_number("RECORDING_POLL_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("RECORDING_MAX_WAIT") {
            self.cleanup.max_wait_secs = parse_number("RECORDING_MAX_WAIT", &raw)?;
        }
        if let Some(raw) = lookup("PORT") {
            self.server.port = parse_number("PORT", &raw)?;
        }
        if let Some(raw) = lookup("CLOUD_TASKS_ENABLED") {
            self.dispatch.enabled = parse_bool(&raw);
        }
        if let Some(raw) = lookup("PBX_MONITOR_ENABLED") {
            let key = self.flags.monitor_key.clone();
            self.flags.overrides.insert(key, parse_bool(&raw));
        }

        Ok(())
    }

    /// Checks required before the connection manager may start.
    pub fn validate_monitor(&self) -> Result<(), ConfigError> {
        if self.pbx.username.is_empty() || self.pbx.password.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        if self.pbx.wss_url.is_empty() {
            return Err(ConfigError::Invalid {
                field: "pbx.wss_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.cleanup.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "cleanup.poll_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database.path {
            Some(path) => Ok(path.clone()),
            None => global::db_file(),
        }
    }

    fn config_path() -> Result<PathBuf> {
        global::config_file()
    }
}

fn parse_number<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
        field,
        reason: format!("expected a number, got {:?}", raw),
    })
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
