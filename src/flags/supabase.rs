use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::FeatureFlags;
use crate::config::SupabaseConfig;

#[derive(Debug, Deserialize)]
struct FlagRow {
    enabled: Option<bool>,
}

/// Time-bounded memo of flag values.
#[derive(Debug)]
pub struct FlagCache {
    ttl: Duration,
    entries: HashMap<String, (bool, Instant)>,
}

impl FlagCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str, now: Instant) -> Option<bool> {
        self.entries
            .get(key)
            .filter(|(_, stored)| now.duration_since(*stored) < self.ttl)
            .map(|(value, _)| *value)
    }

    pub fn put(&mut self, key: &str, value: bool, now: Instant) {
        self.entries.insert(key.to_string(), (value, now));
    }
}

/// Reads `enabled` from a PostgREST response. `None` when no row matched.
pub fn parse_flag_rows(body: &str, default: bool) -> Result<Option<bool>> {
    let rows: Vec<FlagRow> = serde_json::from_str(body).context("Failed to parse flag rows")?;
    Ok(rows.first().map(|row| row.enabled.unwrap_or(default)))
}

/// Flags stored in a Supabase table, cached in memory.
pub struct SupabaseFlags {
    client: reqwest::Client,
    table_url: String,
    service_key: String,
    overrides: HashMap<String, bool>,
    cache: Mutex<FlagCache>,
}

impl SupabaseFlags {
    pub fn new(
        config: &SupabaseConfig,
        cache_ttl: Duration,
        overrides: HashMap<String, bool>,
    ) -> Result<Self> {
        if config.url.is_empty() || config.service_role_key.is_empty() {
            anyhow::bail!("SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY are required for flags");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build flags HTTP client")?;

        Ok(Self {
            client,
            table_url: format!(
                "{}/rest/v1/{}",
                config.url.trim_end_matches('/'),
                config.feature_flags_table
            ),
            service_key: config.service_role_key.clone(),
            overrides,
            cache: Mutex::new(FlagCache::new(cache_ttl)),
        })
    }

    async fn fetch(&self, key: &str, default: bool) -> Result<Option<bool>> {
        let filter = format!("eq.{}", key);
        let response = self
            .client
            .get(&self.table_url)
            .query(&[("select", "enabled"), ("flag_key", filter.as_str())])
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .send()
            .await
            .context("Failed to query feature flags")?;

        let status = response.status();
        let body = response.text().await.context("Failed to read flags body")?;
        if !status.is_success() {
            anyhow::bail!("Feature flag query returned {}: {}", status, body);
        }

        parse_flag_rows(&body, default)
    }
}

#[async_trait]
impl FeatureFlags for SupabaseFlags {
    async fn is_enabled(&self, key: &str, default: bool) -> bool {
        if let Some(value) = self.overrides.get(key) {
            return *value;
        }

        if let Some(value) = self.cache.lock().await.get(key, Instant::now()) {
            debug!("Flag {} cache hit: {}", key, value);
            return value;
        }

        match self.fetch(key, default).await {
            Ok(Some(value)) => {
                info!("Flag {} fetched: {}", key, value);
                self.cache.lock().await.put(key, value, Instant::now());
                value
            }
            Ok(None) => {
                info!("Flag {} not found, using default={}", key, default);
                self.cache.lock().await.put(key, default, Instant::now());
                default
            }
            Err(e) => {
                error!("Error checking flag {}: {:#}, using default={}", key, e, default);
                default
            }
        }
    }
}
