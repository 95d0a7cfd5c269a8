//! Feature flag read path.

pub mod supabase;

use async_trait::async_trait;
use std::collections::HashMap;

pub use supabase::SupabaseFlags;

#[async_trait]
pub trait FeatureFlags: Send + Sync {
    /// Flag value, or `default` when the flag is unknown or unreadable.
    async fn is_enabled(&self, key: &str, default: bool) -> bool;
}

/// Flags from configuration only.
#[derive(Debug, Clone, Default)]
pub struct StaticFlags {
    overrides: HashMap<String, bool>,
}

impl StaticFlags {
    pub fn new(overrides: HashMap<String, bool>) -> Self {
        Self { overrides }
    }
}

#[async_trait]
impl FeatureFlags for StaticFlags {
    async fn is_enabled(&self, key: &str, default: bool) -> bool {
        self.overrides.get(key).copied().unwrap_or(default)
    }
}
