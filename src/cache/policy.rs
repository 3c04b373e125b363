//! Cache TTL policy.

use std::collections::HashMap;
use std::time::Duration;

use crate::types::DataCategory;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL for categories missing from the table.
    pub default_ttl: Duration,
    /// Per-category TTLs.
    pub category_ttls: HashMap<DataCategory, Duration>,
    /// Whether [`CacheLayer::warm`](super::CacheLayer::warm) does anything.
    pub warming_enabled: bool,
    /// Minimum gap between full sweeps of expired entries.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let category_ttls = HashMap::from([
            (DataCategory::Live, Duration::from_secs(15)),
            (DataCategory::Schedule, Duration::from_secs(5 * 60)),
            (DataCategory::Season, Duration::from_secs(6 * 60 * 60)),
            (DataCategory::Team, Duration::from_secs(12 * 60 * 60)),
            (DataCategory::Player, Duration::from_secs(60 * 60)),
            (DataCategory::PlayerStats, Duration::from_secs(5 * 60)),
            (DataCategory::Projections, Duration::from_secs(30 * 60)),
            (DataCategory::Default, Duration::from_secs(10 * 60)),
        ]);

        Self {
            default_ttl: Duration::from_secs(10 * 60),
            category_ttls,
            warming_enabled: true,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with the default TTL table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fallback TTL.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the TTL for one category.
    pub fn category_ttl(mut self, category: DataCategory, ttl: Duration) -> Self {
        self.category_ttls.insert(category, ttl);
        self
    }

    /// Enables or disables cache warming.
    pub fn warming_enabled(mut self, enabled: bool) -> Self {
        self.warming_enabled = enabled;
        self
    }

    /// Sets the minimum gap between full sweeps.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Returns the TTL for a category.
    pub fn ttl_for(&self, category: DataCategory) -> Duration {
        self.category_ttls
            .get(&category)
            .copied()
            .unwrap_or(self.default_ttl)
    }
}
