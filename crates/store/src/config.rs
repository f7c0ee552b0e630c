//! Store configuration

use std::time::Duration;

/// Tunables for a store instance.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum number of metadata cache entries
    pub metadata_cache_capacity: usize,
    /// Metadata cache entries older than this are re-fetched
    pub metadata_cache_ttl: Duration,
    /// Page size subscriptions use while catching up
    pub subscription_page_size: u64,
    /// Whether subscriptions load payloads inline with each page
    pub subscription_prefetch: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            metadata_cache_capacity: 1000,
            metadata_cache_ttl: Duration::from_secs(60),
            subscription_page_size: 100,
            subscription_prefetch: true,
        }
    }
}
