use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonically increasing counter
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Gauge that can increase or decrease
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-cache metrics for observability and testing
///
/// Each cache instance carries its own set, so multiple caches in one
/// process report independently and tests can assert exact values.
pub struct CacheMetrics {
    // Node lifecycle
    pub node_create: Counter,
    pub node_attach: Counter,
    pub node_migrate: Counter,
    pub node_evict: Counter,
    pub node_remove: Counter,

    // Index operations
    pub index_hit: Counter,
    pub index_miss: Counter,
    pub index_load: Counter,
    pub index_load_failed: Counter,
    pub index_rebuild: Counter,
    pub lock_timeout: Counter,

    // Lifespan maintenance
    pub bag_open: Counter,
    pub bags_swept: Counter,
    pub sweep: Counter,
    pub sweep_contended: Counter,
    pub cache_clear: Counter,

    // Current state
    pub nodes_resident: Gauge,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            node_create: Counter::new(),
            node_attach: Counter::new(),
            node_migrate: Counter::new(),
            node_evict: Counter::new(),
            node_remove: Counter::new(),
            index_hit: Counter::new(),
            index_miss: Counter::new(),
            index_load: Counter::new(),
            index_load_failed: Counter::new(),
            index_rebuild: Counter::new(),
            lock_timeout: Counter::new(),
            bag_open: Counter::new(),
            bags_swept: Counter::new(),
            sweep: Counter::new(),
            sweep_contended: Counter::new(),
            cache_clear: Counter::new(),
            nodes_resident: Gauge::new(),
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}
