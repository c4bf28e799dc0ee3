mod bags;
mod error;
mod index;
mod lifespan;
mod node;

pub(crate) mod metrics;

pub use error::{BoxError, CacheError};
pub use index::{loader, Index, LoadResult, Loader};
pub use metrics::CacheMetrics;
pub use std::time::Duration;

use crate::index::CacheIndex;
use crate::lifespan::{CacheOps, LifespanManager, Validator};
use ahash::RandomState;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Cache internals shared by the façade and the index handles it creates.
pub(crate) struct CacheCore<T> {
    lifespan: LifespanManager<T>,
    indexes: RwLock<HashMap<String, Arc<dyn CacheIndex<T>>, RandomState>>,
    metrics: CacheMetrics,
}

impl<T: Send + Sync + 'static> CacheCore<T> {
    pub(crate) fn lifespan(&self) -> &LifespanManager<T> {
        &self.lifespan
    }

    pub(crate) fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Insert a value, reusing the node of an identical value that any
    /// index already maps. A genuinely new node is registered with every
    /// index; the total count only grows when none of them reported the
    /// key as a duplicate.
    pub(crate) fn add_value(&self, value: Arc<T>) -> Result<(), CacheError> {
        let indexes = self.index_handles();

        for index in &indexes {
            if let Some(node) = index.find_node(&value)? {
                let same = node
                    .value()
                    .map(|existing| Arc::ptr_eq(&existing, &value))
                    .unwrap_or(false);
                if same {
                    self.lifespan.touch(self, &node);
                    return Ok(());
                }
            }
        }

        let node = self.lifespan.add(self, value);
        let mut duplicate = false;
        for index in &indexes {
            duplicate |= index.add_node(&node)?;
        }
        if !duplicate {
            self.lifespan.total_count.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

impl<T: Send + Sync + 'static> CacheOps<T> for CacheCore<T> {
    fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    fn index_handles(&self) -> Vec<Arc<dyn CacheIndex<T>>> {
        // Snapshot and release: the registry lock is a leaf and is never
        // held across any other lock acquisition.
        self.indexes.read().values().cloned().collect()
    }
}

/// An in-process object cache for long-lived values of one type, accessed
/// through named indexes.
///
/// Items stay resident while they are being used and age out through a
/// ring of generational bags once they are not: roughly least-recently-used
/// eviction at a fraction of the bookkeeping cost of the exact ordering.
/// Indexes hold weak references, so a detached item may be resurrected by a
/// lookup that reaches it before its node is reclaimed.
///
/// Cloning the cache is cheap and every clone shares the same storage.
///
/// ```no_run
/// use agecache::{loader, Cache, Duration};
///
/// #[derive(Clone)]
/// struct User {
///     id: u64,
///     name: String,
/// }
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), agecache::CacheError> {
/// let cache: Cache<User> = Cache::<User>::builder()
///     .capacity(10_000)
///     .min_age(Duration::from_secs(60))
///     .max_age(Duration::from_secs(3600))
///     .build();
///
/// let by_id = cache.add_index(
///     "by_id",
///     |user: &User| user.id,
///     Some(loader(|id: u64| async move {
///         Ok(Some(User {
///             id,
///             name: format!("user-{id}"),
///         }))
///     })),
/// )?;
///
/// let user = by_id.get_item(42, None).await?.expect("loader always produces");
/// assert_eq!(user.id, 42);
/// # Ok(())
/// # }
/// ```
pub struct Cache<T> {
    core: Arc<CacheCore<T>>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

/// Builder for constructing a [`Cache`] with custom configuration
pub struct CacheBuilder {
    capacity: usize,
    min_age: Duration,
    max_age: Duration,
    validator: Option<Validator>,
}

impl CacheBuilder {
    pub fn new() -> Self {
        Self {
            capacity: 1024,
            min_age: Duration::from_secs(60),
            max_age: Duration::from_secs(12 * 60 * 60),
            validator: None,
        }
    }

    /// Target number of resident items. Eviction works the count back down
    /// to this; it is not a hard ceiling, since items younger than the
    /// minimum age are never evicted for capacity reasons.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// How long an item is protected from capacity eviction after its last
    /// use.
    pub fn min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    /// Age at which an item is evicted regardless of capacity. Clamped to
    /// 12 hours.
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Hook consulted during maintenance sweeps, at most once per time
    /// slice. Returning false clears the whole cache.
    pub fn validator(mut self, validator: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Build the cache with the configured settings
    pub fn build<T: Send + Sync + 'static>(self) -> Cache<T> {
        assert!(self.capacity > 0, "capacity must be positive");

        let core = Arc::new(CacheCore {
            lifespan: LifespanManager::new(
                self.capacity,
                self.min_age,
                self.max_age,
                self.validator,
            ),
            indexes: RwLock::new(HashMap::with_hasher(RandomState::new())),
            metrics: CacheMetrics::new(),
        });

        Cache { core }
    }
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Cache<T> {
    /// Create a cache with the given capacity and age bounds. For the
    /// validity hook, use [`Cache::builder`].
    pub fn new(capacity: usize, min_age: Duration, max_age: Duration) -> Self {
        CacheBuilder::new()
            .capacity(capacity)
            .min_age(min_age)
            .max_age(max_age)
            .build()
    }

    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }

    /// Register a named index and bring it up to date with the values
    /// already cached.
    ///
    /// # Parameters
    ///
    /// * `name` - Unique name the index is addressed by
    /// * `get_key` - Total, deterministic projection from a value to the
    ///   index key
    /// * `loader` - Default loader for misses through this index; each
    ///   lookup may still override it
    pub fn add_index<K>(
        &self,
        name: &str,
        get_key: impl Fn(&T) -> K + Send + Sync + 'static,
        loader: Option<Loader<K, T>>,
    ) -> Result<Arc<Index<K, T>>, CacheError>
    where
        K: Eq + Hash + Send + Sync + 'static,
    {
        let index = Arc::new(Index::new(
            name.to_string(),
            Box::new(get_key),
            loader,
            Arc::downgrade(&self.core),
        ));
        self.core.lifespan.rebuild_index(index.as_ref())?;
        self.core
            .indexes
            .write()
            .insert(name.to_string(), Arc::clone(&index) as Arc<dyn CacheIndex<T>>);
        Ok(index)
    }

    /// The handle registered under `name`, or `None` when the name is
    /// unknown or was registered with a different key type.
    pub fn get_index<K>(&self, name: &str) -> Option<Arc<Index<K, T>>>
    where
        K: Eq + Hash + Send + Sync + 'static,
    {
        let handle = self.indexes_read(name)?;
        handle.as_any().downcast::<Index<K, T>>().ok()
    }

    fn indexes_read(&self, name: &str) -> Option<Arc<dyn CacheIndex<T>>> {
        self.core.indexes.read().get(name).cloned()
    }

    /// Fetch a value through the named index, see [`Index::get_item`].
    pub async fn get<K>(
        &self,
        name: &str,
        key: K,
        loader: Option<Loader<K, T>>,
    ) -> Result<Option<Arc<T>>, CacheError>
    where
        K: Eq + Hash + Send + Sync + 'static,
    {
        let index = self
            .get_index::<K>(name)
            .ok_or_else(|| CacheError::UnknownIndex(name.to_string()))?;
        index.get_item(key, loader).await
    }

    /// Insert a value and register it with every index.
    ///
    /// Adding an `Arc` that some index already maps reuses the existing
    /// entry instead of creating a second one.
    pub fn add(&self, value: Arc<T>) -> Result<(), CacheError> {
        self.core.add_value(value)
    }

    /// Remove the item the named index maps `key` to.
    pub fn remove<K>(&self, name: &str, key: &K) -> Result<(), CacheError>
    where
        K: Eq + Hash + Send + Sync + 'static,
    {
        let index = self
            .get_index::<K>(name)
            .ok_or_else(|| CacheError::UnknownIndex(name.to_string()))?;
        index.remove(key)
    }

    /// Drop every index entry and every cached item.
    pub fn clear(&self) {
        self.core.lifespan.clear(self.core.as_ref());
    }

    /// Rebuild every index from the live enumeration, collecting dead weak
    /// references, and reconcile the total count with the live count.
    pub fn rebuild_indexes(&self) -> Result<(), CacheError> {
        self.core.lifespan.rebuild_all(self.core.as_ref())
    }

    /// Number of live, bag-attached items.
    pub fn live_count(&self) -> usize {
        self.core.lifespan.live_count()
    }

    /// Number of distinct insertions indexes still account for, including
    /// entries whose weak references have since died.
    pub fn total_count(&self) -> usize {
        self.core.lifespan.tracked_count()
    }

    /// Get a reference to the cache metrics
    pub fn metrics(&self) -> &CacheMetrics {
        &self.core.metrics
    }
}
