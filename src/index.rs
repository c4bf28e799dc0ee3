use crate::error::{BoxError, CacheError};
use crate::node::Node;
use crate::CacheCore;
use ahash::RandomState;
use futures::future::BoxFuture;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Bound on every index lock acquisition.
pub(crate) const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// What a loader produced: a value, nothing, or a failure to propagate.
pub type LoadResult<T> = Result<Option<T>, BoxError>;

/// Caller-supplied asynchronous loader invoked on a cache miss.
pub type Loader<K, T> = Arc<dyn Fn(K) -> BoxFuture<'static, LoadResult<T>> + Send + Sync>;

pub(crate) type KeyExtractor<K, T> = Box<dyn Fn(&T) -> K + Send + Sync>;

/// Wrap an async closure as a [`Loader`].
///
/// ```no_run
/// let fetch = agecache::loader(|id: u64| async move {
///     Ok(Some(id.to_string()))
/// });
/// # let _: agecache::Loader<u64, String> = fetch;
/// ```
pub fn loader<K, T, F, Fut>(f: F) -> Loader<K, T>
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = LoadResult<T>> + Send + 'static,
{
    Arc::new(move |key| -> BoxFuture<'static, LoadResult<T>> { Box::pin(f(key)) })
}

type NodeMap<K, T> = HashMap<K, Weak<Node<T>>, RandomState>;

/// Object-safe view of an index, used by the façade and the maintenance
/// path where the key type is not known.
pub(crate) trait CacheIndex<T>: Send + Sync {
    /// Insert a node under the key extracted from its value. Returns true
    /// if the key was already present, the duplicate signal the façade uses
    /// for its total-count accounting.
    fn add_node(&self, node: &Arc<Node<T>>) -> Result<bool, CacheError>;
    fn find_node(&self, value: &T) -> Result<Option<Arc<Node<T>>>, CacheError>;
    fn clear(&self) -> Result<(), CacheError>;
    /// Drop the map and re-insert the given live nodes, collecting dead
    /// weak references. Returns the new physical size.
    fn rebuild(&self, live: &[Arc<Node<T>>]) -> Result<usize, CacheError>;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A named map from keys to weakly referenced cache nodes.
///
/// The map may hold entries whose node has been reclaimed; lookups treat
/// those as absent and rebuilds collect them, so the logical size is at
/// most the physical size.
pub struct Index<K, T> {
    name: String,
    map: RwLock<NodeMap<K, T>>,
    get_key: KeyExtractor<K, T>,
    loader: Option<Loader<K, T>>,
    core: Weak<CacheCore<T>>,
}

impl<K, T> Index<K, T>
where
    K: Eq + Hash + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub(crate) fn new(
        name: String,
        get_key: KeyExtractor<K, T>,
        loader: Option<Loader<K, T>>,
        core: Weak<CacheCore<T>>,
    ) -> Self {
        Self {
            name,
            map: RwLock::new(HashMap::with_hasher(RandomState::new())),
            get_key,
            loader,
            core,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical size of the map, counting dead weak references.
    pub fn len(&self) -> Result<usize, CacheError> {
        Ok(self.read_map()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.read_map()?.is_empty())
    }

    fn read_map(&self) -> Result<RwLockReadGuard<'_, NodeMap<K, T>>, CacheError> {
        match self.map.try_read_for(LOCK_TIMEOUT) {
            Some(guard) => Ok(guard),
            None => Err(self.lock_timed_out()),
        }
    }

    fn write_map(&self) -> Result<RwLockWriteGuard<'_, NodeMap<K, T>>, CacheError> {
        match self.map.try_write_for(LOCK_TIMEOUT) {
            Some(guard) => Ok(guard),
            None => Err(self.lock_timed_out()),
        }
    }

    fn lock_timed_out(&self) -> CacheError {
        if let Some(core) = self.core.upgrade() {
            core.metrics().lock_timeout.increment();
        }
        CacheError::LockTimeout(LOCK_TIMEOUT)
    }

    /// Look up the node for a key. Dead entries are left in place for the
    /// next rebuild to collect.
    pub(crate) fn get_node(&self, key: &K) -> Result<Option<Arc<Node<T>>>, CacheError> {
        let map = self.read_map()?;
        Ok(map.get(key).and_then(Weak::upgrade))
    }

    /// Fetch the value for a key, falling back to the effective loader.
    ///
    /// A hit touches the node, reattaching it to the current age bag even
    /// if eviction had already detached it. On a miss the per-call loader,
    /// else the index default, is awaited with no lock held; a loaded value
    /// is inserted through the cache and registered with every index.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(value))` on a hit or successful load
    /// - `Ok(None)` when absent and no loader produced a value
    /// - `Err(CacheError::Loader)` when the loader failed
    pub async fn get_item(
        &self,
        key: K,
        loader: Option<Loader<K, T>>,
    ) -> Result<Option<Arc<T>>, CacheError> {
        if let Some(node) = self.get_node(&key)? {
            if let Some(value) = node.value() {
                if let Some(core) = self.core.upgrade() {
                    core.lifespan().touch(core.as_ref(), &node);
                    core.metrics().index_hit.increment();
                }
                return Ok(Some(value));
            }
        }

        let Some(core) = self.core.upgrade() else {
            return Ok(None);
        };
        core.metrics().index_miss.increment();

        let Some(loader) = loader.or_else(|| self.loader.clone()) else {
            return Ok(None);
        };
        core.metrics().index_load.increment();
        let loaded = match loader(key).await {
            Ok(loaded) => loaded,
            Err(source) => {
                core.metrics().index_load_failed.increment();
                return Err(CacheError::Loader(source));
            }
        };
        let Some(value) = loaded else {
            return Ok(None);
        };

        let value = Arc::new(value);
        core.add_value(Arc::clone(&value))?;
        Ok(Some(value))
    }

    /// Drop the entry for a key and logically remove its item from the
    /// cache. Other indexes keep their entries until the node is swept or
    /// they are rebuilt.
    pub fn remove(&self, key: &K) -> Result<(), CacheError> {
        let node = {
            let mut map = self.write_map()?;
            map.remove(key).and_then(|weak| weak.upgrade())
        };
        if let Some(node) = node {
            if let Some(core) = self.core.upgrade() {
                core.lifespan().remove(core.as_ref(), &node);
            }
        }
        Ok(())
    }
}

impl<K, T> CacheIndex<T> for Index<K, T>
where
    K: Eq + Hash + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn add_node(&self, node: &Arc<Node<T>>) -> Result<bool, CacheError> {
        let Some(value) = node.value() else {
            return Ok(false);
        };
        let key = (self.get_key)(&value);
        let mut map = self.write_map()?;
        Ok(map.insert(key, Arc::downgrade(node)).is_some())
    }

    fn find_node(&self, value: &T) -> Result<Option<Arc<Node<T>>>, CacheError> {
        self.get_node(&(self.get_key)(value))
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.write_map()?.clear();
        Ok(())
    }

    fn rebuild(&self, live: &[Arc<Node<T>>]) -> Result<usize, CacheError> {
        let mut map = self.write_map()?;
        map.clear();
        for node in live {
            if let Some(value) = node.value() {
                map.insert((self.get_key)(&value), Arc::downgrade(node));
            }
        }
        Ok(map.len())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_index() -> Index<u32, u32> {
        Index::new(
            "by_value".to_string(),
            Box::new(|value: &u32| *value),
            None,
            Weak::new(),
        )
    }

    #[test]
    fn add_node_reports_duplicate_keys() {
        let index = detached_index();

        let first = Arc::new(Node::new(Arc::new(5)));
        let second = Arc::new(Node::new(Arc::new(5)));

        assert!(!index.add_node(&first).unwrap());
        assert!(index.add_node(&second).unwrap(), "same key twice");
        assert_eq!(index.len().unwrap(), 1);
    }

    #[test]
    fn dead_entries_read_as_absent_but_occupy_space() {
        let index = detached_index();

        let node = Arc::new(Node::new(Arc::new(9)));
        index.add_node(&node).unwrap();
        drop(node);

        assert!(index.get_node(&9).unwrap().is_none());
        assert_eq!(index.len().unwrap(), 1, "dead entry lingers until rebuild");
    }

    #[test]
    fn rebuild_collects_dead_references() {
        let index = detached_index();

        let dead = Arc::new(Node::new(Arc::new(1)));
        let live = Arc::new(Node::new(Arc::new(2)));
        index.add_node(&dead).unwrap();
        index.add_node(&live).unwrap();
        drop(dead);

        let size = index.rebuild(&[Arc::clone(&live)]).unwrap();

        assert_eq!(size, 1);
        assert!(index.get_node(&1).unwrap().is_none());
        assert!(index.get_node(&2).unwrap().is_some());
    }

    #[test]
    fn rebuild_skips_tombstoned_nodes() {
        let index = detached_index();

        let node = Arc::new(Node::new(Arc::new(3)));
        *node.value_mut() = None;

        assert_eq!(index.rebuild(&[node]).unwrap(), 0);
    }

    #[test]
    fn find_node_goes_through_the_key_extractor() {
        let index = detached_index();

        let node = Arc::new(Node::new(Arc::new(11)));
        index.add_node(&node).unwrap();

        let found = index.find_node(&11).unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &node));
    }
}
