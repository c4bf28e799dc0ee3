use crate::bags::{BagRing, MAX_GENERATION, RING_SIZE, SLACK_BAGS, TIME_SLICES};
use crate::error::CacheError;
use crate::index::CacheIndex;
use crate::metrics::CacheMetrics;
use crate::node::{Node, UNMANAGED};
use clocksource::coarse::{AtomicInstant, Duration, Instant};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, warn};

/// Caller-supplied hook consulted during maintenance; returning false forces
/// a full clear. Checked at most once per time slice.
pub(crate) type Validator = Box<dyn Fn() -> bool + Send + Sync>;

/// Operations the lifespan manager needs from the cache that owns it.
///
/// The manager never holds the index registry lock itself; implementations
/// hand out a snapshot of the registered index handles instead.
pub(crate) trait CacheOps<T>: Send + Sync {
    fn metrics(&self) -> &CacheMetrics;
    fn index_handles(&self) -> Vec<Arc<dyn CacheIndex<T>>>;
}

/// State that only changes under the manager mutex.
pub(crate) struct SweepState {
    /// Oldest generation still holding a bag that has not been swept.
    oldest: i64,
}

/// Tracks item liveness across every index with a ring of age bags.
///
/// The manager owns the ring, the generation counters, and the single mutex
/// guarding generation transitions. Touches are cheap: they advance a node's
/// bag generation without relinking it, and the eventual sweep of the older
/// bag discovers the move and performs the physical catch-up.
pub(crate) struct LifespanManager<T> {
    ring: BagRing<T>,
    state: Mutex<SweepState>,

    /// Current generation. Written under the mutex, read lock-free on the
    /// touch path.
    current: AtomicI64,
    /// Items touched into the current bag since it was opened.
    current_size: AtomicUsize,
    /// Live, bag-attached nodes.
    pub(crate) cur_count: AtomicI64,
    /// Nodes handed to indexes, including duplicate insertions they
    /// observed. Diverges from `cur_count` as weak references die.
    pub(crate) total_count: AtomicI64,
    /// Deadline for the next maintenance sweep.
    next_valid_check: AtomicInstant,

    capacity: usize,
    min_age: Duration,
    max_age: Duration,
    time_slice: Duration,
    bag_item_limit: usize,
    validator: Option<Validator>,
}

const MAX_AGE_CEILING_SECS: u64 = 12 * 60 * 60;

impl<T: Send + Sync + 'static> LifespanManager<T> {
    pub(crate) fn new(
        capacity: usize,
        min_age: StdDuration,
        max_age: StdDuration,
        validator: Option<Validator>,
    ) -> Self {
        let max_age_secs = max_age.as_secs().min(MAX_AGE_CEILING_SECS) as u32;
        let min_age_secs = min_age.as_secs().min(max_age_secs as u64) as u32;

        let manager = Self {
            ring: BagRing::new(),
            state: Mutex::new(SweepState { oldest: 0 }),
            current: AtomicI64::new(0),
            current_size: AtomicUsize::new(0),
            cur_count: AtomicI64::new(0),
            total_count: AtomicI64::new(0),
            next_valid_check: AtomicInstant::now(),
            capacity,
            min_age: Duration::from_secs(min_age_secs),
            max_age: Duration::from_secs(max_age_secs),
            time_slice: Duration::from_secs(max_age_secs / TIME_SLICES),
            bag_item_limit: std::cmp::max(capacity / 20, 1),
            validator,
        };

        let now = Instant::now();
        if let Ok(bag) = manager.ring.get(0) {
            bag.open(now);
        }
        manager
            .next_valid_check
            .store(now + manager.time_slice, Ordering::Release);
        manager
    }

    /// Construct a node for a new value and link it into the current bag.
    /// The caller registers the returned node with every index.
    pub(crate) fn add(&self, cache: &impl CacheOps<T>, value: Arc<T>) -> Arc<Node<T>> {
        let node = Arc::new(Node::new(value));
        cache.metrics().node_create.increment();
        self.touch(cache, &node);
        node
    }

    /// Mark a node as used.
    ///
    /// An unattached node is linked to the head of the current bag's chain
    /// under the manager mutex, with a re-read of the generation inside the
    /// lock so concurrent touches attach it exactly once. Attached or not,
    /// the node's bag generation then advances to the current one without
    /// any relinking; the sweep of the older bag catches the chain up later.
    pub(crate) fn touch(&self, cache: &impl CacheOps<T>, node: &Arc<Node<T>>) {
        if node.bag_generation() == UNMANAGED {
            let _state = self.state.lock();
            if node.bag_generation() == UNMANAGED {
                let generation = self.current.load(Ordering::Acquire);
                if let Ok(bag) = self.ring.get(generation) {
                    bag.push_front(node);
                    node.set_bag_generation(generation);
                    self.cur_count.fetch_add(1, Ordering::AcqRel);
                    cache.metrics().node_attach.increment();
                    cache.metrics().nodes_resident.increment();
                }
            }
        }
        node.set_bag_generation(self.current.load(Ordering::Acquire));
        self.current_size.fetch_add(1, Ordering::AcqRel);
        self.check_valid(cache);
    }

    /// Logically remove a node. Physical unlink from its chain happens at
    /// the next sweep of whichever bag holds it.
    pub(crate) fn remove(&self, cache: &impl CacheOps<T>, node: &Node<T>) {
        let mut value = node.value_mut();
        if value.is_some() && node.bag_generation() != UNMANAGED {
            self.cur_count.fetch_sub(1, Ordering::AcqRel);
            cache.metrics().node_remove.increment();
            cache.metrics().nodes_resident.decrement();
        }
        *value = None;
        node.set_bag_generation(UNMANAGED);
    }

    /// Run maintenance if it is due and nobody else is already running it.
    ///
    /// Called on every touch, so this must never wait: the mutex is taken
    /// with a try-lock and contenders simply proceed with their stale view.
    /// The next touch will retry.
    pub(crate) fn check_valid(&self, cache: &impl CacheOps<T>) {
        if !self.maintenance_due(Instant::now()) {
            return;
        }
        let Some(mut state) = self.state.try_lock() else {
            cache.metrics().sweep_contended.increment();
            return;
        };
        let now = Instant::now();
        if !self.maintenance_due(now) {
            return;
        }
        let invalidated = self
            .validator
            .as_ref()
            .map(|valid| !valid())
            .unwrap_or(false);
        if self.current.load(Ordering::Acquire) > MAX_GENERATION || invalidated {
            self.clear_with_state(cache, &mut state);
        } else {
            self.clean_up(cache, &mut state, now);
        }
    }

    fn maintenance_due(&self, now: Instant) -> bool {
        self.current_size.load(Ordering::Acquire) > self.bag_item_limit
            || now > self.next_valid_check.load(Ordering::Acquire)
    }

    /// Sweep reclaimable bags, then open the next generation.
    ///
    /// Bags are consumed from the oldest end while the ring is nearly full,
    /// or the bag aged past `max_age`, or the cache is over capacity and the
    /// bag closed longer than `min_age` ago. Items accessed within `min_age`
    /// are never reclaimed for capacity reasons.
    pub(crate) fn clean_up(
        &self,
        cache: &impl CacheOps<T>,
        state: &mut SweepState,
        now: Instant,
    ) {
        let metrics = cache.metrics();
        metrics.sweep.increment();

        let current = self.current.load(Ordering::Acquire);
        let mut removal_budget = self.cur_count.load(Ordering::Acquire) - self.capacity as i64;
        let mut swept = 0u64;
        let mut evicted = 0u64;

        while state.oldest < current {
            let Ok(bag) = self.ring.get(state.oldest) else {
                break;
            };
            let ring_pressure = current - state.oldest > (RING_SIZE - SLACK_BAGS) as i64;
            let past_max_age = bag.start_time() + self.max_age < now;
            let min_age_protected = bag.stop_time() + self.min_age > now;
            let over_capacity = removal_budget > 0 && !min_age_protected;
            if !(ring_pressure || past_max_age || over_capacity) {
                break;
            }

            let mut cursor = bag.take_chain();
            while let Some(node) = cursor {
                cursor = node.take_next();
                let generation = node.bag_generation();
                if generation == UNMANAGED || !node.has_value() {
                    // Removed already; the chain held the last reference.
                    continue;
                }
                if generation == state.oldest {
                    // Not touched since this bag closed. Detach it; the
                    // node becomes reclaimable once indexes drop their weak
                    // references.
                    node.set_bag_generation(UNMANAGED);
                    self.cur_count.fetch_sub(1, Ordering::AcqRel);
                    removal_budget += 1;
                    evicted += 1;
                    metrics.node_evict.increment();
                    metrics.nodes_resident.decrement();
                } else if let Ok(newer) = self.ring.get(generation) {
                    // Touched into a newer bag since; catch the chain up.
                    newer.push_front(&node);
                    metrics.node_migrate.increment();
                }
            }

            state.oldest += 1;
            swept += 1;
            metrics.bags_swept.increment();
        }

        if swept > 0 {
            debug!(swept, evicted, oldest = state.oldest, "swept age bags");
        }

        self.open_next_bag(cache, now);
        self.check_index_valid(cache, state);
    }

    /// Close the current bag and open the next generation as current.
    fn open_next_bag(&self, cache: &impl CacheOps<T>, now: Instant) {
        let current = self.current.load(Ordering::Acquire);
        if let Ok(bag) = self.ring.get(current) {
            bag.close(now);
        }
        match self.ring.get(current + 1) {
            Ok(bag) => {
                bag.open(now);
                self.current.store(current + 1, Ordering::Release);
                self.current_size.store(0, Ordering::Release);
                self.next_valid_check
                    .store(now + self.time_slice, Ordering::Release);
                cache.metrics().bag_open.increment();
            }
            Err(err) => warn!(%err, "could not open the next age bag"),
        }
    }

    /// Rebuild every index once the accumulated dead-weak-reference overhead
    /// exceeds the configured capacity.
    fn check_index_valid(&self, cache: &impl CacheOps<T>, state: &SweepState) {
        let cur = self.cur_count.load(Ordering::Acquire);
        let total = self.total_count.load(Ordering::Acquire);
        if total - cur <= self.capacity as i64 {
            return;
        }
        let live = self.live_nodes(state);
        for index in cache.index_handles() {
            if let Err(err) = index.rebuild(&live) {
                warn!(%err, "index rebuild failed during maintenance");
            }
        }
        self.total_count.store(cur, Ordering::Release);
        cache.metrics().index_rebuild.increment();
        debug!(dropped = total - cur, "rebuilt indexes to collect dead references");
    }

    /// Weakly consistent snapshot of every node with a live value, newest
    /// generation first. Callers hold the manager mutex via `state`.
    fn live_nodes(&self, state: &SweepState) -> Vec<Arc<Node<T>>> {
        let mut live = Vec::new();
        let mut generation = self.current.load(Ordering::Acquire);
        while generation >= state.oldest {
            if let Ok(bag) = self.ring.get(generation) {
                let mut cursor = bag.first();
                while let Some(node) = cursor {
                    if bag.is_empty() {
                        // The bag was cleared out from under the walk.
                        break;
                    }
                    if node.has_value() {
                        live.push(Arc::clone(&node));
                    }
                    cursor = node.next();
                }
            }
            generation -= 1;
        }
        live
    }

    /// Populate a freshly registered index from the live enumeration.
    pub(crate) fn rebuild_index(&self, index: &dyn CacheIndex<T>) -> Result<usize, CacheError> {
        let state = self.state.lock();
        let live = self.live_nodes(&state);
        index.rebuild(&live)
    }

    /// Rebuild every registered index and reset the duplicate-tracking
    /// counter to the live count.
    pub(crate) fn rebuild_all(&self, cache: &impl CacheOps<T>) -> Result<(), CacheError> {
        let state = self.state.lock();
        let live = self.live_nodes(&state);
        for index in cache.index_handles() {
            index.rebuild(&live)?;
        }
        self.total_count
            .store(self.cur_count.load(Ordering::Acquire), Ordering::Release);
        cache.metrics().index_rebuild.increment();
        Ok(())
    }

    /// Detach everything and restart at generation 0.
    pub(crate) fn clear(&self, cache: &impl CacheOps<T>) {
        let mut state = self.state.lock();
        self.clear_with_state(cache, &mut state);
    }

    fn clear_with_state(&self, cache: &impl CacheOps<T>, state: &mut SweepState) {
        for index in cache.index_handles() {
            if let Err(err) = index.clear() {
                warn!(%err, "index clear failed");
            }
        }
        self.ring.empty();
        self.cur_count.store(0, Ordering::Release);
        self.total_count.store(0, Ordering::Release);
        cache.metrics().nodes_resident.set(0);

        state.oldest = 0;
        let now = Instant::now();
        if let Ok(bag) = self.ring.get(0) {
            bag.open(now);
        }
        self.current.store(0, Ordering::Release);
        self.current_size.store(0, Ordering::Release);
        self.next_valid_check
            .store(now + self.time_slice, Ordering::Release);

        cache.metrics().cache_clear.increment();
        debug!("cleared the cache");
    }

    pub(crate) fn live_count(&self) -> usize {
        self.cur_count.load(Ordering::Acquire).max(0) as usize
    }

    pub(crate) fn tracked_count(&self) -> usize {
        self.total_count.load(Ordering::Acquire).max(0) as usize
    }

    #[cfg(test)]
    pub(crate) fn current_generation(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    struct StubCache {
        metrics: CacheMetrics,
    }

    impl StubCache {
        fn new() -> Self {
            Self {
                metrics: CacheMetrics::new(),
            }
        }
    }

    impl CacheOps<u32> for StubCache {
        fn metrics(&self) -> &CacheMetrics {
            &self.metrics
        }
        fn index_handles(&self) -> Vec<Arc<dyn CacheIndex<u32>>> {
            Vec::new()
        }
    }

    fn manager(capacity: usize, min_age_secs: u64, max_age_secs: u64) -> LifespanManager<u32> {
        LifespanManager::new(
            capacity,
            StdDuration::from_secs(min_age_secs),
            StdDuration::from_secs(max_age_secs),
            None,
        )
    }

    fn sweep(mgr: &LifespanManager<u32>, cache: &StubCache) {
        let mut state = mgr.state.lock();
        mgr.clean_up(cache, &mut state, Instant::now());
    }

    #[test]
    fn touch_attaches_exactly_once() {
        let cache = StubCache::new();
        let mgr = manager(100, 0, 12 * 60 * 60);

        let node = mgr.add(&cache, Arc::new(7));
        assert_eq!(mgr.live_count(), 1);
        assert_ne!(node.bag_generation(), UNMANAGED);

        mgr.touch(&cache, &node);
        mgr.touch(&cache, &node);
        assert_eq!(mgr.live_count(), 1, "repeat touches must not recount");
        assert_eq!(cache.metrics.node_attach.value(), 1);
    }

    #[test]
    fn remove_tombstones_and_decrements() {
        let cache = StubCache::new();
        let mgr = manager(100, 0, 12 * 60 * 60);

        let node = mgr.add(&cache, Arc::new(1));
        mgr.remove(&cache, &node);

        assert_eq!(mgr.live_count(), 0);
        assert!(!node.has_value());
        assert_eq!(node.bag_generation(), UNMANAGED);

        // A second remove must not double-count.
        mgr.remove(&cache, &node);
        assert_eq!(mgr.live_count(), 0);
    }

    #[test]
    fn sweep_evicts_stale_and_relocates_migrated() {
        let cache = StubCache::new();
        let mgr = manager(1000, 0, 1);

        let stale = mgr.add(&cache, Arc::new(1));
        let fresh = mgr.add(&cache, Arc::new(2));

        // First sweep only opens a new generation; nothing is old enough yet.
        sweep(&mgr, &cache);
        assert!(mgr.current_generation() >= 1);
        assert_eq!(mgr.live_count(), 2);

        // Touch one node forward, then let the first bag age out.
        mgr.touch(&cache, &fresh);
        thread::sleep(StdDuration::from_secs(2));
        sweep(&mgr, &cache);

        assert_eq!(mgr.live_count(), 1);
        assert_eq!(stale.bag_generation(), UNMANAGED);
        assert!(stale.has_value(), "eviction detaches, it does not tombstone");

        // The migrated node was physically relocated to its recorded bag.
        let home = fresh.bag_generation();
        assert_ne!(home, UNMANAGED);
        let bag = mgr.ring.get(home).unwrap();
        let head = bag.first().expect("the recorded bag holds the migrated node");
        assert!(Arc::ptr_eq(&head, &fresh));
        assert_eq!(cache.metrics.node_evict.value(), 1);
        assert_eq!(cache.metrics.node_migrate.value(), 1);
    }

    #[test]
    fn detached_node_resurrects_on_touch() {
        let cache = StubCache::new();
        let mgr = manager(1000, 0, 1);

        let node = mgr.add(&cache, Arc::new(42));
        sweep(&mgr, &cache);
        thread::sleep(StdDuration::from_secs(2));
        sweep(&mgr, &cache);
        assert_eq!(node.bag_generation(), UNMANAGED);
        assert_eq!(mgr.live_count(), 0);

        // The strong handle kept the node alive; touching it reattaches it.
        mgr.touch(&cache, &node);
        assert_ne!(node.bag_generation(), UNMANAGED);
        assert_eq!(mgr.live_count(), 1);
    }

    #[test]
    fn min_age_blocks_capacity_eviction() {
        let cache = StubCache::new();
        let mgr = manager(1, 60, 12 * 60 * 60);

        for value in 0..3 {
            mgr.add(&cache, Arc::new(value));
        }
        assert_eq!(mgr.live_count(), 3);

        sweep(&mgr, &cache);
        sweep(&mgr, &cache);

        assert_eq!(
            mgr.live_count(),
            3,
            "items inside the minimum-age window survive capacity pressure"
        );
    }

    #[test]
    fn capacity_eviction_outside_min_age() {
        let cache = StubCache::new();
        let mgr = manager(1, 0, 12 * 60 * 60);

        // capacity 1 keeps the bag item limit at 1, so the adds themselves
        // run maintenance and the first two items end up in a closed bag.
        for value in 0..3 {
            mgr.add(&cache, Arc::new(value));
        }
        assert_eq!(mgr.live_count(), 3);

        sweep(&mgr, &cache);

        // The closed bag was over capacity and unprotected; the item in the
        // still-open bag stops the sweep.
        assert_eq!(mgr.live_count(), 1);
        assert_eq!(cache.metrics.node_evict.value(), 2);
    }

    #[test]
    fn failing_validator_forces_clear() {
        let cache = StubCache::new();
        let healthy = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&healthy);
        let mgr: LifespanManager<u32> = LifespanManager::new(
            20,
            StdDuration::from_secs(0),
            StdDuration::from_secs(12 * 60 * 60),
            Some(Box::new(move || flag.load(Ordering::Relaxed))),
        );

        let first = mgr.add(&cache, Arc::new(1));
        healthy.store(false, Ordering::Relaxed);

        // capacity 20 gives a bag item limit of 1, so the second add pushes
        // the current bag over it and trips maintenance.
        let second = mgr.add(&cache, Arc::new(2));

        assert_eq!(mgr.live_count(), 0);
        assert_eq!(first.bag_generation(), UNMANAGED);
        assert_eq!(second.bag_generation(), UNMANAGED);
        assert_eq!(cache.metrics.cache_clear.value(), 1);
    }

    #[test]
    fn clear_resets_generations_and_counts() {
        let cache = StubCache::new();
        let mgr = manager(100, 0, 1);

        mgr.add(&cache, Arc::new(1));
        sweep(&mgr, &cache);
        assert!(mgr.current_generation() >= 1);

        mgr.clear(&cache);

        assert_eq!(mgr.live_count(), 0);
        assert_eq!(mgr.tracked_count(), 0);
        assert_eq!(mgr.current_generation(), 0);
        assert_eq!(mgr.state.lock().oldest, 0);
    }
}
