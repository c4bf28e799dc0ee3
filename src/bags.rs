use crate::error::CacheError;
use crate::node::{Node, UNMANAGED};
use clocksource::coarse::{AtomicInstant, Instant};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;

// Ring sizing: one bag per time slice across the full maximum age, plus
// headroom for the bag-item-limit overflow path, plus unconditional slack so
// enumeration never crosses a bag that is being swept.
pub(crate) const TIME_SLICES: u32 = 240;
pub(crate) const OVERFLOW_BAGS: usize = 20;
pub(crate) const SLACK_BAGS: usize = 5;
pub(crate) const RING_SIZE: usize = TIME_SLICES as usize + OVERFLOW_BAGS + SLACK_BAGS;

/// Generation at which the maintenance path resets the whole cache instead
/// of sweeping, keeping the counter far away from the ring's hard ceiling.
pub(crate) const MAX_GENERATION: i64 = 1_000_000;

const GENERATION_CEILING: i64 = 2 * MAX_GENERATION;

/// A generation bucket: a singly-linked chain of nodes touched during one
/// time slice, with the slice's open and close timestamps.
pub(crate) struct AgeBag<T> {
    start: AtomicInstant,
    stop: AtomicInstant,
    first: Mutex<Option<Arc<Node<T>>>>,
}

impl<T> AgeBag<T> {
    fn new() -> Self {
        Self {
            start: AtomicInstant::now(),
            stop: AtomicInstant::now(),
            first: Mutex::new(None),
        }
    }

    /// Reopen this bag as the current one: stamp the start time and drop any
    /// chain left over from the slot's previous generation.
    pub(crate) fn open(&self, now: Instant) {
        self.start.store(now, Ordering::Release);
        *self.first.lock() = None;
    }

    pub(crate) fn close(&self, now: Instant) {
        self.stop.store(now, Ordering::Release);
    }

    pub(crate) fn start_time(&self) -> Instant {
        self.start.load(Ordering::Acquire)
    }

    pub(crate) fn stop_time(&self) -> Instant {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn first(&self) -> Option<Arc<Node<T>>> {
        self.first.lock().clone()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.first.lock().is_none()
    }

    /// Detach the whole chain, leaving the bag empty.
    pub(crate) fn take_chain(&self) -> Option<Arc<Node<T>>> {
        self.first.lock().take()
    }

    /// Prepend a node to this bag's chain. Callers hold the lifespan
    /// manager's mutex; the inner lock only orders against readers walking
    /// the chain.
    pub(crate) fn push_front(&self, node: &Arc<Node<T>>) {
        let mut first = self.first.lock();
        node.set_next(first.take());
        *first = Some(Arc::clone(node));
    }
}

/// Fixed ring of age bags addressed by generation number modulo the ring
/// size. All bags are allocated once at construction and reused cyclically.
pub(crate) struct BagRing<T> {
    bags: Box<[AgeBag<T>]>,
}

impl<T> BagRing<T> {
    pub(crate) fn new() -> Self {
        let mut bags = Vec::with_capacity(RING_SIZE);
        for _ in 0..RING_SIZE {
            bags.push(AgeBag::new());
        }
        Self {
            bags: bags.into_boxed_slice(),
        }
    }

    /// Bag for the given generation.
    pub(crate) fn get(&self, generation: i64) -> Result<&AgeBag<T>, CacheError> {
        if generation < 0 {
            return Err(CacheError::BagNumberInvalid(generation));
        }
        if generation > GENERATION_CEILING {
            return Err(CacheError::BagNumberOverflow(generation));
        }
        Ok(&self.bags[generation as usize % self.bags.len()])
    }

    /// Detach every chain and disassociate every node from its bag. Counts
    /// are left alone; the caller resets them as part of the clear.
    pub(crate) fn empty(&self) {
        for bag in self.bags.iter() {
            let mut cursor = bag.take_chain();
            while let Some(node) = cursor {
                cursor = node.take_next();
                node.set_bag_generation(UNMANAGED);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_addressing_wraps_modulo_size() {
        let ring: BagRing<u32> = BagRing::new();

        let a = ring.get(3).unwrap() as *const AgeBag<u32>;
        let b = ring.get(3 + RING_SIZE as i64).unwrap() as *const AgeBag<u32>;
        let c = ring.get(4).unwrap() as *const AgeBag<u32>;

        assert_eq!(a, b, "generations a ring apart share a bag");
        assert_ne!(a, c, "adjacent generations use distinct bags");
    }

    #[test]
    fn ring_rejects_negative_generation() {
        let ring: BagRing<u32> = BagRing::new();
        assert!(matches!(
            ring.get(-1),
            Err(CacheError::BagNumberInvalid(-1))
        ));
    }

    #[test]
    fn ring_rejects_generation_past_ceiling() {
        let ring: BagRing<u32> = BagRing::new();
        let too_far = GENERATION_CEILING + 1;
        assert!(matches!(
            ring.get(too_far),
            Err(CacheError::BagNumberOverflow(g)) if g == too_far
        ));
    }

    #[test]
    fn push_front_builds_a_chain() {
        let ring: BagRing<u32> = BagRing::new();
        let bag = ring.get(0).unwrap();

        let first = Arc::new(Node::new(Arc::new(1)));
        let second = Arc::new(Node::new(Arc::new(2)));
        bag.push_front(&first);
        bag.push_front(&second);

        let head = bag.first().unwrap();
        assert_eq!(*head.value().unwrap(), 2);
        let tail = head.next().unwrap();
        assert_eq!(*tail.value().unwrap(), 1);
        assert!(tail.next().is_none());
    }

    #[test]
    fn empty_disassociates_every_node() {
        let ring: BagRing<u32> = BagRing::new();
        let bag = ring.get(7).unwrap();

        let node = Arc::new(Node::new(Arc::new(9)));
        bag.push_front(&node);
        node.set_bag_generation(7);

        ring.empty();

        assert!(bag.is_empty());
        assert_eq!(node.bag_generation(), UNMANAGED);
        assert!(node.next().is_none());
    }

    #[test]
    fn open_clears_leftover_chain() {
        let ring: BagRing<u32> = BagRing::new();
        let bag = ring.get(0).unwrap();
        bag.push_front(&Arc::new(Node::new(Arc::new(5))));

        bag.open(Instant::now());

        assert!(bag.is_empty());
    }
}
