//! Eviction Policies
//!
//! [`EvictionPolicy`] is the closed set of victim-selection rules a store can
//! be configured with. Each store segment keeps one [`EvictionTracker`] holding
//! the bookkeeping the chosen rule needs; the segment reports inserts,
//! replacements, reads and removals to it and asks it for a victim only when
//! a new key arrives while the segment is full.
//!
//! | Policy   | Victim                                   | Select   | Per-access cost |
//! |----------|------------------------------------------|----------|-----------------|
//! | `Lru`    | oldest last access                       | O(1)     | O(1) list move  |
//! | `Lfu`    | lowest frequency, then oldest access     | O(log F) | O(log F) bucket |
//! | `Fifo`   | oldest insertion                         | O(1)     | none            |
//! | `Random` | uniformly random                         | O(1)     | none            |
//!
//! `F` is the number of distinct frequencies currently present.
//!
//! Trackers are best-effort heuristics: the store may update them a moment
//! after the entry itself changed, and a slightly stale order only changes
//! which entry is evicted, never whether capacity is respected.

use core::borrow::Borrow;
use core::fmt;
use core::hash::Hash;
use std::collections::BTreeMap;

use rand::Rng;

use crate::error::Error;
use crate::list::{Entry, List};

#[cfg(feature = "hashbrown")]
use hashbrown::HashMap;

#[cfg(not(feature = "hashbrown"))]
use std::collections::HashMap;

/// Victim-selection rule used when a bounded structure is full.
///
/// LRU is the safe general default. LFU wins when popularity is stable and
/// skewed, at a higher bookkeeping cost. FIFO and Random need almost no
/// bookkeeping.
///
/// ```
/// use cache_flight::policy::EvictionPolicy;
///
/// assert_eq!(EvictionPolicy::default(), EvictionPolicy::Lru);
/// assert_eq!(EvictionPolicy::Lfu.name(), "LFU");
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum EvictionPolicy {
    /// Least recently used.
    #[default]
    Lru,
    /// Least frequently used, ties broken by least recent access.
    Lfu,
    /// First in, first out. Reads do not affect order.
    Fifo,
    /// Uniformly random.
    Random,
}

impl EvictionPolicy {
    /// Short upper-case name, as reported by metrics.
    pub fn name(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "LRU",
            EvictionPolicy::Lfu => "LFU",
            EvictionPolicy::Fifo => "FIFO",
            EvictionPolicy::Random => "Random",
        }
    }

    pub(crate) fn tracker<K: Hash + Eq + Clone>(self) -> EvictionTracker<K> {
        match self {
            EvictionPolicy::Lru => EvictionTracker::Lru(RecencyOrder::new()),
            EvictionPolicy::Lfu => EvictionTracker::Lfu(FrequencyOrder::new()),
            EvictionPolicy::Fifo => EvictionTracker::Fifo(RecencyOrder::new()),
            EvictionPolicy::Random => EvictionTracker::Random(RandomSet::new()),
        }
    }
}

/// Per-segment eviction bookkeeping for one [`EvictionPolicy`].
pub(crate) enum EvictionTracker<K> {
    Lru(RecencyOrder<K>),
    Lfu(FrequencyOrder<K>),
    Fifo(RecencyOrder<K>),
    Random(RandomSet<K>),
}

impl<K: Hash + Eq + Clone> EvictionTracker<K> {
    /// A key not previously tracked was stored.
    pub(crate) fn record_insert(&mut self, key: K) {
        match self {
            EvictionTracker::Lru(order) | EvictionTracker::Fifo(order) => order.insert(key),
            EvictionTracker::Lfu(order) => order.insert(key),
            EvictionTracker::Random(set) => set.insert(key),
        }
    }

    /// An already tracked key had its value replaced.
    pub(crate) fn record_update<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        match self {
            EvictionTracker::Lru(order) | EvictionTracker::Fifo(order) => order.promote(key),
            EvictionTracker::Lfu(order) => order.refresh(key),
            EvictionTracker::Random(_) => {}
        }
    }

    /// An already tracked key was read.
    pub(crate) fn record_access<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        match self {
            EvictionTracker::Lru(order) => order.promote(key),
            EvictionTracker::Lfu(order) => order.increment(key),
            EvictionTracker::Fifo(_) | EvictionTracker::Random(_) => {}
        }
    }

    /// A key left the segment for a reason other than eviction.
    pub(crate) fn record_remove<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        match self {
            EvictionTracker::Lru(order) | EvictionTracker::Fifo(order) => order.remove(key),
            EvictionTracker::Lfu(order) => order.remove(key),
            EvictionTracker::Random(set) => set.remove(key),
        }
    }

    /// Picks a victim and stops tracking it.
    ///
    /// The caller must remove the returned key from its own storage.
    /// An empty tracker is a contract violation by the caller and yields
    /// [`Error::CapacityViolation`].
    pub(crate) fn select_victim(&mut self) -> Result<K, Error> {
        let victim = match self {
            EvictionTracker::Lru(order) | EvictionTracker::Fifo(order) => order.pop_oldest(),
            EvictionTracker::Lfu(order) => order.pop_least_frequent(),
            EvictionTracker::Random(set) => set.pop_random(),
        };
        victim.ok_or(Error::CapacityViolation)
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            EvictionTracker::Lru(order) | EvictionTracker::Fifo(order) => order.map.len(),
            EvictionTracker::Lfu(order) => order.map.len(),
            EvictionTracker::Random(set) => set.keys.len(),
        }
    }

    pub(crate) fn clear(&mut self) {
        match self {
            EvictionTracker::Lru(order) | EvictionTracker::Fifo(order) => order.clear(),
            EvictionTracker::Lfu(order) => order.clear(),
            EvictionTracker::Random(set) => set.clear(),
        }
    }

    pub(crate) fn policy(&self) -> EvictionPolicy {
        match self {
            EvictionTracker::Lru(_) => EvictionPolicy::Lru,
            EvictionTracker::Lfu(_) => EvictionPolicy::Lfu,
            EvictionTracker::Fifo(_) => EvictionPolicy::Fifo,
            EvictionTracker::Random(_) => EvictionPolicy::Random,
        }
    }
}

impl<K> fmt::Debug for EvictionTracker<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, len) = match self {
            EvictionTracker::Lru(order) => ("Lru", order.map.len()),
            EvictionTracker::Lfu(order) => ("Lfu", order.map.len()),
            EvictionTracker::Fifo(order) => ("Fifo", order.map.len()),
            EvictionTracker::Random(set) => ("Random", set.keys.len()),
        };
        f.debug_struct("EvictionTracker")
            .field("policy", &name)
            .field("len", &len)
            .finish()
    }
}

/// Keys ordered front (newest) to back (oldest).
///
/// # Safety
///
/// Every pointer in `map` was returned by `list.push_front` and is removed
/// from `map` in the same step that unlinks it from `list`.
pub(crate) struct RecencyOrder<K> {
    list: List<K>,
    map: HashMap<K, *mut Entry<K>>,
}

impl<K: Hash + Eq + Clone> RecencyOrder<K> {
    fn new() -> Self {
        Self {
            list: List::new(),
            map: HashMap::new(),
        }
    }

    fn insert(&mut self, key: K) {
        if let Some(&node) = self.map.get(&key) {
            // SAFETY: node comes from our map
            unsafe { self.list.move_to_front(node) };
            return;
        }
        let node = self.list.push_front(key.clone());
        self.map.insert(key, node);
    }

    fn promote<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if let Some(&node) = self.map.get(key) {
            // SAFETY: node comes from our map
            unsafe { self.list.move_to_front(node) };
        }
    }

    fn remove<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if let Some(node) = self.map.remove(key) {
            // SAFETY: node was in our map, so it is still linked
            unsafe { self.list.remove(node) };
        }
    }

    fn pop_oldest(&mut self) -> Option<K> {
        let key = self.list.pop_back()?;
        self.map.remove(&key);
        Some(key)
    }

    fn clear(&mut self) {
        self.map.clear();
        self.list.clear();
    }
}

/// Frequency buckets, each an LRU list, keyed by access count.
///
/// Empty buckets are dropped immediately so the first bucket always holds the
/// least frequently used keys.
///
/// # Safety
///
/// Every `(frequency, node)` in `map` points at a node linked into
/// `buckets[frequency]`.
pub(crate) struct FrequencyOrder<K> {
    buckets: BTreeMap<u64, List<K>>,
    map: HashMap<K, (u64, *mut Entry<K>)>,
}

impl<K: Hash + Eq + Clone> FrequencyOrder<K> {
    fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
            map: HashMap::new(),
        }
    }

    fn insert(&mut self, key: K) {
        if self.map.contains_key(&key) {
            self.refresh(&key);
            return;
        }
        let node = self.buckets.entry(1).or_default().push_front(key.clone());
        self.map.insert(key, (1, node));
    }

    fn refresh<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if let Some(&(frequency, node)) = self.map.get(key) {
            if let Some(bucket) = self.buckets.get_mut(&frequency) {
                // SAFETY: node is linked into buckets[frequency]
                unsafe { bucket.move_to_front(node) };
            }
        }
    }

    fn increment<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let Some(slot) = self.map.get_mut(key) else {
            return;
        };
        let (frequency, node) = *slot;
        let next = frequency.saturating_add(1);
        if next == frequency {
            return;
        }

        if let Some(bucket) = self.buckets.get_mut(&frequency) {
            // SAFETY: node is linked into buckets[frequency]
            unsafe { bucket.detach(node) };
            if bucket.is_empty() {
                self.buckets.remove(&frequency);
            }
        }
        // SAFETY: node was detached above and belongs to no list
        unsafe {
            self.buckets
                .entry(next)
                .or_default()
                .attach_from_other_list(node)
        };
        slot.0 = next;
    }

    fn remove<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let Some((frequency, node)) = self.map.remove(key) else {
            return;
        };
        if let Some(bucket) = self.buckets.get_mut(&frequency) {
            // SAFETY: node is linked into buckets[frequency]
            unsafe { bucket.remove(node) };
            if bucket.is_empty() {
                self.buckets.remove(&frequency);
            }
        }
    }

    fn pop_least_frequent(&mut self) -> Option<K> {
        let mut bucket = self.buckets.first_entry()?;
        let key = bucket.get_mut().pop_back()?;
        if bucket.get().is_empty() {
            bucket.remove();
        }
        self.map.remove(&key);
        Some(key)
    }

    fn clear(&mut self) {
        self.map.clear();
        self.buckets.clear();
    }
}

/// Dense key vector supporting O(1) uniform sampling and swap-removal.
pub(crate) struct RandomSet<K> {
    keys: Vec<K>,
    index: HashMap<K, usize>,
}

impl<K: Hash + Eq + Clone> RandomSet<K> {
    fn new() -> Self {
        Self {
            keys: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn insert(&mut self, key: K) {
        if self.index.contains_key(&key) {
            return;
        }
        self.index.insert(key.clone(), self.keys.len());
        self.keys.push(key);
    }

    fn remove<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if let Some(idx) = self.index.remove(key) {
            self.swap_remove(idx);
        }
    }

    fn pop_random(&mut self) -> Option<K> {
        if self.keys.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..self.keys.len());
        let key = self.swap_remove(idx);
        self.index.remove(&key);
        Some(key)
    }

    /// Removes `keys[idx]`, fixing up the index of the key moved into its slot.
    fn swap_remove(&mut self, idx: usize) -> K {
        let key = self.keys.swap_remove(idx);
        if let Some(moved) = self.keys.get(idx) {
            if let Some(slot) = self.index.get_mut(moved) {
                *slot = idx;
            }
        }
        key
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.index.clear();
    }
}

// SAFETY: trackers own every node their raw pointers reference; nothing is
// shared outside the owning segment, which is always behind a lock.
unsafe impl<K: Send> Send for EvictionTracker<K> {}

// SAFETY: all mutation requires &mut self; shared references cannot race.
unsafe impl<K: Sync> Sync for EvictionTracker<K> {}
