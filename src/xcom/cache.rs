use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use concurrent_map::ConcurrentMap;
use parking_lot::Mutex;

use crate::xcom::{NULL_SYNODE, PaxMachine, SynodeNo};

/// A Paxos machine shared between the cache and its users.
pub type MachineRef = Arc<Mutex<PaxMachine>>;

/// Lookup of Paxos machines by exact synode.
pub trait PaxosCache {
    /// The machine for `synode`, if it is cached.
    fn hash_get(&self, synode: &SynodeNo) -> Option<MachineRef>;
}

/// The cache of Paxos instances, ordered by synode.
///
/// Lookups are lock-free. Creation is serialized so that concurrent
/// callers of `get_or_create` end up with the same machine.
pub struct SynodeCache {
    machines: ConcurrentMap<SynodeNo, MachineRef>,
    create_mu: Mutex<()>,
    len: AtomicUsize,
    capacity: usize,
    last_removed: Mutex<SynodeNo>,
}

impl std::fmt::Debug for SynodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynodeCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("last_removed", &self.last_removed())
            .finish()
    }
}

impl SynodeCache {
    /// An empty cache that `shrink` keeps at or below `capacity` machines
    /// when it can.
    pub fn new(capacity: usize) -> SynodeCache {
        SynodeCache {
            machines: ConcurrentMap::default(),
            create_mu: Mutex::new(()),
            len: AtomicUsize::new(0),
            capacity,
            last_removed: Mutex::new(NULL_SYNODE),
        }
    }

    /// The machine for `synode`, if cached.
    pub fn get(&self, synode: &SynodeNo) -> Option<MachineRef> {
        self.machines.get(synode)
    }

    /// The machine for `synode`, created if missing.
    pub fn get_or_create(&self, synode: SynodeNo) -> MachineRef {
        if let Some(machine) = self.machines.get(&synode) {
            return machine;
        }

        let _create = self.create_mu.lock();
        if let Some(machine) = self.machines.get(&synode) {
            return machine;
        }

        let machine = Arc::new(Mutex::new(PaxMachine::new(synode)));
        let old = self.machines.insert(synode, machine.clone());
        assert!(old.is_none());
        self.len.fetch_add(1, Ordering::AcqRel);
        log::trace!("created paxos machine for {}", synode);
        machine
    }

    /// Number of cached machines.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether no machine is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The highest synode evicted so far.
    pub fn last_removed(&self) -> SynodeNo {
        *self.last_removed.lock()
    }

    /// Evicts decided machines, lowest synode first, until the cache is
    /// back to its capacity. Undecided machines are never evicted. Returns
    /// how many were removed.
    pub fn shrink(&self) -> usize {
        if self.len() <= self.capacity {
            return 0;
        }

        let _create = self.create_mu.lock();
        let mut removed = 0;
        let entries: Vec<(SynodeNo, MachineRef)> = self.machines.range(..).collect();
        for (synode, machine) in entries {
            if self.len() <= self.capacity {
                break;
            }
            if !machine.lock().is_finished() {
                continue;
            }
            if self.machines.remove(&synode).is_some() {
                self.len.fetch_sub(1, Ordering::AcqRel);
                removed += 1;

                let mut last_removed = self.last_removed.lock();
                *last_removed = (*last_removed).max(synode);
            }
        }

        if removed > 0 {
            log::debug!("evicted {} decided paxos machines, {} remain", removed, self.len());
        }
        removed
    }
}

impl PaxosCache for SynodeCache {
    fn hash_get(&self, synode: &SynodeNo) -> Option<MachineRef> {
        self.get(synode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xcom::{Ballot, CheckedData, PaxMsg};

    fn decide(cache: &SynodeCache, synode: SynodeNo) {
        let machine = cache.get_or_create(synode);
        machine.lock().learn(Arc::new(PaxMsg {
            synode,
            proposal: Ballot::new(1, 0),
            origin: synode,
            data: CheckedData::new(vec![1, 2, 3]),
        }));
    }

    #[test]
    fn get_or_create_returns_the_same_machine() {
        let cache = SynodeCache::new(10);
        let s = SynodeNo::new(1, 1, 0);
        assert!(cache.hash_get(&s).is_none());

        let a = cache.get_or_create(s);
        let b = cache.get_or_create(s);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &cache.hash_get(&s).unwrap()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_creation() {
        let cache = Arc::new(SynodeCache::new(100));
        let s = SynodeNo::new(3, 7, 1);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.get_or_create(s))
            })
            .collect();
        let machines: Vec<MachineRef> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert!(machines.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn shrink_evicts_lowest_decided_only() {
        let cache = SynodeCache::new(2);
        for msgno in 1..=5 {
            let s = SynodeNo::new(1, msgno, 0);
            if msgno == 2 {
                cache.get_or_create(s);
            } else {
                decide(&cache, s);
            }
        }

        assert_eq!(cache.shrink(), 3);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&SynodeNo::new(1, 2, 0)).is_some());
        assert!(cache.get(&SynodeNo::new(1, 5, 0)).is_some());
        assert_eq!(cache.last_removed(), SynodeNo::new(1, 4, 0));
        assert_eq!(cache.shrink(), 0);
    }
}
