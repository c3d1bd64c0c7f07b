//! # Shared UMEM Registry
//!
//! ## Purpose
//!
//! Queues opened over the same buffer pool may bind to one UMEM instead of registering the
//! pool again. The registry remembers which queue uses which region so a new queue can find a
//! region to join, and refuses to open the same interface queue twice.
//!
//! ## How it works
//!
//! Entries pair a [`QueueKey`] with a `Weak<UmemRegion>`; the queues hold the strong
//! references, so a region disappears with its last queue and the registry never keeps one
//! alive. A region accepts at most `max_sharers` queues. All lookups and updates run under one
//! mutex, and [`UmemRegistry::attach`] does lookup, creation and registration in one critical
//! section so two queues cannot both create a region for the same pool.
//!
//! ## Main components
//!
//! - `UmemRegistry`: the entry list.
//! - `Registration`: guard that removes its entry when the queue goes away.
//! - `QueueKey`: interface index plus queue index.

use crate::mempool::PoolId;
use crate::umem::UmemRegion;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Identifies one NIC queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    pub if_index: u32,
    pub queue_index: u32,
}

impl QueueKey {
    pub fn new(if_index: u32, queue_index: u32) -> Self {
        QueueKey {
            if_index,
            queue_index,
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if{}/q{}", self.if_index, self.queue_index)
    }
}

#[derive(Debug)]
struct Entry {
    key: QueueKey,
    region: Weak<UmemRegion>,
}

#[derive(Debug, Default)]
pub struct UmemRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl UmemRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(UmemRegistry::default())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|entry| entry.region.strong_count() > 0);
        entries
    }

    /// A live region over pool `pool_id` that still accepts another queue.
    pub fn find_sharable_region(&self, pool_id: PoolId) -> Option<Arc<UmemRegion>> {
        find_sharable(&self.lock(), pool_id)
    }

    /// Records that the queue `key` uses `region`.
    pub fn register(
        self: &Arc<Self>,
        key: QueueKey,
        region: &Arc<UmemRegion>,
    ) -> io::Result<Registration> {
        let mut entries = self.lock();
        insert(&mut entries, key, region)?;
        Ok(Registration {
            registry: self.clone(),
            key,
        })
    }

    /// Removes the entry of `key`. Returns false if there was none.
    pub fn unregister(&self, key: QueueKey) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| entry.key != key);
        entries.len() != before
    }

    /// Finds a region to join over `pool_id` (when given) or creates one with `create`, and
    /// registers `key` on it, all under one lock.
    pub fn attach<F>(
        self: &Arc<Self>,
        key: QueueKey,
        pool_id: Option<PoolId>,
        create: F,
    ) -> io::Result<(Arc<UmemRegion>, Registration)>
    where
        F: FnOnce() -> io::Result<UmemRegion>,
    {
        let mut entries = self.lock();
        if entries.iter().any(|entry| entry.key == key) {
            return Err(already_bound(key));
        }
        let region = match pool_id.and_then(|id| find_sharable(&entries, id)) {
            Some(region) => {
                log::info!(
                    "{key}: sharing UMEM at {:p} ({} users)",
                    region.base_address(),
                    users(&entries, &region) + 1
                );
                region
            }
            None => Arc::new(create()?),
        };
        insert(&mut entries, key, &region)?;
        Ok((
            region,
            Registration {
                registry: self.clone(),
                key,
            },
        ))
    }

    /// Queues currently registered.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn users(entries: &[Entry], region: &Arc<UmemRegion>) -> u32 {
    entries
        .iter()
        .filter(|entry| Weak::as_ptr(&entry.region) == Arc::as_ptr(region))
        .count() as u32
}

fn find_sharable(entries: &[Entry], pool_id: PoolId) -> Option<Arc<UmemRegion>> {
    entries
        .iter()
        .filter_map(|entry| entry.region.upgrade())
        .find(|region| {
            region.pool_id() == Some(pool_id) && users(entries, region) < region.max_sharers()
        })
}

fn insert(entries: &mut Vec<Entry>, key: QueueKey, region: &Arc<UmemRegion>) -> io::Result<()> {
    if entries.iter().any(|entry| entry.key == key) {
        return Err(already_bound(key));
    }
    entries.push(Entry {
        key,
        region: Arc::downgrade(region),
    });
    Ok(())
}

fn already_bound(key: QueueKey) -> io::Error {
    io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("{key} is already bound"),
    )
}

/// Keeps a queue's registry entry; removes it on drop.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<UmemRegistry>,
    key: QueueKey,
}

impl Registration {
    pub fn key(&self) -> QueueKey {
        self.key
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.key);
    }
}
