//! Subscriber registry and concurrent fan-out.
//!
//! The registry is the only shared state between the transport (which adds
//! and removes subscribers) and the pipeline thread (which broadcasts). Every
//! broadcast iterates a snapshot, so membership changes during a send never
//! affect the cycle in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use anyhow::Result;

use crate::pipeline::AnnotatedFrame;

pub type SubscriberId = u64;

/// A live receiver of annotated frames.
///
/// `send` may block, but must give up on its own (e.g. after a send timeout);
/// the broadcast cycle waits for every subscriber in the snapshot.
pub trait Subscriber: Send + Sync {
    fn id(&self) -> SubscriberId;

    /// Deliver one frame. An error marks the subscriber dead.
    fn send(&self, frame: &AnnotatedFrame) -> Result<()>;

    /// Peer description for logs.
    fn describe(&self) -> String {
        format!("subscriber {}", self.id())
    }
}

/// Outcome of one broadcast cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    /// Subscribers whose send failed and that were unregistered.
    pub removed: Vec<SubscriberId>,
}

pub struct SubscriberRegistry {
    next_id: AtomicU64,
    members: Mutex<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            members: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh subscriber id.
    pub fn next_id(&self) -> SubscriberId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a subscriber. Returns false if its id was already registered.
    pub fn register(&self, subscriber: Arc<dyn Subscriber>) -> bool {
        let mut members = self.lock();
        let id = subscriber.id();
        if members.contains_key(&id) {
            return false;
        }
        members.insert(id, subscriber);
        log::info!("subscriber {} connected ({} total)", id, members.len());
        true
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut members = self.lock();
        let removed = members.remove(&id).is_some();
        if removed {
            log::info!("subscriber {} removed ({} remaining)", id, members.len());
        }
        removed
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Current members, in id order.
    pub fn snapshot(&self) -> Vec<Arc<dyn Subscriber>> {
        let mut members: Vec<_> = self.lock().values().cloned().collect();
        members.sort_by_key(|s| s.id());
        members
    }

    /// Drop every subscriber.
    pub fn clear(&self) -> usize {
        let mut members = self.lock();
        let count = members.len();
        members.clear();
        count
    }

    /// Send `frame` to every current subscriber concurrently.
    ///
    /// One scoped thread per subscriber; all are joined before returning.
    /// Subscribers whose send fails (or panics) are unregistered.
    pub fn broadcast(&self, frame: &AnnotatedFrame) -> BroadcastReport {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return BroadcastReport::default();
        }

        let outcomes: Vec<(SubscriberId, bool)> = thread::scope(|scope| {
            let handles: Vec<_> = snapshot
                .iter()
                .map(|subscriber| {
                    let id = subscriber.id();
                    let handle = scope.spawn(move || match subscriber.send(frame) {
                        Ok(()) => true,
                        Err(err) => {
                            log::warn!(
                                "{}: send failed, dropping: {:#}",
                                subscriber.describe(),
                                err
                            );
                            false
                        }
                    });
                    (id, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(id, handle)| (id, handle.join().unwrap_or(false)))
                .collect()
        });

        let mut report = BroadcastReport {
            attempted: outcomes.len(),
            ..BroadcastReport::default()
        };
        for (id, delivered) in outcomes {
            if delivered {
                report.delivered += 1;
            } else {
                self.unregister(id);
                report.removed.push(id);
            }
        }
        report
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, Arc<dyn Subscriber>>> {
        match self.members.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}
