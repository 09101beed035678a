//! At-most-one execution per cache key.
//!
//! The first task to claim a key becomes the leader and executes. Tasks
//! claiming the same key later block until the leader finishes and then
//! reuse its outcome instead of executing again. Outcomes stay in the table
//! for the rest of the run.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::cache::CachedResult;
use crate::error::{ErrorKind, TaskErrorInfo};
use crate::task::CacheKey;

pub type Outcome = Result<CachedResult, TaskErrorInfo>;

#[derive(Default)]
struct Slot {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

impl Slot {
    fn fill(&self, outcome: Outcome) {
        if let Ok(mut slot) = self.outcome.lock() {
            if slot.is_none() {
                *slot = Some(outcome);
            }
        }
        self.ready.notify_all();
    }

    fn wait(&self) -> Outcome {
        let abandoned = || TaskErrorInfo {
            kind: ErrorKind::Execution,
            message: "identical task was abandoned".to_string(),
        };
        let Ok(mut slot) = self.outcome.lock() else {
            return Err(abandoned());
        };
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = match self.ready.wait(slot) {
                Ok(guard) => guard,
                Err(_) => return Err(abandoned()),
            };
        }
    }
}

/// Result of claiming a key.
pub enum Claim {
    Leader(LeaderGuard),
    Follower(Outcome),
}

/// Held by the executing task. Dropping it without [`LeaderGuard::complete`]
/// releases followers with a cancellation error.
pub struct LeaderGuard {
    slot: Arc<Slot>,
    done: bool,
}

impl LeaderGuard {
    pub fn complete(mut self, outcome: Outcome) {
        self.slot.fill(outcome);
        self.done = true;
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if !self.done {
            self.slot.fill(Err(TaskErrorInfo {
                kind: ErrorKind::Cancelled,
                message: "identical task did not finish".to_string(),
            }));
        }
    }
}

#[derive(Default)]
pub struct InFlight {
    slots: Mutex<HashMap<CacheKey, Arc<Slot>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, key: &CacheKey) -> Claim {
        let (slot, leader) = {
            let Ok(mut slots) = self.slots.lock() else {
                // a poisoned table only means another worker panicked; run
                // this task on its own
                return Claim::Leader(LeaderGuard {
                    slot: Arc::new(Slot::default()),
                    done: false,
                });
            };
            match slots.get(key) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(Slot::default());
                    slots.insert(key.clone(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if leader {
            Claim::Leader(LeaderGuard { slot, done: false })
        } else {
            Claim::Follower(slot.wait())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Repository;
    use step_spec::Step;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn key() -> CacheKey {
        CacheKey::compute(&Repository::new("r", "n", "abc"), &[Step::command(["true"])]).unwrap()
    }

    #[test]
    fn test_single_leader_among_concurrent_claims() {
        let inflight = Arc::new(InFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let inflight = Arc::clone(&inflight);
                let executions = Arc::clone(&executions);
                thread::spawn(move || match inflight.claim(&key()) {
                    Claim::Leader(guard) => {
                        executions.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(100));
                        guard.complete(Ok(CachedResult::no_changes()));
                        true
                    }
                    Claim::Follower(outcome) => {
                        assert_eq!(outcome, Ok(CachedResult::no_changes()));
                        false
                    }
                })
            })
            .collect();

        let leaders = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|leader| *leader)
            .count();
        assert_eq!(leaders, 1);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abandoned_leader_releases_followers() {
        let inflight = InFlight::new();
        let guard = match inflight.claim(&key()) {
            Claim::Leader(guard) => guard,
            Claim::Follower(_) => panic!("first claim must lead"),
        };
        drop(guard);

        match inflight.claim(&key()) {
            Claim::Follower(Err(info)) => assert_eq!(info.kind, ErrorKind::Cancelled),
            _ => panic!("expected a failed follower outcome"),
        }
    }
}
