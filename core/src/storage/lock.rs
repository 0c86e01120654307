//! Row lock table with deadlock detection.
//!
//! Each uid has at most one holder. A transaction waits on at most one uid
//! at a time, so the wait-for graph is a set of chains: `xid -> awaited uid ->
//! its holder -> ...`. A request that would close a chain into a loop is
//! refused and leaves no trace in the graph.
//!
//! Released uids go to the oldest waiter first.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use super::{Uid, Xid};
use crate::error::KeelError;

/// Granting the wait would have closed a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadlock: transaction {xid} waiting on {uid:#x}")]
pub struct Deadlock {
    pub xid: Xid,
    pub uid: Uid,
}

impl From<Deadlock> for KeelError {
    fn from(err: Deadlock) -> Self {
        KeelError::Deadlock {
            xid: err.xid,
            uid: err.uid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Waiting,
    Granted,
    Cancelled,
}

struct WaitSignal {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl WaitSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(WaitState::Waiting),
            cond: Condvar::new(),
        }
    }

    fn finish(&self, state: WaitState) {
        *self.state.lock() = state;
        self.cond.notify_all();
    }
}

/// Handle a blocked requester parks on until the uid is handed over
pub struct LockWait {
    signal: Arc<WaitSignal>,
}

impl LockWait {
    /// Block until the lock is granted. Returns `false` if the waiting
    /// transaction was removed from the table instead.
    pub fn wait(self) -> bool {
        let mut state = self.signal.state.lock();
        while *state == WaitState::Waiting {
            self.signal.cond.wait(&mut state);
        }
        *state == WaitState::Granted
    }
}

#[derive(Default)]
struct Graph {
    /// uids each transaction holds
    held: HashMap<Xid, Vec<Uid>>,
    /// holder of each locked uid
    owner: HashMap<Uid, Xid>,
    /// transactions queued on each uid, oldest first
    waiters: HashMap<Uid, VecDeque<Xid>>,
    /// the uid each blocked transaction waits on
    waiting_for: HashMap<Xid, Uid>,
    signals: HashMap<Xid, Arc<WaitSignal>>,
}

impl Graph {
    fn holds(&self, xid: Xid, uid: Uid) -> bool {
        self.held.get(&xid).is_some_and(|uids| uids.contains(&uid))
    }

    fn grant(&mut self, xid: Xid, uid: Uid) {
        self.owner.insert(uid, xid);
        self.held.entry(xid).or_default().push(uid);
    }

    fn has_deadlock(&self) -> bool {
        // Stamp of the traversal that first reached each transaction
        let mut stamps: HashMap<Xid, u64> = HashMap::new();
        let mut stamp = 0;

        for &start in self.waiting_for.keys() {
            if stamps.contains_key(&start) {
                continue;
            }
            stamp += 1;

            let mut xid = start;
            loop {
                match stamps.get(&xid) {
                    Some(&seen) if seen == stamp => return true,
                    // Explored by an earlier traversal without finding a cycle
                    Some(_) => break,
                    None => {}
                }
                stamps.insert(xid, stamp);

                let Some(uid) = self.waiting_for.get(&xid) else {
                    break;
                };
                let Some(&holder) = self.owner.get(uid) else {
                    break;
                };
                xid = holder;
            }
        }
        false
    }

    fn dequeue(&mut self, xid: Xid, uid: Uid) {
        if let Some(queue) = self.waiters.get_mut(&uid) {
            queue.retain(|&waiter| waiter != xid);
            if queue.is_empty() {
                self.waiters.remove(&uid);
            }
        }
    }

    /// Hand `uid` to its oldest waiter, or free it
    fn release(&mut self, uid: Uid) {
        self.owner.remove(&uid);

        let Some(queue) = self.waiters.get_mut(&uid) else {
            return;
        };
        let next = queue.pop_front();
        if queue.is_empty() {
            self.waiters.remove(&uid);
        }

        if let Some(next) = next {
            self.waiting_for.remove(&next);
            self.grant(next, uid);
            if let Some(signal) = self.signals.remove(&next) {
                signal.finish(WaitState::Granted);
            }
            tracing::trace!("Lock {:#x} handed to transaction {}", uid, next);
        }
    }
}

/// Exclusive per-uid locks held until commit or abort
#[derive(Default)]
pub struct LockTable {
    graph: Mutex<Graph>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request `uid` for `xid`.
    ///
    /// `Ok(None)` means the lock is held now. `Ok(Some(wait))` means another
    /// transaction holds it and the caller must block on `wait`.
    pub fn add(&self, xid: Xid, uid: Uid) -> Result<Option<LockWait>, Deadlock> {
        let mut graph = self.graph.lock();

        if graph.holds(xid, uid) {
            return Ok(None);
        }
        if !graph.owner.contains_key(&uid) {
            graph.grant(xid, uid);
            return Ok(None);
        }

        graph.waiting_for.insert(xid, uid);
        graph.waiters.entry(uid).or_default().push_back(xid);

        if graph.has_deadlock() {
            graph.waiting_for.remove(&xid);
            graph.dequeue(xid, uid);
            tracing::debug!("Deadlock: transaction {} waiting on {:#x}", xid, uid);
            return Err(Deadlock { xid, uid });
        }

        let signal = Arc::new(WaitSignal::new());
        graph.signals.insert(xid, Arc::clone(&signal));
        Ok(Some(LockWait { signal }))
    }

    /// Release everything `xid` holds, waking one waiter per freed uid.
    pub fn remove(&self, xid: Xid) {
        let mut graph = self.graph.lock();

        if let Some(uid) = graph.waiting_for.remove(&xid) {
            graph.dequeue(xid, uid);
        }
        if let Some(signal) = graph.signals.remove(&xid) {
            signal.finish(WaitState::Cancelled);
        }

        if let Some(uids) = graph.held.remove(&xid) {
            for uid in uids {
                graph.release(uid);
            }
        }
    }

    /// Current holder of `uid`
    pub fn holder(&self, uid: Uid) -> Option<Xid> {
        self.graph.lock().owner.get(&uid).copied()
    }

    /// Number of transactions blocked on a lock
    pub fn waiting(&self) -> usize {
        self.graph.lock().waiting_for.len()
    }
}
