//! Record locks with deadlock detection.
//!
//! Each record (by [`Uid`]) has at most one holder. A transaction asking for
//! a held record joins that record's FIFO wait queue and blocks on a
//! [`Waiter`] outside the table mutex. A transaction waits on at most one
//! record at a time, so the wait-for graph has out-degree at most one and
//! cycle detection is a pointer chase from each holder.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::data::Uid;
use crate::error::{Error, Result};
use crate::transaction::TransactionId;

/// Blocks a waiting transaction until its lock is granted.
#[derive(Debug, Default)]
pub struct Waiter {
    granted: Mutex<bool>,
    cond: Condvar,
}

impl Waiter {
    /// Blocks until the lock has been handed over.
    pub fn wait(&self) {
        let mut granted = self.granted.lock();
        while !*granted {
            self.cond.wait(&mut granted);
        }
    }

    fn grant(&self) {
        *self.granted.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_granted(&self) -> bool {
        *self.granted.lock()
    }
}

#[derive(Default)]
struct LockGraph {
    /// Records held by each transaction.
    x2u: HashMap<TransactionId, Vec<Uid>>,
    /// Holder of each record.
    u2x: HashMap<Uid, TransactionId>,
    /// Transactions queued on each record, oldest first.
    wait: HashMap<Uid, VecDeque<TransactionId>>,
    /// The record each waiting transaction is queued on.
    wait_u: HashMap<TransactionId, Uid>,
    waiters: HashMap<TransactionId, Arc<Waiter>>,
    /// Per-pass visit stamps for cycle detection.
    x_stamp: HashMap<TransactionId, u64>,
    stamp: u64,
}

impl LockGraph {
    fn holds(&self, xid: TransactionId, uid: Uid) -> bool {
        self.x2u.get(&xid).is_some_and(|uids| uids.contains(&uid))
    }

    fn grant(&mut self, xid: TransactionId, uid: Uid) {
        self.u2x.insert(uid, xid);
        self.x2u.entry(xid).or_default().push(uid);
    }

    fn dequeue(&mut self, xid: TransactionId, uid: Uid) {
        self.wait_u.remove(&xid);
        if let Some(queue) = self.wait.get_mut(&uid) {
            queue.retain(|&waiting| waiting != xid);
            if queue.is_empty() {
                self.wait.remove(&uid);
            }
        }
    }

    /// Hands `uid` to its oldest still-waiting transaction, if any.
    fn select_new_holder(&mut self, uid: Uid) {
        self.u2x.remove(&uid);

        while let Some(next) = self.wait.get_mut(&uid).and_then(VecDeque::pop_front) {
            if self.wait_u.get(&next) != Some(&uid) {
                continue;
            }
            self.wait_u.remove(&next);
            self.grant(next, uid);
            if let Some(waiter) = self.waiters.remove(&next) {
                waiter.grant();
            }
            break;
        }

        if self.wait.get(&uid).is_some_and(VecDeque::is_empty) {
            self.wait.remove(&uid);
        }
    }

    fn has_deadlock(&mut self) -> bool {
        self.x_stamp.clear();
        self.stamp = 1;

        let holders: Vec<TransactionId> = self.x2u.keys().copied().collect();
        for xid in holders {
            if self.x_stamp.get(&xid).is_some_and(|&s| s > 0) {
                continue;
            }
            self.stamp += 1;
            if self.chase(xid) {
                return true;
            }
        }
        false
    }

    /// Follows wait edges from `xid`; meeting the current stamp is a cycle.
    fn chase(&mut self, mut xid: TransactionId) -> bool {
        loop {
            if let Some(&stamp) = self.x_stamp.get(&xid) {
                return stamp == self.stamp;
            }
            self.x_stamp.insert(xid, self.stamp);

            let Some(uid) = self.wait_u.get(&xid) else {
                return false;
            };
            let Some(&holder) = self.u2x.get(uid) else {
                return false;
            };
            xid = holder;
        }
    }
}

/// The shared table of record locks.
#[derive(Default)]
pub struct LockTable {
    graph: Mutex<LockGraph>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests `uid` for `xid`.
    ///
    /// Returns `None` when the lock is held on return, or a [`Waiter`] to
    /// block on. Fails with [`Error::Deadlock`] if waiting would close a
    /// cycle; the request is withdrawn in that case.
    pub fn add(&self, xid: TransactionId, uid: Uid) -> Result<Option<Arc<Waiter>>> {
        let mut graph = self.graph.lock();
        if graph.holds(xid, uid) {
            return Ok(None);
        }
        if !graph.u2x.contains_key(&uid) {
            graph.grant(xid, uid);
            return Ok(None);
        }

        graph.wait_u.insert(xid, uid);
        graph.wait.entry(uid).or_default().push_back(xid);

        if graph.has_deadlock() {
            graph.dequeue(xid, uid);
            log::debug!("deadlock detected: {} waiting on {}", xid, uid);
            return Err(Error::Deadlock(xid));
        }

        let waiter = Arc::new(Waiter::default());
        graph.waiters.insert(xid, Arc::clone(&waiter));
        Ok(Some(waiter))
    }

    /// Releases everything `xid` holds and withdraws any pending request.
    pub fn remove(&self, xid: TransactionId) {
        let mut graph = self.graph.lock();

        if let Some(uids) = graph.x2u.remove(&xid) {
            for uid in uids {
                graph.select_new_holder(uid);
            }
        }
        if let Some(uid) = graph.wait_u.get(&xid).copied() {
            graph.dequeue(xid, uid);
        }
        graph.waiters.remove(&xid);
    }

    pub fn holder(&self, uid: Uid) -> Option<TransactionId> {
        self.graph.lock().u2x.get(&uid).copied()
    }

    pub fn waiting_on(&self, xid: TransactionId) -> Option<Uid> {
        self.graph.lock().wait_u.get(&xid).copied()
    }
}
