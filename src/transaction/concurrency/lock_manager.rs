//! Record and page locks for strict two-phase locking.
//!
//! Every lock has a FIFO queue of requests, granted ones first. A waiting
//! request records wait-for edges to the transactions blocking it and runs a
//! cycle check each time it wakes; the youngest transaction (highest id) in a
//! cycle is chosen as the deadlock victim.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::common::types::{PageId, RecordId, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    /// Whether holding `self` satisfies a request for `other`
    pub fn covers(self, other: LockMode) -> bool {
        self == LockMode::Exclusive || other == LockMode::Shared
    }
}

/// A lockable resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockTarget {
    /// A record, scoped by the root page of its table
    Record(PageId, RecordId),
    Page(PageId),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Transaction {0} was chosen as a deadlock victim")]
    DeadlockDetected(TxnId),

    #[error("Transaction {txn_id} timed out waiting for {target:?}")]
    Timeout { txn_id: TxnId, target: LockTarget },
}

pub type Result<T> = std::result::Result<T, LockError>;

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug)]
struct LockQueue {
    requests: VecDeque<LockRequest>,
    cv: Arc<Condvar>,
}

impl LockQueue {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            cv: Arc::new(Condvar::new()),
        }
    }

    fn granted_mode(&self, txn_id: TxnId) -> Option<LockMode> {
        self.requests
            .iter()
            .filter(|r| r.granted && r.txn_id == txn_id)
            .map(|r| r.mode)
            .max_by_key(|mode| *mode == LockMode::Exclusive)
    }

    /// Transactions other than `txn_id` that stand in the way of its
    /// waiting request: incompatible holders, and incompatible waiters queued
    /// ahead of it
    fn blockers(&self, txn_id: TxnId, mode: LockMode) -> HashSet<TxnId> {
        let mut blockers = HashSet::new();
        for request in &self.requests {
            if request.txn_id == txn_id {
                if !request.granted {
                    break;
                }
                continue;
            }
            if !request.mode.is_compatible_with(mode) {
                blockers.insert(request.txn_id);
            }
        }
        blockers
    }

    /// Grant waiting requests in FIFO order until one is incompatible
    fn grant_waiters(&mut self) -> bool {
        let mut granted_any = false;
        loop {
            let Some(index) = self.requests.iter().position(|r| !r.granted) else {
                break;
            };
            let (txn_id, mode) = (self.requests[index].txn_id, self.requests[index].mode);
            let compatible = self
                .requests
                .iter()
                .filter(|r| r.granted && r.txn_id != txn_id)
                .all(|r| r.mode.is_compatible_with(mode));
            if !compatible {
                break;
            }
            // An upgrade replaces the shared grant it was queued behind
            self.requests.retain(|r| !(r.granted && r.txn_id == txn_id));
            if let Some(request) = self.requests.iter_mut().find(|r| r.txn_id == txn_id && !r.granted) {
                request.granted = true;
            }
            granted_any = true;
        }
        if granted_any {
            self.cv.notify_all();
        }
        granted_any
    }

    fn remove_waiting(&mut self, txn_id: TxnId) {
        self.requests.retain(|r| r.granted || r.txn_id != txn_id);
    }
}

#[derive(Default)]
struct LockTable {
    queues: HashMap<LockTarget, LockQueue>,
    held: HashMap<TxnId, HashSet<LockTarget>>,
    /// waiter -> transactions it waits for
    wait_for: HashMap<TxnId, HashSet<TxnId>>,
    /// What each blocked transaction is waiting on
    waiting_on: HashMap<TxnId, LockTarget>,
    victims: HashSet<TxnId>,
}

impl LockTable {
    /// Members of a wait-for cycle through `start`, if there is one
    fn find_cycle(&self, start: TxnId) -> Option<Vec<TxnId>> {
        let mut stack = vec![(start, vec![start])];
        let mut visited = HashSet::new();
        while let Some((current, path)) = stack.pop() {
            let Some(next) = self.wait_for.get(&current) else {
                continue;
            };
            for &holder in next {
                if holder == start {
                    return Some(path);
                }
                if visited.insert(holder) {
                    let mut extended = path.clone();
                    extended.push(holder);
                    stack.push((holder, extended));
                }
            }
        }
        None
    }

    fn clear_waiting(&mut self, txn_id: TxnId) {
        self.wait_for.remove(&txn_id);
        self.waiting_on.remove(&txn_id);
    }

    fn record_grant(&mut self, txn_id: TxnId, target: LockTarget) {
        self.held.entry(txn_id).or_default().insert(target);
        self.clear_waiting(txn_id);
    }

    /// Drop a waiting request after a failure and let whoever was behind it in
    fn abandon(&mut self, txn_id: TxnId, target: LockTarget) {
        if let Some(queue) = self.queues.get_mut(&target) {
            queue.remove_waiting(txn_id);
            queue.grant_waiters();
            if queue.requests.is_empty() {
                self.queues.remove(&target);
            }
        }
        self.clear_waiting(txn_id);
    }
}

pub struct LockManager {
    table: Mutex<LockTable>,
    default_timeout: Duration,
    deadlocks: AtomicU64,
    timeouts: AtomicU64,
}

impl LockManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            default_timeout,
            deadlocks: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn acquire(&self, txn_id: TxnId, target: LockTarget, mode: LockMode) -> Result<()> {
        self.acquire_with_timeout(txn_id, target, mode, self.default_timeout)
    }

    /// Acquire a lock, blocking up to `timeout` while it is held in a
    /// conflicting mode
    pub fn acquire_with_timeout(
        &self,
        txn_id: TxnId,
        target: LockTarget,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock();

        if table.victims.remove(&txn_id) {
            return Err(LockError::DeadlockDetected(txn_id));
        }

        let queue = table.queues.entry(target).or_insert_with(LockQueue::new);
        if let Some(held) = queue.granted_mode(txn_id) {
            if held.covers(mode) {
                return Ok(());
            }
        }

        // Upgrades wait ahead of ordinary requests
        let request = LockRequest { txn_id, mode, granted: false };
        let is_upgrade = queue.granted_mode(txn_id).is_some();
        if is_upgrade {
            let first_waiter = queue.requests.iter().position(|r| !r.granted).unwrap_or(queue.requests.len());
            queue.requests.insert(first_waiter, request);
        } else {
            queue.requests.push_back(request);
        }
        queue.grant_waiters();
        let cv = Arc::clone(&queue.cv);

        loop {
            if self.is_granted(&table, txn_id, target, mode) {
                table.record_grant(txn_id, target);
                return Ok(());
            }

            if table.victims.remove(&txn_id) {
                table.abandon(txn_id, target);
                return Err(LockError::DeadlockDetected(txn_id));
            }

            self.refresh_edges(&mut table, txn_id, target, mode);
            if let Some(cycle) = table.find_cycle(txn_id) {
                let victim = cycle.iter().copied().max().unwrap_or(txn_id);
                self.deadlocks.fetch_add(1, Ordering::Relaxed);
                warn!("Deadlock among transactions {:?}; aborting {}", cycle, victim);
                if victim == txn_id {
                    table.abandon(txn_id, target);
                    return Err(LockError::DeadlockDetected(txn_id));
                }
                self.flag_victim(&mut table, victim);
            }

            let now = Instant::now();
            if now >= deadline {
                table.abandon(txn_id, target);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!("Transaction {} timed out waiting for {:?}", txn_id, target);
                return Err(LockError::Timeout { txn_id, target });
            }
            cv.wait_for(&mut table, deadline - now);
        }
    }

    /// Release every lock held or requested by a transaction
    pub fn release_all(&self, txn_id: TxnId) {
        let mut table = self.table.lock();
        let targets = table.held.remove(&txn_id).unwrap_or_default();
        for target in targets {
            if let Some(queue) = table.queues.get_mut(&target) {
                queue.requests.retain(|r| r.txn_id != txn_id);
                if !queue.grant_waiters() {
                    queue.cv.notify_all();
                }
                if queue.requests.is_empty() {
                    table.queues.remove(&target);
                }
            }
        }

        table.clear_waiting(txn_id);
        for waits in table.wait_for.values_mut() {
            waits.remove(&txn_id);
        }
        table.victims.remove(&txn_id);
    }

    /// Whether the transaction was chosen as a deadlock victim and has not
    /// yet observed it. Clears the flag.
    pub fn take_victim(&self, txn_id: TxnId) -> bool {
        self.table.lock().victims.remove(&txn_id)
    }

    pub fn holds(&self, txn_id: TxnId, target: LockTarget, mode: LockMode) -> bool {
        let table = self.table.lock();
        table
            .queues
            .get(&target)
            .and_then(|queue| queue.granted_mode(txn_id))
            .is_some_and(|held| held.covers(mode))
    }

    pub fn held_locks(&self, txn_id: TxnId) -> Vec<LockTarget> {
        self.table
            .lock()
            .held
            .get(&txn_id)
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn deadlock_count(&self) -> u64 {
        self.deadlocks.load(Ordering::Relaxed)
    }

    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    fn is_granted(&self, table: &LockTable, txn_id: TxnId, target: LockTarget, mode: LockMode) -> bool {
        table
            .queues
            .get(&target)
            .and_then(|queue| queue.granted_mode(txn_id))
            .is_some_and(|held| held.covers(mode))
    }

    fn refresh_edges(&self, table: &mut LockTable, txn_id: TxnId, target: LockTarget, mode: LockMode) {
        let blockers = table
            .queues
            .get(&target)
            .map(|queue| queue.blockers(txn_id, mode))
            .unwrap_or_default();
        table.wait_for.insert(txn_id, blockers);
        table.waiting_on.insert(txn_id, target);
    }

    fn flag_victim(&self, table: &mut LockTable, victim: TxnId) {
        table.victims.insert(victim);
        if let Some(target) = table.waiting_on.get(&victim).copied() {
            if let Some(queue) = table.queues.get(&target) {
                queue.cv.notify_all();
            }
        }
    }
}
