// Row-granularity two-phase locking with wound-wait deadlock prevention:
// an older transaction aborts younger conflicting holders; a younger
// transaction waits for older ones.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use log::warn;
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TxnId};
use crate::transaction::concurrency::transaction::{IsolationLevel, Transaction, TransactionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct LockRequest {
    txn: Arc<Transaction>,
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

struct LockRequestQueue {
    queue: VecDeque<LockRequest>,
    // Notifies blocked requesters on this rid; always paired with the
    // manager latch.
    cv: Arc<Condvar>,
    // txn_id of an in-flight upgrade, if any
    upgrading: Option<TxnId>,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            cv: Arc::new(Condvar::new()),
            upgrading: None,
        }
    }
}

enum ScanOutcome {
    Proceed,
    Wait,
}

/// LockManager arbitrates transactions asking for row locks.
///
/// A single latch serializes all lock decisions; waiters sleep on the
/// per-row condition variable with the latch released. A wounded waiter
/// observes its `Aborted` state on wakeup and gives up.
pub struct LockManager {
    latch: Mutex<HashMap<Rid, LockRequestQueue>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            latch: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a shared lock on `rid`. Returns `false` if the transaction
    /// is or becomes aborted. A blocked requester stays in the queue
    /// ungranted so an older exclusive requester can wound it there.
    pub fn lock_shared(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        let mut table = self.latch.lock();

        loop {
            if txn.state() == TransactionState::Aborted {
                return false;
            }
            // Reads don't lock under READ_UNCOMMITTED; asking is a contract
            // violation.
            if txn.isolation_level() == IsolationLevel::ReadUncommitted {
                txn.set_state(TransactionState::Aborted);
                return false;
            }
            if txn.isolation_level() == IsolationLevel::RepeatableRead
                && txn.state() != TransactionState::Growing
            {
                txn.set_state(TransactionState::Aborted);
                return false;
            }
            if txn.is_shared_locked(rid) || txn.is_exclusive_locked(rid) {
                return true;
            }

            let queue = table.entry(rid).or_insert_with(LockRequestQueue::new);
            if !queue.queue.iter().any(|entry| entry.txn_id == txn.id()) {
                queue.queue.push_back(LockRequest {
                    txn: txn.clone(),
                    txn_id: txn.id(),
                    mode: LockMode::Shared,
                    granted: false,
                });
            }

            match Self::wound_or_wait_shared(queue, txn, rid) {
                ScanOutcome::Proceed => {
                    let request = queue
                        .queue
                        .iter_mut()
                        .find(|entry| entry.txn_id == txn.id())
                        .expect("own pending request present");
                    request.granted = true;
                    txn.add_shared_lock(rid);
                    txn.set_state(TransactionState::Growing);
                    return true;
                }
                ScanOutcome::Wait => {
                    let cv = queue.cv.clone();
                    cv.wait(&mut table);
                }
            }
        }
    }

    /// Acquire an exclusive lock on `rid`. Under wound-wait an exclusive
    /// requester never waits: it wounds every younger entry, and wounds
    /// itself if any older transaction is in the queue.
    pub fn lock_exclusive(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        let mut table = self.latch.lock();

        if txn.state() == TransactionState::Aborted {
            return false;
        }
        if txn.isolation_level() == IsolationLevel::RepeatableRead
            && txn.state() != TransactionState::Growing
        {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        if txn.is_exclusive_locked(rid) {
            return true;
        }

        let queue = table.entry(rid).or_insert_with(LockRequestQueue::new);
        let mut i = 0;
        while i < queue.queue.len() {
            let entry_txn_id = queue.queue[i].txn_id;
            if entry_txn_id > txn.id() {
                Self::wound(queue, i, rid, txn.id());
            } else if entry_txn_id < txn.id() {
                // Older holders never yield to a younger writer.
                warn!(
                    "txn {} aborts itself requesting exclusive lock on {} held by older txn {}",
                    txn.id(),
                    rid,
                    entry_txn_id
                );
                txn.set_state(TransactionState::Aborted);
                return false;
            } else {
                i += 1;
            }
        }

        queue.queue.push_back(LockRequest {
            txn: txn.clone(),
            txn_id: txn.id(),
            mode: LockMode::Exclusive,
            granted: true,
        });
        txn.add_exclusive_lock(rid);
        txn.set_state(TransactionState::Growing);
        true
    }

    /// Upgrade a held shared lock to exclusive. Wounds younger entries of
    /// any mode, waits out older ones, then rewrites the remaining shared
    /// request in place.
    pub fn lock_upgrade(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        let mut table = self.latch.lock();

        loop {
            if txn.state() == TransactionState::Aborted {
                Self::clear_upgrading(&mut table, rid, txn.id());
                return false;
            }
            if txn.isolation_level() == IsolationLevel::RepeatableRead
                && txn.state() != TransactionState::Growing
            {
                txn.set_state(TransactionState::Aborted);
                Self::clear_upgrading(&mut table, rid, txn.id());
                return false;
            }
            if !txn.is_shared_locked(rid) {
                txn.set_state(TransactionState::Aborted);
                return false;
            }
            if txn.is_exclusive_locked(rid) {
                return true;
            }

            let queue = table.entry(rid).or_insert_with(LockRequestQueue::new);
            let mut must_wait = false;
            let mut i = 0;
            while i < queue.queue.len() {
                let entry_txn_id = queue.queue[i].txn_id;
                if entry_txn_id > txn.id() {
                    Self::wound(queue, i, rid, txn.id());
                } else if entry_txn_id < txn.id() {
                    must_wait = true;
                    break;
                } else {
                    i += 1;
                }
            }

            if must_wait {
                queue.upgrading = Some(txn.id());
                let cv = queue.cv.clone();
                cv.wait(&mut table);
                continue;
            }

            // Only the requester's granted shared entry can remain.
            assert!(
                queue.queue.len() == 1 && queue.queue[0].txn_id == txn.id() && queue.queue[0].granted,
                "upgrade on {} found unexpected queue state",
                rid
            );
            let request = queue.queue.front_mut().expect("queue verified non-empty");
            request.mode = LockMode::Exclusive;
            request.granted = true;
            queue.upgrading = None;

            txn.remove_shared_lock(rid);
            txn.add_exclusive_lock(rid);
            txn.set_state(TransactionState::Growing);
            return true;
        }
    }

    /// Release this transaction's lock on `rid`. The first release under
    /// REPEATABLE_READ moves the transaction into its shrinking phase.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> bool {
        let mut table = self.latch.lock();

        if !txn.is_shared_locked(rid) && !txn.is_exclusive_locked(rid) {
            return false;
        }

        if txn.isolation_level() == IsolationLevel::RepeatableRead
            && txn.state() == TransactionState::Growing
        {
            txn.set_state(TransactionState::Shrinking);
        }

        if let Some(queue) = table.get_mut(&rid) {
            queue.queue.retain(|entry| entry.txn_id != txn.id());
            queue.cv.notify_all();
        }
        txn.remove_shared_lock(rid);
        txn.remove_exclusive_lock(rid);
        true
    }

    /// Scan the queue on behalf of a shared requester: younger exclusive
    /// entries are wounded, an older exclusive entry forces a wait.
    fn wound_or_wait_shared(queue: &mut LockRequestQueue, txn: &Transaction, rid: Rid) -> ScanOutcome {
        let mut i = 0;
        while i < queue.queue.len() {
            let entry_txn_id = queue.queue[i].txn_id;
            let entry_mode = queue.queue[i].mode;
            if entry_txn_id > txn.id() && entry_mode == LockMode::Exclusive {
                Self::wound(queue, i, rid, txn.id());
            } else if entry_txn_id < txn.id() && entry_mode == LockMode::Exclusive {
                return ScanOutcome::Wait;
            } else {
                i += 1;
            }
        }
        ScanOutcome::Proceed
    }

    /// Abort the younger transaction at queue position `i`: state first,
    /// then its lock bookkeeping, then the queue entry. Waiters are
    /// notified so a wounded one can observe its aborted state.
    fn wound(queue: &mut LockRequestQueue, i: usize, rid: Rid, by: TxnId) {
        let victim = queue.queue.remove(i).expect("victim index in bounds");
        victim.txn.set_state(TransactionState::Aborted);
        match victim.mode {
            LockMode::Shared => victim.txn.remove_shared_lock(rid),
            LockMode::Exclusive => victim.txn.remove_exclusive_lock(rid),
        }
        if queue.upgrading == Some(victim.txn_id) {
            queue.upgrading = None;
        }
        warn!("txn {} wounds txn {} on {}", by, victim.txn_id, rid);
        queue.cv.notify_all();
    }

    fn clear_upgrading(table: &mut HashMap<Rid, LockRequestQueue>, rid: Rid, txn_id: TxnId) {
        if let Some(queue) = table.get_mut(&rid) {
            if queue.upgrading == Some(txn_id) {
                queue.upgrading = None;
            }
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(id: TxnId, level: IsolationLevel) -> Arc<Transaction> {
        Arc::new(Transaction::new(id, level))
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lm = LockManager::new();
        let rid = Rid::new(1, 0);
        let t1 = txn(1, IsolationLevel::RepeatableRead);
        let t2 = txn(2, IsolationLevel::RepeatableRead);

        assert!(lm.lock_shared(&t1, rid));
        assert!(lm.lock_shared(&t2, rid));
        assert!(t1.is_shared_locked(rid));
        assert!(t2.is_shared_locked(rid));
    }

    #[test]
    fn test_shared_lock_is_illegal_under_read_uncommitted() {
        let lm = LockManager::new();
        let rid = Rid::new(1, 0);
        let t1 = txn(1, IsolationLevel::ReadUncommitted);

        assert!(!lm.lock_shared(&t1, rid));
        assert_eq!(t1.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_exclusive_lock_under_read_uncommitted_is_legal() {
        let lm = LockManager::new();
        let rid = Rid::new(1, 0);
        let t1 = txn(1, IsolationLevel::ReadUncommitted);

        assert!(lm.lock_exclusive(&t1, rid));
        assert!(t1.is_exclusive_locked(rid));
    }

    #[test]
    fn test_relock_held_lock_is_idempotent() {
        let lm = LockManager::new();
        let rid = Rid::new(1, 0);
        let t1 = txn(1, IsolationLevel::RepeatableRead);

        assert!(lm.lock_shared(&t1, rid));
        assert!(lm.lock_shared(&t1, rid));
        assert!(t1.is_shared_locked(rid));

        let t2 = txn(2, IsolationLevel::RepeatableRead);
        let rid2 = Rid::new(2, 0);
        assert!(lm.lock_exclusive(&t2, rid2));
        // Shared request while holding X succeeds without a second entry.
        assert!(lm.lock_shared(&t2, rid2));
        assert!(!t2.is_shared_locked(rid2));
    }

    #[test]
    fn test_older_writer_wounds_younger_holder() {
        let lm = LockManager::new();
        let rid = Rid::new(1, 0);
        let young = txn(5, IsolationLevel::RepeatableRead);
        let old = txn(1, IsolationLevel::RepeatableRead);

        assert!(lm.lock_exclusive(&young, rid));
        assert!(lm.lock_exclusive(&old, rid));

        assert_eq!(young.state(), TransactionState::Aborted);
        assert!(!young.is_exclusive_locked(rid));
        assert!(old.is_exclusive_locked(rid));
    }

    #[test]
    fn test_younger_writer_wounds_itself() {
        let lm = LockManager::new();
        let rid = Rid::new(1, 0);
        let old = txn(1, IsolationLevel::RepeatableRead);
        let young = txn(5, IsolationLevel::RepeatableRead);

        assert!(lm.lock_exclusive(&old, rid));
        assert!(!lm.lock_exclusive(&young, rid));

        assert_eq!(young.state(), TransactionState::Aborted);
        assert!(old.is_exclusive_locked(rid));
    }

    #[test]
    fn test_upgrade_sole_shared_holder() {
        let lm = LockManager::new();
        let rid = Rid::new(1, 0);
        let t1 = txn(1, IsolationLevel::RepeatableRead);

        assert!(lm.lock_shared(&t1, rid));
        assert!(lm.lock_upgrade(&t1, rid));
        assert!(t1.is_exclusive_locked(rid));
        assert!(!t1.is_shared_locked(rid));
    }

    #[test]
    fn test_upgrade_without_shared_lock_aborts() {
        let lm = LockManager::new();
        let rid = Rid::new(1, 0);
        let t1 = txn(1, IsolationLevel::RepeatableRead);

        assert!(!lm.lock_upgrade(&t1, rid));
        assert_eq!(t1.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_upgrade_wounds_younger_shared_holders() {
        let lm = LockManager::new();
        let rid = Rid::new(1, 0);
        let old = txn(1, IsolationLevel::RepeatableRead);
        let young = txn(7, IsolationLevel::RepeatableRead);

        assert!(lm.lock_shared(&old, rid));
        assert!(lm.lock_shared(&young, rid));
        assert!(lm.lock_upgrade(&old, rid));

        assert_eq!(young.state(), TransactionState::Aborted);
        assert!(old.is_exclusive_locked(rid));
        assert!(!young.is_shared_locked(rid));
    }

    #[test]
    fn test_unlock_without_lock_returns_false() {
        let lm = LockManager::new();
        let rid = Rid::new(1, 0);
        let t1 = txn(1, IsolationLevel::ReadCommitted);

        assert!(!lm.unlock(&t1, rid));
    }

    #[test]
    fn test_repeatable_read_shrinks_on_first_unlock() {
        let lm = LockManager::new();
        let r1 = Rid::new(1, 0);
        let r2 = Rid::new(1, 1);
        let t1 = txn(1, IsolationLevel::RepeatableRead);

        assert!(lm.lock_shared(&t1, r1));
        assert!(lm.lock_shared(&t1, r2));
        assert!(lm.unlock(&t1, r1));
        assert_eq!(t1.state(), TransactionState::Shrinking);

        // Acquisition after shrinking begins is a 2PL violation.
        assert!(!lm.lock_shared(&t1, Rid::new(1, 2)));
        assert_eq!(t1.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_read_committed_can_lock_while_shrinking() {
        let lm = LockManager::new();
        let r1 = Rid::new(1, 0);
        let r2 = Rid::new(1, 1);
        let t1 = txn(1, IsolationLevel::ReadCommitted);

        assert!(lm.lock_shared(&t1, r1));
        assert!(lm.unlock(&t1, r1));
        // No state transition for READ_COMMITTED; further shared locks are fine.
        assert!(lm.lock_shared(&t1, r2));
        assert!(t1.is_shared_locked(r2));
    }
}
