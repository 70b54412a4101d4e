// Represents an active database transaction and the bookkeeping the lock
// manager and index maintain on its behalf.

use std::collections::HashSet;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Rid, TxnId};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking states plus the two terminal states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Errors that can occur during transaction processing
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} is already committed or aborted")]
    InvalidState(TxnId),

    #[error("Internal transaction error: {0}")]
    InternalError(String),
}

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexWriteOp {
    Insert,
    Delete,
}

/// One index mutation performed on behalf of a transaction, recorded so an
/// abort can undo it. Key and value are kept in their on-page encoding.
#[derive(Debug, Clone)]
pub struct IndexWriteRecord {
    pub op: IndexWriteOp,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl IndexWriteRecord {
    pub fn new(op: IndexWriteOp, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { op, key, value }
    }
}

/// Transaction - represents an active database transaction.
///
/// All mutable bookkeeping sits behind its own lock because the lock
/// manager mutates other transactions (wound-wait) from foreign threads.
pub struct Transaction {
    /// Transaction ID; lower means older
    id: TxnId,

    /// Isolation level for this transaction
    isolation_level: IsolationLevel,

    /// Current two-phase-locking state
    state: Mutex<TransactionState>,

    /// Row ids this transaction holds shared locks on
    shared_lock_set: Mutex<HashSet<Rid>>,

    /// Row ids this transaction holds exclusive locks on
    exclusive_lock_set: Mutex<HashSet<Rid>>,

    /// Index mutations to undo on abort, in execution order
    index_write_set: Mutex<Vec<IndexWriteRecord>>,
}

impl Transaction {
    pub fn new(txn_id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id: txn_id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            index_write_set: Mutex::new(Vec::new()),
        }
    }

    /// Get transaction ID
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Get transaction isolation level
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// Get transaction state
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Set transaction state
    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn is_shared_locked(&self, rid: Rid) -> bool {
        self.shared_lock_set.lock().contains(&rid)
    }

    pub fn is_exclusive_locked(&self, rid: Rid) -> bool {
        self.exclusive_lock_set.lock().contains(&rid)
    }

    pub fn add_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub fn remove_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().remove(&rid);
    }

    pub fn add_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub fn remove_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().remove(&rid);
    }

    /// Every row id this transaction currently holds a lock on.
    pub fn locked_rids(&self) -> Vec<Rid> {
        let mut rids: Vec<Rid> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids
    }

    pub fn append_index_write(&self, record: IndexWriteRecord) {
        self.index_write_set.lock().push(record);
    }

    /// Drain the recorded index mutations, most recent last. The caller
    /// undoes them in reverse order.
    pub fn take_index_writes(&self) -> Vec<IndexWriteRecord> {
        std::mem::take(&mut *self.index_write_set.lock())
    }
}
