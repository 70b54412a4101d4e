// Export public modules
pub mod common;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use common::types::{Rid, PAGE_SIZE};
pub use index::hash::ExtendibleHashIndex;
pub use storage::buffer::BufferPoolError;
pub use storage::buffer::BufferPoolManager;
pub use transaction::{IsolationLevel, LockManager, Transaction, TransactionManager, TransactionState};
