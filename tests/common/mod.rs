use std::sync::Arc;
use tempfile::NamedTempFile;
use anyhow::Result;
use rookdb::storage::buffer::BufferPoolManager;
use rookdb::transaction::{LockManager, TransactionManager};

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<(NamedTempFile, String)> {
    let file = NamedTempFile::new()?;
    let path = file.path().to_str().unwrap().to_string();
    Ok((file, path))
}

// Create a buffer pool manager with a temporary database
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, path)?);
    Ok((buffer_pool, file))
}

// Create a transaction manager wired to a fresh lock manager
#[allow(dead_code)]
pub fn create_test_transaction_manager() -> (Arc<TransactionManager>, Arc<LockManager>) {
    let lock_manager = Arc::new(LockManager::new());
    let txn_manager = Arc::new(TransactionManager::new(lock_manager.clone()));
    (txn_manager, lock_manager)
}
