use std::sync::Arc;
use std::thread;
use anyhow::Result;

use rookdb::common::types::Rid;
use rookdb::index::hash::{ExtendibleHashIndex, KeyHasher};
use rookdb::transaction::{IndexWriteOp, IsolationLevel, Transaction};

mod common;
use common::create_test_buffer_pool;

/// Maps each key to itself, so tests can aim keys at directory slots.
struct IdentityHasher;

impl KeyHasher<u32> for IdentityHasher {
    fn hash_key(&self, key: &u32) -> u32 {
        *key
    }
}

/// Collides every key, forcing splits that never redistribute.
struct ZeroHasher;

impl KeyHasher<u32> for ZeroHasher {
    fn hash_key(&self, _key: &u32) -> u32 {
        0
    }
}

fn test_txn() -> Transaction {
    Transaction::new(0, IsolationLevel::ReadCommitted)
}

#[test]
fn test_insert_and_get_value() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(16)?;
    let index = ExtendibleHashIndex::<u32, Rid>::new(buffer_pool)?;
    let txn = test_txn();

    assert!(index.insert(&txn, &10, &Rid::new(1, 0))?);
    assert!(index.insert(&txn, &10, &Rid::new(1, 1))?);
    assert!(index.insert(&txn, &20, &Rid::new(2, 0))?);

    let mut values = index.get_value(&10)?;
    values.sort();
    assert_eq!(values, vec![Rid::new(1, 0), Rid::new(1, 1)]);
    assert_eq!(index.get_value(&20)?, vec![Rid::new(2, 0)]);
    assert!(index.get_value(&30)?.is_empty());

    Ok(())
}

#[test]
fn test_duplicate_pair_rejected() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(16)?;
    let index = ExtendibleHashIndex::<u32, Rid>::new(buffer_pool)?;
    let txn = test_txn();

    assert!(index.insert(&txn, &10, &Rid::new(1, 0))?);
    assert!(!index.insert(&txn, &10, &Rid::new(1, 0))?);
    assert_eq!(index.get_value(&10)?.len(), 1);

    Ok(())
}

#[test]
fn test_insert_then_remove_round_trip() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(16)?;
    let index = ExtendibleHashIndex::<u32, Rid>::new(buffer_pool)?;
    let txn = test_txn();

    for i in 0..50u32 {
        assert!(index.insert(&txn, &i, &Rid::new(i, 0))?);
    }
    for i in 0..50u32 {
        assert!(index.remove(&txn, &i, &Rid::new(i, 0))?);
    }
    for i in 0..50u32 {
        assert!(index.get_value(&i)?.is_empty());
    }

    // Removing again finds nothing
    assert!(!index.remove(&txn, &0, &Rid::new(0, 0))?);

    Ok(())
}

#[test]
fn test_overflow_splits_bucket_and_doubles_directory() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(16)?;
    let index =
        ExtendibleHashIndex::<u32, Rid, IdentityHasher>::with_bucket_capacity(buffer_pool, IdentityHasher, 4)?;
    let txn = test_txn();

    // All five keys address directory slot 0 while the depth is 0
    for key in 0..5u32 {
        assert!(index.insert(&txn, &key, &Rid::new(key, 0))?);
    }

    assert_eq!(index.global_depth()?, 1);
    assert_eq!(index.local_depth(0)?, 1);
    assert_eq!(index.local_depth(1)?, 1);
    index.verify_integrity()?;

    for key in 0..5u32 {
        assert_eq!(index.get_value(&key)?, vec![Rid::new(key, 0)]);
    }

    Ok(())
}

#[test]
fn test_emptied_bucket_merges_into_split_image() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(16)?;
    let index =
        ExtendibleHashIndex::<u32, Rid, IdentityHasher>::with_bucket_capacity(buffer_pool, IdentityHasher, 4)?;
    let txn = test_txn();

    for key in 0..5u32 {
        assert!(index.insert(&txn, &key, &Rid::new(key, 0))?);
    }
    assert_eq!(index.global_depth()?, 1);

    // Empty the odd bucket; it must fold back into its sibling
    assert!(index.remove(&txn, &1, &Rid::new(1, 0))?);
    assert!(index.remove(&txn, &3, &Rid::new(3, 0))?);
    assert_eq!(index.global_depth()?, 0);
    index.verify_integrity()?;

    for key in [0u32, 2, 4] {
        assert_eq!(index.get_value(&key)?, vec![Rid::new(key, 0)]);
    }

    for key in [0u32, 2, 4] {
        assert!(index.remove(&txn, &key, &Rid::new(key, 0))?);
    }
    for key in 0..5u32 {
        assert!(index.get_value(&key)?.is_empty());
    }
    index.verify_integrity()?;

    Ok(())
}

#[test]
fn test_unsplittable_bucket_fails_at_max_depth() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(32)?;
    let index =
        ExtendibleHashIndex::<u32, Rid, ZeroHasher>::with_bucket_capacity(buffer_pool, ZeroHasher, 4)?;
    let txn = test_txn();

    // Four colliding pairs fit; the fifth can never be separated by
    // splitting, so the insert gives up at the depth ceiling.
    for i in 0..4u32 {
        assert!(index.insert(&txn, &0, &Rid::new(0, i))?);
    }
    assert!(!index.insert(&txn, &0, &Rid::new(0, 4))?);

    assert_eq!(index.get_value(&0)?.len(), 4);
    index.verify_integrity()?;

    Ok(())
}

#[test]
fn test_index_write_set_records_mutations() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(16)?;
    let index = ExtendibleHashIndex::<u32, Rid>::new(buffer_pool)?;
    let txn = test_txn();

    assert!(index.insert(&txn, &7, &Rid::new(7, 0))?);
    assert!(index.remove(&txn, &7, &Rid::new(7, 0))?);
    // Failed operations record nothing
    assert!(!index.remove(&txn, &7, &Rid::new(7, 0))?);

    let writes = txn.take_index_writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].op, IndexWriteOp::Insert);
    assert_eq!(writes[1].op, IndexWriteOp::Delete);
    assert_eq!(writes[0].key, writes[1].key);

    Ok(())
}

#[test]
fn test_concurrent_inserts_and_reads() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64)?;
    let index = Arc::new(ExtendibleHashIndex::<u32, Rid>::new(buffer_pool)?);

    let mut handles = Vec::new();
    for worker in 0..4u32 {
        let index = index.clone();
        handles.push(thread::spawn(move || {
            let txn = Transaction::new(worker, IsolationLevel::ReadCommitted);
            for i in 0..100u32 {
                let key = worker * 100 + i;
                index.insert(&txn, &key, &Rid::new(key, 0)).unwrap();
                // Interleave reads of our own writes
                assert_eq!(index.get_value(&key).unwrap(), vec![Rid::new(key, 0)]);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for key in 0..400u32 {
        assert_eq!(index.get_value(&key)?, vec![Rid::new(key, 0)]);
    }
    index.verify_integrity()?;

    Ok(())
}
