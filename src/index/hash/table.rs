use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use log::debug;
use parking_lot::RwLock;

use crate::common::types::{Page, PageId};
use crate::index::hash::bucket_page::BucketPage;
use crate::index::hash::codec::FixedCodec;
use crate::index::hash::directory_page::{DirectoryPage, MAX_GLOBAL_DEPTH};
use crate::index::hash::error::HashIndexError;
use crate::storage::buffer::BufferPoolManager;
use crate::transaction::{IndexWriteOp, IndexWriteRecord, Transaction};

/// Hash function injected into the index, 32 bits of which address the
/// directory.
pub trait KeyHasher<K>: Send + Sync {
    fn hash_key(&self, key: &K) -> u32;
}

/// SipHash via the standard hasher, truncated to 32 bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyHasher;

impl<K: Hash> KeyHasher<K> for DefaultKeyHasher {
    fn hash_key(&self, key: &K) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as u32
    }
}

/// Disk-resident extendible hash index over the buffer pool.
///
/// A single directory page maps the low `global_depth` bits of a key's
/// hash to bucket pages; buckets split (doubling the directory when
/// needed) on overflow and merge back into their split images when
/// emptied. The table latch arbitrates between point operations, which
/// take it shared and then latch the one bucket they touch, and
/// restructuring (`split_insert` / `merge_at`), which takes it exclusive.
pub struct ExtendibleHashIndex<K, V, H = DefaultKeyHasher> {
    buffer_pool: Arc<BufferPoolManager>,
    directory_page_id: PageId,
    table_latch: RwLock<()>,
    layout: BucketPage<K, V>,
    hasher: H,
}

impl<K, V> ExtendibleHashIndex<K, V, DefaultKeyHasher>
where
    K: FixedCodec + Hash,
    V: FixedCodec,
{
    /// Create an index with the standard hasher and a bucket capacity
    /// that fills each page.
    pub fn new(buffer_pool: Arc<BufferPoolManager>) -> Result<Self, HashIndexError> {
        Self::with_hasher(buffer_pool, DefaultKeyHasher)
    }
}

impl<K, V, H> ExtendibleHashIndex<K, V, H>
where
    K: FixedCodec,
    V: FixedCodec,
    H: KeyHasher<K>,
{
    pub fn with_hasher(buffer_pool: Arc<BufferPoolManager>, hasher: H) -> Result<Self, HashIndexError> {
        Self::with_layout(buffer_pool, hasher, BucketPage::new())
    }

    /// Cap the bucket capacity below what the page allows; exercises
    /// splits without thousands of insertions.
    pub fn with_bucket_capacity(
        buffer_pool: Arc<BufferPoolManager>,
        hasher: H,
        bucket_capacity: usize,
    ) -> Result<Self, HashIndexError> {
        Self::with_layout(buffer_pool, hasher, BucketPage::with_capacity(bucket_capacity))
    }

    fn with_layout(
        buffer_pool: Arc<BufferPoolManager>,
        hasher: H,
        layout: BucketPage<K, V>,
    ) -> Result<Self, HashIndexError> {
        let (dir_page, directory_page_id) = buffer_pool.new_page()?;
        let (_bucket_page, bucket_page_id) = buffer_pool.new_page()?;

        {
            let mut dir_guard = dir_page.write();
            DirectoryPage::init(&mut dir_guard, directory_page_id);
            DirectoryPage::set_bucket_page_id(&mut dir_guard, 0, bucket_page_id);
            DirectoryPage::set_local_depth(&mut dir_guard, 0, 0);
        }

        buffer_pool.unpin_page(directory_page_id, true)?;
        buffer_pool.unpin_page(bucket_page_id, true)?;

        Ok(Self {
            buffer_pool,
            directory_page_id,
            table_latch: RwLock::new(()),
            layout,
            hasher,
        })
    }

    fn dir_index(&self, dir: &Page, key: &K) -> u32 {
        self.hasher.hash_key(key) & DirectoryPage::global_depth_mask(dir)
    }

    /// Collect every value stored under `key`.
    pub fn get_value(&self, key: &K) -> Result<Vec<V>, HashIndexError> {
        let _table_guard = self.table_latch.read();

        let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let bucket_page_id = {
            let dir_guard = dir_page.read();
            DirectoryPage::bucket_page_id(&dir_guard, self.dir_index(&dir_guard, key))
        };

        let bucket_page = self.buffer_pool.fetch_page(bucket_page_id)?;
        let result = {
            let bucket_guard = bucket_page.read();
            self.layout.get_value(&bucket_guard, key)
        };

        self.buffer_pool.unpin_page(bucket_page_id, false)?;
        self.buffer_pool.unpin_page(self.directory_page_id, false)?;

        Ok(result)
    }

    /// Insert `(key, value)`, splitting the target bucket if it is full.
    /// Returns `false` for an exact duplicate pair, and when the bucket
    /// chain is already at maximum depth.
    pub fn insert(&self, txn: &Transaction, key: &K, value: &V) -> Result<bool, HashIndexError> {
        let (was_full, inserted) = {
            let _table_guard = self.table_latch.read();

            let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
            let bucket_page_id = {
                let dir_guard = dir_page.read();
                DirectoryPage::bucket_page_id(&dir_guard, self.dir_index(&dir_guard, key))
            };

            let bucket_page = self.buffer_pool.fetch_page(bucket_page_id)?;
            let (was_full, inserted) = {
                let mut bucket_guard = bucket_page.write();
                if self.layout.is_full(&bucket_guard) {
                    (true, false)
                } else {
                    (false, self.layout.insert(&mut bucket_guard, key, value))
                }
            };

            self.buffer_pool.unpin_page(bucket_page_id, inserted)?;
            self.buffer_pool.unpin_page(self.directory_page_id, false)?;
            (was_full, inserted)
        };

        if was_full {
            return self.split_insert(txn, key, value);
        }

        if inserted {
            txn.append_index_write(IndexWriteRecord::new(
                IndexWriteOp::Insert,
                key.encode_to_vec(),
                value.encode_to_vec(),
            ));
        }
        Ok(inserted)
    }

    /// Slow insert path: split the overflowing bucket under the exclusive
    /// table latch, then retry. The retry terminates because the bucket's
    /// local depth strictly increases, and splitting is refused at
    /// `MAX_GLOBAL_DEPTH`.
    fn split_insert(&self, txn: &Transaction, key: &K, value: &V) -> Result<bool, HashIndexError> {
        {
            let _table_guard = self.table_latch.write();

            let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
            let mut dir_guard = dir_page.write();

            let bucket_idx = self.dir_index(&dir_guard, key);
            let local_depth = DirectoryPage::local_depth(&dir_guard, bucket_idx);

            if local_depth == MAX_GLOBAL_DEPTH {
                drop(dir_guard);
                self.buffer_pool.unpin_page(self.directory_page_id, false)?;
                return Ok(false);
            }

            let bucket_page_id = DirectoryPage::bucket_page_id(&dir_guard, bucket_idx);
            let bucket_page = self.buffer_pool.fetch_page(bucket_page_id)?;
            let mut bucket_guard = bucket_page.write();

            // A concurrent remove may have made room before we re-latched.
            if !self.layout.is_full(&bucket_guard) {
                let inserted = self.layout.insert(&mut bucket_guard, key, value);
                drop(bucket_guard);
                self.buffer_pool.unpin_page(bucket_page_id, inserted)?;
                drop(dir_guard);
                self.buffer_pool.unpin_page(self.directory_page_id, false)?;
                if inserted {
                    txn.append_index_write(IndexWriteRecord::new(
                        IndexWriteOp::Insert,
                        key.encode_to_vec(),
                        value.encode_to_vec(),
                    ));
                }
                return Ok(inserted);
            }

            self.layout.log_occupancy(&bucket_guard);

            if local_depth == DirectoryPage::global_depth(&dir_guard) {
                DirectoryPage::incr_global_depth(&mut dir_guard);
            }
            DirectoryPage::incr_local_depth(&mut dir_guard, bucket_idx);
            let new_local_depth = local_depth + 1;

            let old_pairs = self.layout.all_pairs(&bucket_guard);
            self.layout.reset(&mut bucket_guard);

            let (image_page, image_page_id) = self.buffer_pool.new_page()?;
            let mut image_guard = image_page.write();

            let image_idx = DirectoryPage::split_image_index(&dir_guard, bucket_idx);
            DirectoryPage::set_local_depth(&mut dir_guard, image_idx, new_local_depth);
            DirectoryPage::set_bucket_page_id(&mut dir_guard, image_idx, image_page_id);

            debug!(
                "split bucket page {} (directory index {}) into page {} at local depth {}",
                bucket_page_id, bucket_idx, image_page_id, new_local_depth
            );

            // Rehash under the widened mask; each pair lands in the old
            // bucket or its image, never elsewhere.
            let local_mask = DirectoryPage::local_depth_mask(&dir_guard, bucket_idx);
            for (old_key, old_value) in &old_pairs {
                let target_idx = self.hasher.hash_key(old_key) & local_mask;
                if target_idx == bucket_idx & local_mask {
                    assert!(self.layout.insert(&mut bucket_guard, old_key, old_value));
                } else {
                    assert!(self.layout.insert(&mut image_guard, old_key, old_value));
                }
            }

            // Every directory entry sharing either prefix must carry the
            // new target and depth.
            let stride = 1u32 << new_local_depth;
            let size = DirectoryPage::size(&dir_guard);
            let mut idx = bucket_idx & local_mask;
            while idx < size {
                DirectoryPage::set_bucket_page_id(&mut dir_guard, idx, bucket_page_id);
                DirectoryPage::set_local_depth(&mut dir_guard, idx, new_local_depth);
                idx += stride;
            }
            let mut idx = image_idx & local_mask;
            while idx < size {
                DirectoryPage::set_bucket_page_id(&mut dir_guard, idx, image_page_id);
                DirectoryPage::set_local_depth(&mut dir_guard, idx, new_local_depth);
                idx += stride;
            }

            drop(bucket_guard);
            drop(image_guard);
            self.buffer_pool.unpin_page(bucket_page_id, true)?;
            self.buffer_pool.unpin_page(image_page_id, true)?;
            drop(dir_guard);
            self.buffer_pool.unpin_page(self.directory_page_id, true)?;
        }

        self.insert(txn, key, value)
    }

    /// Tombstone `(key, value)` in its bucket. An emptied bucket is
    /// offered back to its split image afterwards.
    pub fn remove(&self, txn: &Transaction, key: &K, value: &V) -> Result<bool, HashIndexError> {
        let (removed, now_empty) = {
            let _table_guard = self.table_latch.read();

            let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
            let bucket_page_id = {
                let dir_guard = dir_page.read();
                DirectoryPage::bucket_page_id(&dir_guard, self.dir_index(&dir_guard, key))
            };

            let bucket_page = self.buffer_pool.fetch_page(bucket_page_id)?;
            let (removed, now_empty) = {
                let mut bucket_guard = bucket_page.write();
                let removed = self.layout.remove(&mut bucket_guard, key, value);
                (removed, self.layout.is_empty(&bucket_guard))
            };

            self.buffer_pool.unpin_page(bucket_page_id, removed)?;
            self.buffer_pool.unpin_page(self.directory_page_id, false)?;
            (removed, now_empty)
        };

        if removed {
            txn.append_index_write(IndexWriteRecord::new(
                IndexWriteOp::Delete,
                key.encode_to_vec(),
                value.encode_to_vec(),
            ));
        }
        if removed && now_empty {
            self.merge(key)?;
        }
        Ok(removed)
    }

    /// Fold the emptied bucket addressed by `key` into its split image,
    /// then sweep the directory for any other empty siblings uncovered by
    /// the depth changes.
    fn merge(&self, key: &K) -> Result<(), HashIndexError> {
        let (bucket_idx, dir_size) = {
            let _table_guard = self.table_latch.read();

            let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
            let (bucket_idx, dir_size) = {
                let dir_guard = dir_page.read();
                (self.dir_index(&dir_guard, key), DirectoryPage::size(&dir_guard))
            };
            self.buffer_pool.unpin_page(self.directory_page_id, false)?;
            (bucket_idx, dir_size)
        };

        self.merge_at(bucket_idx)?;
        for idx in 0..dir_size {
            self.merge_at(idx)?;
        }
        Ok(())
    }

    /// Merge the bucket at one directory index into its split image, if
    /// the pair is still mergeable once the exclusive latch is held.
    fn merge_at(&self, bucket_idx: u32) -> Result<(), HashIndexError> {
        let _table_guard = self.table_latch.write();

        let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let mut dir_guard = dir_page.write();

        // The directory may have shrunk since the caller sampled its size.
        if bucket_idx >= DirectoryPage::size(&dir_guard) {
            drop(dir_guard);
            self.buffer_pool.unpin_page(self.directory_page_id, false)?;
            return Ok(());
        }

        let local_depth = DirectoryPage::local_depth(&dir_guard, bucket_idx);
        let image_idx = DirectoryPage::split_image_index(&dir_guard, bucket_idx);

        if local_depth == 0
            || local_depth != DirectoryPage::local_depth(&dir_guard, image_idx)
            || DirectoryPage::bucket_page_id(&dir_guard, bucket_idx)
                == DirectoryPage::bucket_page_id(&dir_guard, image_idx)
        {
            drop(dir_guard);
            self.buffer_pool.unpin_page(self.directory_page_id, false)?;
            return Ok(());
        }

        let bucket_page_id = DirectoryPage::bucket_page_id(&dir_guard, bucket_idx);
        let bucket_page = self.buffer_pool.fetch_page(bucket_page_id)?;
        let still_empty = {
            let bucket_guard = bucket_page.read();
            self.layout.is_empty(&bucket_guard)
        };
        self.buffer_pool.unpin_page(bucket_page_id, false)?;

        if !still_empty {
            drop(dir_guard);
            self.buffer_pool.unpin_page(self.directory_page_id, false)?;
            return Ok(());
        }

        self.buffer_pool.delete_page(bucket_page_id)?;

        let image_page_id = DirectoryPage::bucket_page_id(&dir_guard, image_idx);
        DirectoryPage::set_bucket_page_id(&mut dir_guard, bucket_idx, image_page_id);
        DirectoryPage::decr_local_depth(&mut dir_guard, bucket_idx);
        DirectoryPage::decr_local_depth(&mut dir_guard, image_idx);
        let new_local_depth = DirectoryPage::local_depth(&dir_guard, image_idx);

        debug!(
            "merged bucket page {} into {} at local depth {}",
            bucket_page_id, image_page_id, new_local_depth
        );

        // Both the dead page and its survivor may be referenced from other
        // directory entries now that the depth dropped.
        let size = DirectoryPage::size(&dir_guard);
        for idx in 0..size {
            let page_id = DirectoryPage::bucket_page_id(&dir_guard, idx);
            if page_id == bucket_page_id || page_id == image_page_id {
                DirectoryPage::set_bucket_page_id(&mut dir_guard, idx, image_page_id);
                DirectoryPage::set_local_depth(&mut dir_guard, idx, new_local_depth);
            }
        }

        while DirectoryPage::can_shrink(&dir_guard) {
            DirectoryPage::decr_global_depth(&mut dir_guard);
        }

        drop(dir_guard);
        self.buffer_pool.unpin_page(self.directory_page_id, true)?;
        Ok(())
    }

    pub fn global_depth(&self) -> Result<u32, HashIndexError> {
        let _table_guard = self.table_latch.read();

        let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let depth = {
            let dir_guard = dir_page.read();
            DirectoryPage::global_depth(&dir_guard)
        };
        self.buffer_pool.unpin_page(self.directory_page_id, false)?;
        Ok(depth)
    }

    pub fn local_depth(&self, directory_idx: u32) -> Result<u32, HashIndexError> {
        let _table_guard = self.table_latch.read();

        let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let depth = {
            let dir_guard = dir_page.read();
            DirectoryPage::local_depth(&dir_guard, directory_idx)
        };
        self.buffer_pool.unpin_page(self.directory_page_id, false)?;
        Ok(depth)
    }

    /// Assert the directory invariants; panics on violation.
    pub fn verify_integrity(&self) -> Result<(), HashIndexError> {
        let _table_guard = self.table_latch.read();

        let dir_page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        {
            let dir_guard = dir_page.read();
            DirectoryPage::verify_integrity(&dir_guard);
        }
        self.buffer_pool.unpin_page(self.directory_page_id, false)?;
        Ok(())
    }
}
