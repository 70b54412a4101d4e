use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use parking_lot::{Mutex, MutexGuard};
use log::debug;

use crate::common::types::{Frame, FrameId, FramePtr, Page, PageId, PagePtr, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;

/// Metadata guarded by the pool latch. Every public operation takes this
/// lock once and releases it before returning.
struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    next_page_id: PageId,
}

/// A fixed-size frame cache mediating all page access between callers and
/// the disk manager.
///
/// Page ids are allocated from a stripe: an instance with index `k` out of
/// `n` instances hands out ids `k, k+n, k+2n, ...`, so several instances
/// can share one disk file without id collisions.
pub struct BufferPoolManager {
    pool_size: usize,
    num_instances: u32,
    instance_index: u32,
    frames: Vec<FramePtr>,
    state: Mutex<PoolState>,
    replacer: LruReplacer,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    /// Create a single-instance pool backed by the database file at `db_path`.
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Self::new_multi(pool_size, 1, 0, disk_manager)
    }

    /// Create one instance of a striped pool. `instance_index` must be less
    /// than `num_instances`; all instances should share the disk manager.
    pub fn new_multi(
        pool_size: usize,
        num_instances: u32,
        instance_index: u32,
        disk_manager: Arc<DiskManager>,
    ) -> Result<Self, BufferPoolError> {
        assert!(num_instances > 0, "pool must have at least one instance");
        assert!(
            instance_index < num_instances,
            "instance index {} out of range for {} instances",
            instance_index,
            num_instances
        );

        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = i as FrameId;
            let page: PagePtr = Arc::new(parking_lot::RwLock::new(Page::new(INVALID_PAGE_ID)));
            frames.push(Arc::new(parking_lot::RwLock::new(Frame::new(frame_id, page))));
            free_list.push_back(frame_id);
        }

        Ok(Self {
            pool_size,
            num_instances,
            instance_index,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
                next_page_id: instance_index,
            }),
            replacer: LruReplacer::new(pool_size),
            disk_manager,
        })
    }

    /// Allocate a page id, reserve a frame for it, and return the page
    /// pinned once. Fails with `BufferPoolFull` when every frame is pinned;
    /// the allocated id is burned in that case.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut state = self.state.lock();

        let page_id = self.allocate_page(&mut state);

        let frame_id = match self.find_free_frame(&mut state) {
            Some(frame_id) => frame_id,
            None => return Err(BufferPoolError::BufferPoolFull),
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();

        self.update_page(&mut state, &mut frame_guard, page_id)?;
        frame_guard.pin_count = 1;
        self.replacer.pin(frame_id);

        Ok((frame_guard.page.clone(), page_id))
    }

    /// Fetch a page, reading it from disk if it is not resident. The page
    /// comes back with its pin count incremented.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "Cannot fetch invalid page ID".to_string(),
            ));
        }

        let mut state = self.state.lock();

        // Fast path: already resident.
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let frame = &self.frames[frame_id as usize];
            let mut frame_guard = frame.write();
            frame_guard.pin_count += 1;
            self.replacer.pin(frame_id);
            return Ok(frame_guard.page.clone());
        }

        let frame_id = match self.find_free_frame(&mut state) {
            Some(frame_id) => frame_id,
            None => return Err(BufferPoolError::BufferPoolFull),
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();

        self.update_page(&mut state, &mut frame_guard, page_id)?;

        {
            let mut page_guard = frame_guard.page.write();
            self.disk_manager.read_page(page_id, &mut page_guard)?;
        }

        frame_guard.pin_count = 1;
        frame_guard.is_dirty = false;
        self.replacer.pin(frame_id);

        Ok(frame_guard.page.clone())
    }

    /// Drop one pin on a page, OR-ing `is_dirty` into its dirty flag. When
    /// the pin count reaches zero the frame becomes eligible for eviction.
    /// Unpinning a page whose pin count is already zero is a no-op.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let state = self.state.lock();

        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Err(BufferPoolError::PageNotFound(page_id)),
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();

        if is_dirty {
            frame_guard.is_dirty = true;
        }

        if frame_guard.pin_count == 0 {
            return Ok(());
        }

        frame_guard.pin_count -= 1;
        if frame_guard.pin_count == 0 {
            self.replacer.unpin(frame_id);
        }

        Ok(())
    }

    /// Write a resident page back to disk and clear its dirty flag.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "Cannot flush invalid page ID".to_string(),
            ));
        }

        let state = self.state.lock();

        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Err(BufferPoolError::PageNotFound(page_id)),
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();
        {
            let page_guard = frame_guard.page.read();
            self.disk_manager.write_page(&page_guard)?;
        }
        frame_guard.is_dirty = false;

        Ok(())
    }

    /// Flush every resident dirty page.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let _state = self.state.lock();

        for frame in &self.frames {
            let mut frame_guard = frame.write();
            let needs_flush = {
                let page_guard = frame_guard.page.read();
                page_guard.page_id != INVALID_PAGE_ID && frame_guard.is_dirty
            };
            if needs_flush {
                let page_guard = frame_guard.page.read();
                self.disk_manager.write_page(&page_guard)?;
                drop(page_guard);
                frame_guard.is_dirty = false;
            }
        }

        Ok(())
    }

    /// Evict a page from the pool and return its frame to the free list.
    /// Deleting a non-resident page succeeds trivially; deleting a pinned
    /// page fails with `PagePinned`.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();

        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(()),
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();

        if frame_guard.pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        self.disk_manager.deallocate(page_id);
        self.update_page(&mut state, &mut frame_guard, INVALID_PAGE_ID)?;
        frame_guard.pin_count = 0;
        self.replacer.pin(frame_id);
        state.free_list.push_back(frame_id);

        Ok(())
    }

    /// Replace the page held by a frame. The displaced page is written back
    /// if dirty, the page table is fixed up on both sides, and the frame's
    /// payload is zeroed under `new_page_id`.
    fn update_page(
        &self,
        state: &mut MutexGuard<'_, PoolState>,
        frame_guard: &mut Frame,
        new_page_id: PageId,
    ) -> Result<(), BufferPoolError> {
        let old_page_id = frame_guard.page.read().page_id;

        if frame_guard.is_dirty {
            debug!("writing back dirty page {} before reuse of frame {}", old_page_id, frame_guard.frame_id);
            let page_guard = frame_guard.page.read();
            self.disk_manager.write_page(&page_guard)?;
            drop(page_guard);
            frame_guard.is_dirty = false;
        }

        state.page_table.remove(&old_page_id);
        if new_page_id != INVALID_PAGE_ID {
            state.page_table.insert(new_page_id, frame_guard.frame_id);
        }

        let mut page_guard = frame_guard.page.write();
        page_guard.data = [0; PAGE_SIZE];
        page_guard.page_id = new_page_id;

        Ok(())
    }

    /// Pick a frame for a new occupant: free list first, then the replacer.
    fn find_free_frame(&self, state: &mut MutexGuard<'_, PoolState>) -> Option<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Some(frame_id);
        }
        self.replacer.victim()
    }

    /// Hand out the next page id in this instance's stripe. Ids are burned
    /// even if the caller subsequently fails to reserve a frame.
    fn allocate_page(&self, state: &mut MutexGuard<'_, PoolState>) -> PageId {
        let page_id = state.next_page_id;
        state.next_page_id += self.num_instances;
        debug_assert_eq!(page_id % self.num_instances, self.instance_index);
        page_id
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of pages currently mapped to frames.
    pub fn resident_page_count(&self) -> usize {
        self.state.lock().page_table.len()
    }

    /// Number of frames on the free list.
    pub fn free_frame_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Number of frames the replacer could evict right now.
    pub fn evictable_frame_count(&self) -> usize {
        self.replacer.size()
    }
}
