use std::marker::PhantomData;
use log::debug;

use crate::common::types::{Page, PAGE_SIZE};
use crate::index::hash::codec::FixedCodec;

/// Fixed-offset accessor for a hash bucket page.
///
/// Layout: `occupied: [u8; bitmap_len] | readable: [u8; bitmap_len] |
/// slots: [(key, value); capacity]`. A slot's `occupied` bit is set the
/// first time it is written and never cleared short of a bucket reset, so
/// removals leave tombstones; `readable` marks the slot as currently live.
///
/// The capacity is derived from the encoded key/value width so the slots
/// fill the page. All methods take the page explicitly; the latch on the
/// page is the caller's responsibility.
pub struct BucketPage<K, V> {
    capacity: usize,
    bitmap_len: usize,
    slot_size: usize,
    _phantom: PhantomData<(K, V)>,
}

impl<K: FixedCodec, V: FixedCodec> BucketPage<K, V> {
    /// Largest capacity whose two bitmaps and slot array fit in one page.
    pub fn natural_capacity() -> usize {
        let slot_size = K::ENCODED_SIZE + V::ENCODED_SIZE;
        let mut capacity = (PAGE_SIZE * 8) / (slot_size * 8 + 2);
        while 2 * capacity.div_ceil(8) + capacity * slot_size > PAGE_SIZE {
            capacity -= 1;
        }
        capacity
    }

    pub fn new() -> Self {
        Self::with_capacity(Self::natural_capacity())
    }

    /// A layout with a smaller capacity than the page allows. Useful for
    /// exercising splits without thousands of insertions.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity <= Self::natural_capacity());
        Self {
            capacity,
            bitmap_len: capacity.div_ceil(8),
            slot_size: K::ENCODED_SIZE + V::ENCODED_SIZE,
            _phantom: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_occupied(&self, page: &Page, slot: usize) -> bool {
        debug_assert!(slot < self.capacity);
        page.data[slot / 8] & (1 << (slot % 8)) != 0
    }

    fn set_occupied(&self, page: &mut Page, slot: usize) {
        page.data[slot / 8] |= 1 << (slot % 8);
    }

    pub fn is_readable(&self, page: &Page, slot: usize) -> bool {
        debug_assert!(slot < self.capacity);
        page.data[self.bitmap_len + slot / 8] & (1 << (slot % 8)) != 0
    }

    fn set_readable(&self, page: &mut Page, slot: usize) {
        page.data[self.bitmap_len + slot / 8] |= 1 << (slot % 8);
    }

    fn clear_readable(&self, page: &mut Page, slot: usize) {
        page.data[self.bitmap_len + slot / 8] &= !(1 << (slot % 8));
    }

    fn slot_offset(&self, slot: usize) -> usize {
        2 * self.bitmap_len + slot * self.slot_size
    }

    pub fn key_at(&self, page: &Page, slot: usize) -> K {
        let offset = self.slot_offset(slot);
        K::decode(&page.data[offset..offset + K::ENCODED_SIZE])
    }

    pub fn value_at(&self, page: &Page, slot: usize) -> V {
        let offset = self.slot_offset(slot) + K::ENCODED_SIZE;
        V::decode(&page.data[offset..offset + V::ENCODED_SIZE])
    }

    /// Collect every live value stored under `key`.
    pub fn get_value(&self, page: &Page, key: &K) -> Vec<V> {
        let mut result = Vec::new();
        for slot in 0..self.capacity {
            if self.is_readable(page, slot) && self.key_at(page, slot) == *key {
                result.push(self.value_at(page, slot));
            }
        }
        result
    }

    /// Insert into the first non-live slot. Rejects an exact duplicate
    /// `(key, value)` pair and a full bucket.
    pub fn insert(&self, page: &mut Page, key: &K, value: &V) -> bool {
        if self.is_full(page) {
            return false;
        }
        for slot in 0..self.capacity {
            if self.is_readable(page, slot)
                && self.key_at(page, slot) == *key
                && self.value_at(page, slot) == *value
            {
                return false;
            }
        }

        for slot in 0..self.capacity {
            if !self.is_readable(page, slot) {
                let offset = self.slot_offset(slot);
                key.encode(&mut page.data[offset..offset + K::ENCODED_SIZE]);
                value.encode(
                    &mut page.data[offset + K::ENCODED_SIZE..offset + self.slot_size],
                );
                self.set_occupied(page, slot);
                self.set_readable(page, slot);
                break;
            }
        }
        true
    }

    /// Tombstone the slot holding `(key, value)`: the readable bit is
    /// cleared, the occupied bit stays set.
    pub fn remove(&self, page: &mut Page, key: &K, value: &V) -> bool {
        for slot in 0..self.capacity {
            if self.is_readable(page, slot)
                && self.key_at(page, slot) == *key
                && self.value_at(page, slot) == *value
            {
                self.clear_readable(page, slot);
                return true;
            }
        }
        false
    }

    pub fn num_readable(&self, page: &Page) -> usize {
        page.data[self.bitmap_len..2 * self.bitmap_len]
            .iter()
            .map(|byte| byte.count_ones() as usize)
            .sum()
    }

    pub fn is_full(&self, page: &Page) -> bool {
        self.num_readable(page) == self.capacity
    }

    pub fn is_empty(&self, page: &Page) -> bool {
        self.num_readable(page) == 0
    }

    /// Snapshot all live pairs, for redistribution during a split.
    pub fn all_pairs(&self, page: &Page) -> Vec<(K, V)> {
        let mut pairs = Vec::new();
        for slot in 0..self.capacity {
            if self.is_readable(page, slot) {
                pairs.push((self.key_at(page, slot), self.value_at(page, slot)));
            }
        }
        pairs
    }

    /// Clear both bitmaps, leaving the slot bytes in place.
    pub fn reset(&self, page: &mut Page) {
        for byte in &mut page.data[0..2 * self.bitmap_len] {
            *byte = 0;
        }
    }

    /// Log the occupancy profile of the bucket's probe prefix.
    pub fn log_occupancy(&self, page: &Page) {
        let mut size = 0;
        let mut taken = 0;
        let mut free = 0;
        for slot in 0..self.capacity {
            if !self.is_occupied(page, slot) {
                break;
            }
            size += 1;
            if self.is_readable(page, slot) {
                taken += 1;
            } else {
                free += 1;
            }
        }
        debug!(
            "bucket page {}: capacity {}, probed {}, live {}, tombstoned {}",
            page.page_id, self.capacity, size, taken, free
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Rid;

    fn layout() -> BucketPage<u32, Rid> {
        BucketPage::with_capacity(4)
    }

    #[test]
    fn test_natural_capacity_fills_page() {
        let capacity = BucketPage::<u32, Rid>::natural_capacity();
        let bitmap_len = capacity.div_ceil(8);
        assert!(2 * bitmap_len + capacity * 12 <= PAGE_SIZE);
        // One more slot must not fit
        let next = capacity + 1;
        assert!(2 * next.div_ceil(8) + next * 12 > PAGE_SIZE);
    }

    #[test]
    fn test_insert_and_get_value() {
        let layout = layout();
        let mut page = Page::new(9);

        assert!(layout.insert(&mut page, &7, &Rid::new(1, 0)));
        assert!(layout.insert(&mut page, &7, &Rid::new(1, 1)));
        assert!(layout.insert(&mut page, &8, &Rid::new(2, 0)));

        let mut values = layout.get_value(&page, &7);
        values.sort();
        assert_eq!(values, vec![Rid::new(1, 0), Rid::new(1, 1)]);
        assert_eq!(layout.num_readable(&page), 3);
    }

    #[test]
    fn test_duplicate_pair_rejected() {
        let layout = layout();
        let mut page = Page::new(9);

        assert!(layout.insert(&mut page, &7, &Rid::new(1, 0)));
        assert!(!layout.insert(&mut page, &7, &Rid::new(1, 0)));
        assert_eq!(layout.num_readable(&page), 1);
    }

    #[test]
    fn test_full_bucket_rejects_insert() {
        let layout = layout();
        let mut page = Page::new(9);

        for slot in 0..4u32 {
            assert!(layout.insert(&mut page, &slot, &Rid::new(slot, 0)));
        }
        assert!(layout.is_full(&page));
        assert!(!layout.insert(&mut page, &99, &Rid::new(99, 0)));
    }

    #[test]
    fn test_remove_leaves_tombstone() {
        let layout = layout();
        let mut page = Page::new(9);

        assert!(layout.insert(&mut page, &7, &Rid::new(1, 0)));
        assert!(layout.remove(&mut page, &7, &Rid::new(1, 0)));
        assert!(!layout.remove(&mut page, &7, &Rid::new(1, 0)));

        assert!(layout.is_empty(&page));
        assert!(layout.is_occupied(&page, 0));
        assert!(!layout.is_readable(&page, 0));
    }

    #[test]
    fn test_tombstoned_slot_is_reusable() {
        let layout = layout();
        let mut page = Page::new(9);

        for slot in 0..4u32 {
            assert!(layout.insert(&mut page, &slot, &Rid::new(slot, 0)));
        }
        assert!(layout.remove(&mut page, &2, &Rid::new(2, 0)));
        assert!(layout.insert(&mut page, &42, &Rid::new(42, 0)));
        assert!(layout.is_full(&page));
    }

    #[test]
    fn test_reset_clears_bitmaps() {
        let layout = layout();
        let mut page = Page::new(9);

        layout.insert(&mut page, &7, &Rid::new(1, 0));
        layout.reset(&mut page);
        assert!(layout.is_empty(&page));
        assert!(!layout.is_occupied(&page, 0));
    }
}
