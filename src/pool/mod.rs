//! Per-device pool of reusable device buffers.
//!
//! Raw device allocation is slow and may synchronize the device, so scratch
//! buffers are recycled through a fixed-capacity slot table per device.
//! A request takes the best-fitting free slot; a miss allocates a slightly
//! larger buffer so that later, marginally bigger requests can reuse it.
//!
//! All tables share one mutex. The critical section only touches slot
//! bookkeeping; raw allocate/free calls happen after the lock is released.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::device::{DevicePtr, Driver};
use crate::device_check;

/// Identifier of the tensor a pooled buffer is cached for.
pub type TensorId = u64;

/// Raw allocations are rounded up to this many bytes.
const LOOK_AHEAD_ALIGN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Free(DevicePtr),
    InUse(DevicePtr),
}

#[derive(Debug, Clone, Copy)]
struct PoolSlot {
    state: SlotState,
    size: usize,
    access_count: u64,
    owner: Option<TensorId>,
}

impl PoolSlot {
    const EMPTY: Self = Self {
        state: SlotState::Empty,
        size: 0,
        access_count: 0,
        owner: None,
    };

    fn ptr(&self) -> Option<DevicePtr> {
        match self.state {
            SlotState::Free(p) | SlotState::InUse(p) => Some(p),
            SlotState::Empty => None,
        }
    }
}

/// Slot counts and byte totals for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub empty_slots: usize,
    pub free_slots: usize,
    pub in_use_slots: usize,
    pub free_bytes: usize,
    pub in_use_bytes: usize,
}

/// Buffer pools for every device of a driver.
pub struct DevicePool {
    driver: Arc<dyn Driver>,
    capacity: usize,
    tolerance: f32,
    tables: Mutex<Vec<Vec<PoolSlot>>>,
}

/// Size of a fresh raw allocation for a request of `size` bytes.
fn look_ahead(size: usize) -> usize {
    let padded = (size as f64 * 1.05).ceil() as usize;
    (padded + LOOK_AHEAD_ALIGN - 1) / LOOK_AHEAD_ALIGN * LOOK_AHEAD_ALIGN
}

impl DevicePool {
    /// `capacity` slots per device. The best-fit scan stops once a candidate
    /// wastes at most `tolerance * size` bytes.
    pub fn new(driver: Arc<dyn Driver>, capacity: usize, tolerance: f32) -> Self {
        let tables = vec![vec![PoolSlot::EMPTY; capacity]; driver.device_count()];
        Self {
            driver,
            capacity,
            tolerance,
            tables: Mutex::new(tables),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<PoolSlot>>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a buffer of at least `size` bytes on `device`.
    ///
    /// Returns the pointer and the usable size, which may exceed `size`.
    /// A failed raw allocation is fatal.
    pub fn allocate(&self, device: usize, size: usize) -> (DevicePtr, usize) {
        {
            let mut tables = self.lock();
            let table = &mut tables[device];
            let slack = (self.tolerance as f64 * size as f64) as usize;
            let mut best: Option<usize> = None;
            for (i, slot) in table.iter().enumerate() {
                if !matches!(slot.state, SlotState::Free(_)) || slot.size < size {
                    continue;
                }
                let overhead = slot.size - size;
                if best.map_or(true, |b| overhead < table[b].size - size) {
                    best = Some(i);
                    if overhead <= slack {
                        break;
                    }
                }
            }
            if let Some(i) = best {
                let slot = &mut table[i];
                if let SlotState::Free(ptr) = slot.state {
                    slot.state = SlotState::InUse(ptr);
                    slot.access_count += 1;
                    trace!(device, size, got = slot.size, "pool hit");
                    return (ptr, slot.size);
                }
            }
        }

        let actual = look_ahead(size);
        let ptr = device_check!(self.driver.malloc(device, actual));

        let mut tables = self.lock();
        match tables[device]
            .iter_mut()
            .find(|s| s.state == SlotState::Empty)
        {
            Some(slot) => {
                *slot = PoolSlot {
                    state: SlotState::InUse(ptr),
                    size: actual,
                    access_count: 1,
                    owner: None,
                };
                debug!(device, size, actual, "pool miss, new buffer");
            }
            None => {
                warn!(
                    device,
                    size = actual,
                    capacity = self.capacity,
                    "device pool is full, buffer will not be recycled"
                );
            }
        }
        (ptr, actual)
    }

    /// Return a buffer obtained from [`allocate`](Self::allocate).
    ///
    /// An untracked pointer is released to the device directly.
    pub fn free(&self, ptr: DevicePtr, size: usize) {
        {
            let mut tables = self.lock();
            if let Some(slot) = tables[ptr.device]
                .iter_mut()
                .find(|s| s.state == SlotState::InUse(ptr))
            {
                slot.state = SlotState::Free(ptr);
                slot.size = size;
                slot.owner = None;
                return;
            }
        }
        warn!(device = ptr.device, size, "freeing untracked buffer directly");
        device_check!(self.driver.free(ptr));
    }

    /// Remove a buffer from the pool and release it to the device.
    pub fn unallocate(&self, ptr: DevicePtr) {
        let tracked = {
            let mut tables = self.lock();
            match tables[ptr.device]
                .iter_mut()
                .find(|s| s.ptr() == Some(ptr))
            {
                Some(slot) => {
                    *slot = PoolSlot::EMPTY;
                    true
                }
                None => false,
            }
        };
        if !tracked {
            warn!(device = ptr.device, "unallocating untracked buffer");
        }
        device_check!(self.driver.free(ptr));
    }

    /// Release every free buffer on `device` used fewer than
    /// `min_access_count` times.
    pub fn purge(&self, min_access_count: u64, device: usize) -> usize {
        let victims: Vec<DevicePtr> = {
            let mut tables = self.lock();
            tables[device]
                .iter_mut()
                .filter(|s| {
                    matches!(s.state, SlotState::Free(_)) && s.access_count < min_access_count
                })
                .filter_map(|s| {
                    let ptr = s.ptr();
                    *s = PoolSlot::EMPTY;
                    ptr
                })
                .collect()
        };
        for &ptr in &victims {
            device_check!(self.driver.free(ptr));
        }
        if !victims.is_empty() {
            debug!(device, released = victims.len(), "purged pool");
        }
        victims.len()
    }

    /// Zero the access counters of all free buffers on `device`.
    pub fn reset_counters(&self, device: usize) {
        let mut tables = self.lock();
        for slot in tables[device]
            .iter_mut()
            .filter(|s| matches!(s.state, SlotState::Free(_)))
        {
            slot.access_count = 0;
        }
    }

    /// Associate an in-use buffer with the tensor it caches data for.
    pub fn tag(&self, ptr: DevicePtr, tensor: TensorId) -> bool {
        let mut tables = self.lock();
        match tables[ptr.device]
            .iter_mut()
            .find(|s| s.state == SlotState::InUse(ptr))
        {
            Some(slot) => {
                slot.owner = Some(tensor);
                true
            }
            None => false,
        }
    }

    /// Tensor an in-use buffer is tagged with.
    pub fn owner(&self, ptr: DevicePtr) -> Option<TensorId> {
        self.lock()[ptr.device]
            .iter()
            .find(|s| s.state == SlotState::InUse(ptr))
            .and_then(|s| s.owner)
    }

    pub fn stats(&self, device: usize) -> PoolStats {
        let tables = self.lock();
        let mut stats = PoolStats {
            capacity: self.capacity,
            ..Default::default()
        };
        for slot in &tables[device] {
            match slot.state {
                SlotState::Empty => stats.empty_slots += 1,
                SlotState::Free(_) => {
                    stats.free_slots += 1;
                    stats.free_bytes += slot.size;
                }
                SlotState::InUse(_) => {
                    stats.in_use_slots += 1;
                    stats.in_use_bytes += slot.size;
                }
            }
        }
        stats
    }

    /// Release every tracked buffer on every device.
    pub fn release_all(&self) {
        let victims: Vec<(DevicePtr, bool)> = {
            let mut tables = self.lock();
            tables
                .iter_mut()
                .flat_map(|t| t.iter_mut())
                .filter_map(|s| {
                    let entry = s.ptr().map(|p| (p, matches!(s.state, SlotState::InUse(_))));
                    *s = PoolSlot::EMPTY;
                    entry
                })
                .collect()
        };
        let in_use = victims.iter().filter(|(_, busy)| *busy).count();
        if in_use > 0 {
            warn!(in_use, "releasing pool with buffers still in use");
        }
        for (ptr, _) in victims {
            device_check!(self.driver.free(ptr));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDriver;
    use proptest::prelude::*;

    fn pool(capacity: usize) -> (Arc<SimDriver>, DevicePool) {
        let driver = Arc::new(SimDriver::uniform(2, 64 << 20, 860));
        let pool = DevicePool::new(driver.clone(), capacity, 0.05);
        (driver, pool)
    }

    #[test]
    fn test_look_ahead_rounding() {
        assert_eq!(look_ahead(1000), 1280);
        assert_eq!(look_ahead(256), 512);
        assert_eq!(look_ahead(65536) % LOOK_AHEAD_ALIGN, 0);
        assert!(look_ahead(65536) >= 65536 * 105 / 100);
    }

    #[test]
    fn test_freed_buffer_reused_without_new_allocation() {
        let (driver, pool) = pool(8);
        let (p, size) = pool.allocate(0, 64 * 1024);
        assert!(size >= 64 * 1024);
        pool.free(p, size);
        let mallocs = driver.stats(0).mallocs;

        let (q, _) = pool.allocate(0, 60 * 1024);
        assert_eq!(q, p);
        assert_eq!(driver.stats(0).mallocs, mallocs);
    }

    #[test]
    fn test_best_fit_prefers_smallest_sufficient() {
        let (_driver, pool) = pool(8);
        let (a, sa) = pool.allocate(0, 10_000);
        let (b, sb) = pool.allocate(0, 4_000);
        let (c, sc) = pool.allocate(0, 6_000);
        pool.free(a, sa);
        pool.free(b, sb);
        pool.free(c, sc);
        let (got, _) = pool.allocate(0, 5_000);
        assert_eq!(got, c);
    }

    #[test]
    fn test_full_table_bypasses_cache() {
        let (driver, pool) = pool(2);
        let bufs: Vec<_> = (0..3).map(|_| pool.allocate(0, 1024)).collect();
        assert_eq!(pool.stats(0).in_use_slots, 2);
        for (p, s) in bufs {
            pool.free(p, s);
        }
        let stats = pool.stats(0);
        assert_eq!(stats.free_slots, 2);
        assert_eq!(stats.empty_slots, 0);
        // The untracked third buffer went straight back to the device.
        assert_eq!(driver.stats(0).frees, 1);
    }

    #[test]
    fn test_unallocate_releases_memory() {
        let (driver, pool) = pool(4);
        let (p, _) = pool.allocate(1, 4096);
        pool.unallocate(p);
        assert_eq!(driver.stats(1).frees, 1);
        assert_eq!(pool.stats(1).empty_slots, 4);
        assert_eq!(driver.mem_info(1).unwrap().free, 64 << 20);
    }

    #[test]
    fn test_purge_by_access_count() {
        let (driver, pool) = pool(4);
        let (hot, hs) = pool.allocate(0, 2048);
        pool.free(hot, hs);
        let (hot2, hs2) = pool.allocate(0, 2048);
        assert_eq!(hot2, hot);
        pool.free(hot2, hs2);
        let (cold, cs) = pool.allocate(0, 100_000);
        pool.free(cold, cs);

        assert_eq!(pool.purge(2, 0), 1);
        let stats = pool.stats(0);
        assert_eq!(stats.free_slots, 1);
        assert_eq!(driver.stats(0).frees, 1);

        pool.reset_counters(0);
        assert_eq!(pool.purge(1, 0), 1);
        assert_eq!(pool.stats(0).free_slots, 0);
    }

    #[test]
    fn test_purge_keeps_in_use_buffers() {
        let (_driver, pool) = pool(4);
        let (_p, _) = pool.allocate(0, 512);
        assert_eq!(pool.purge(u64::MAX, 0), 0);
        assert_eq!(pool.stats(0).in_use_slots, 1);
    }

    #[test]
    fn test_tag_and_owner() {
        let (_driver, pool) = pool(4);
        let (p, s) = pool.allocate(0, 512);
        assert!(pool.tag(p, 42));
        assert_eq!(pool.owner(p), Some(42));
        pool.free(p, s);
        assert_eq!(pool.owner(p), None);
        assert!(!pool.tag(p, 7));
    }

    #[test]
    fn test_release_all() {
        let (driver, pool) = pool(4);
        let (a, sa) = pool.allocate(0, 512);
        let _b = pool.allocate(1, 512);
        pool.free(a, sa);
        pool.release_all();
        assert_eq!(driver.mem_info(0).unwrap().free, 64 << 20);
        assert_eq!(driver.mem_info(1).unwrap().free, 64 << 20);
        assert_eq!(pool.stats(0).empty_slots, 4);
    }

    proptest! {
        #[test]
        fn prop_in_use_pointers_are_unique(
            ops in prop::collection::vec((any::<bool>(), 1usize..20_000), 1..80),
            capacity in 1usize..6,
        ) {
            let (_driver, pool) = pool(capacity);
            let mut live: Vec<(DevicePtr, usize)> = Vec::new();
            for (alloc, size) in ops {
                if alloc || live.is_empty() {
                    let (p, actual) = pool.allocate(0, size);
                    prop_assert!(actual >= size);
                    prop_assert!(live.iter().all(|(q, _)| *q != p));
                    live.push((p, actual));
                } else {
                    let (p, s) = live.remove(size % live.len());
                    pool.free(p, s);
                }
                let stats = pool.stats(0);
                prop_assert_eq!(
                    stats.empty_slots + stats.free_slots + stats.in_use_slots,
                    capacity
                );
                prop_assert!(stats.in_use_slots <= live.len());
            }
        }

        #[test]
        fn prop_freed_buffer_serves_smaller_request(size in 1usize..100_000, shrink in 0usize..100) {
            let (driver, pool) = pool(4);
            let (p, actual) = pool.allocate(0, size);
            pool.free(p, actual);
            let mallocs = driver.stats(0).mallocs;
            let smaller = size - size * shrink / 100;
            let (q, _) = pool.allocate(0, smaller.max(1));
            prop_assert_eq!(q, p);
            prop_assert_eq!(driver.stats(0).mallocs, mallocs);
        }
    }
}
