//! Pre-registered slab pool (§4.2): an ordered set of fixed-size slabs
//! backing zero-copy I/O buffers, with a lock-free free-list inside each
//! slab and spinlock-serialized growth.
//!
//! Grounded on `xio_mempool.c`: the combined `(refcnt<<1)|claim_bit` word
//! per block (`decrement_and_test_and_set`/`clear_lowest_bit`/`reclaim`),
//! the insertion-sorted slab array terminated by a size-`usize::MAX`
//! sentinel (`xio_mempool_add_slab`), and the retry ladder in
//! `xio_mempool_alloc` (free-list -> grow -> next slab, unless
//! `USE_SMALLEST_SLAB`).

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::Registry as DeviceRegistry;
use crate::error::{Error, Result};
use crate::mr::Registry as MrRegistry;

/// Where a slab's backing pages come from. Mutually exclusive; chosen once
/// at pool construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    Regular,
    HugePages,
    Numa(u32),
}

/// Whether allocation may advance to the next larger slab when the
/// requested slab cannot satisfy the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallThrough {
    Allow,
    UseSmallestSlabOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct SlabConfig {
    pub block_size: usize,
    pub initial_blocks: u32,
    pub max_blocks: u32,
    pub grow_quantum: u32,
}

struct BlockHeader {
    next: AtomicPtr<BlockHeader>,
    /// `(refcnt << 1) | claim_bit`. `claim_bit == 1` means the block
    /// currently sits on the free list; `0` means it is checked out.
    word: AtomicUsize,
    data: *mut u8,
    device_identity: usize,
    lkey: u32,
    /// Back-pointer to the owning slab, valid for as long as the pool
    /// (and therefore the slab) lives.
    slab: *const SlabInner,
}

// SAFETY: `data` points into a region owned by the slab for the block
// header's lifetime; all mutation of shared state goes through the atomics.
unsafe impl Send for BlockHeader {}
unsafe impl Sync for BlockHeader {}

/// A handle to one checked-out block. Dropping it releases the claim,
/// pushing the block back onto its slab's free list once the refcount
/// reaches zero.
pub struct MemBlock {
    header: *mut BlockHeader,
    block_size: usize,
}

// SAFETY: the only mutable state reachable through `header` is behind
// atomics.
unsafe impl Send for MemBlock {}

impl MemBlock {
    pub fn as_ptr(&self) -> *mut u8 {
        // SAFETY: `header` is valid until this handle (and every clone made
        // via `claim_extra`) is dropped.
        unsafe { (*self.header).data }
    }

    pub fn len(&self) -> usize {
        self.block_size
    }

    pub fn lkey(&self) -> u32 {
        // SAFETY: see `as_ptr`.
        unsafe { (*self.header).lkey }
    }

    /// Takes an extra reference to the same block without re-allocating.
    /// Mirrors `reader claims by atomically adding 2`.
    pub fn claim_extra(&self) -> MemBlock {
        // SAFETY: `header` is valid; this only manipulates the atomic word.
        unsafe {
            (*self.header).word.fetch_add(2, Ordering::AcqRel);
        }
        MemBlock { header: self.header, block_size: self.block_size }
    }
}

impl Drop for MemBlock {
    fn drop(&mut self) {
        // SAFETY: `header` stays valid at least until the last reference
        // (this one included) releases it.
        let header = unsafe { &*self.header };
        let prev = header.word.fetch_sub(2, Ordering::AcqRel);
        if prev - 2 == 0 {
            // Last reference gone: mark free (claim_bit = 1) and push back
            // onto the free list with a CAS loop, per §4.2.
            header.word.store(1, Ordering::Release);
            // SAFETY: `header` is live for the slab's lifetime.
            let slab = unsafe { &*header.slab };
            slab.outstanding.fetch_sub(1, Ordering::AcqRel);
            push_free(self.header);
        }
    }
}

fn push_free(header: *mut BlockHeader) {
    // SAFETY: `header` is a live block no longer referenced by anyone but
    // this call; we own the right to link it back onto the free list.
    let slab = unsafe { &*(*header).slab };
    loop {
        let head = slab.free_head.load(Ordering::Acquire);
        // SAFETY: `header` is exclusively ours at this point.
        unsafe {
            (*header).next.store(head, Ordering::Relaxed);
        }
        if slab
            .free_head
            .compare_exchange_weak(head, header, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

/// One size class. Its region list tracks every growth allocation so the
/// pool can release everything on destruction.
struct SlabInner {
    block_size: usize,
    max_blocks: u32,
    grow_quantum: u32,
    current_blocks: AtomicUsize,
    free_head: AtomicPtr<BlockHeader>,
    /// Serializes growth; contention is rare and the critical section tiny,
    /// so a plain mutex stands in for the spinlock described in §4.2 and §5.
    grow_lock: Mutex<()>,
    regions: Mutex<Vec<Region>>,
    outstanding: AtomicUsize,
}

struct Region {
    mr: crate::mr::MemoryRegion,
    headers: Vec<Box<BlockHeader>>,
}

impl SlabInner {
    fn try_take(&self) -> Option<*mut BlockHeader> {
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            // SAFETY: `head` was read under `Acquire` and is only ever
            // freed back to the allocator, never deallocated, for the
            // slab's lifetime.
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            if self
                .free_head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: exclusive ownership of `head` established by the
                // successful CAS above.
                unsafe {
                    (*head).word.store(0, Ordering::Release);
                }
                return Some(head);
            }
        }
    }

    fn grow(
        &self,
        devices: &DeviceRegistry,
        mr_registry: &MrRegistry,
        page_source: PageSource,
    ) -> Result<()> {
        let _guard = self.grow_lock.lock();
        // Re-check under the lock: another thread may have grown already.
        if self.free_head.load(Ordering::Acquire) != std::ptr::null_mut() {
            return Ok(());
        }
        let current = self.current_blocks.load(Ordering::Acquire) as u32;
        if current >= self.max_blocks {
            return Err(Error::OutOfMemory(format!(
                "slab for block_size={} exhausted ({}/{})",
                self.block_size, current, self.max_blocks
            )));
        }
        let grow_by = self.grow_quantum.min(self.max_blocks - current).max(1);
        self.new_region(devices, mr_registry, grow_by, page_source)
    }

    fn new_region(
        &self,
        devices: &DeviceRegistry,
        mr_registry: &MrRegistry,
        count: u32,
        page_source: PageSource,
    ) -> Result<()> {
        if let PageSource::Numa(node) = page_source {
            // Binding pages to a NUMA node is done by pinning the calling
            // thread before the allocator touches the pages (first-touch
            // policy), per §4.2; the pin itself happened in `Pool::new`.
            log::debug!("growing NUMA-bound slab on node {node}");
        }

        let total_len = self.block_size * count as usize;
        let region = mr_registry.register(
            devices,
            None,
            total_len,
            (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
                | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0
                | ibv_access_flags::IBV_ACCESS_REMOTE_READ.0) as u32,
        )?;

        let base = region.addr() as *mut u8;
        let device_identity = devices.all().first().map(|d| d.identity()).unwrap_or(0);
        let lkey = region.lkey_for(device_identity).unwrap_or(0);

        let mut headers = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let data = unsafe { base.add(i * self.block_size) };
            let boxed = Box::new(BlockHeader {
                next: AtomicPtr::new(std::ptr::null_mut()),
                word: AtomicUsize::new(1),
                data,
                device_identity,
                lkey,
                slab: self as *const SlabInner,
            });
            headers.push(boxed);
        }

        // Splice the new headers onto the free list. Safe mode uses CAS
        // (shown here); a single-threaded "unsafe" pool could use a plain
        // store instead, per §4.2.
        for boxed in &headers {
            let header_ptr: *mut BlockHeader = boxed.as_ref() as *const BlockHeader as *mut BlockHeader;
            loop {
                let head = self.free_head.load(Ordering::Acquire);
                // SAFETY: `header_ptr` is exclusively ours until linked in.
                unsafe {
                    (*header_ptr).next.store(head, Ordering::Relaxed);
                }
                if self
                    .free_head
                    .compare_exchange_weak(head, header_ptr, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }

        self.current_blocks.fetch_add(count as usize, Ordering::AcqRel);
        self.regions.lock().push(Region { mr: region, headers });
        Ok(())
    }
}

use crate::bindings::ibv_access_flags;

/// A process-wide (or per-context) multi-slab allocator.
pub struct Pool {
    slabs: Vec<Arc<SlabInner>>,
    fall_through: FallThrough,
    page_source: PageSource,
}

impl Pool {
    /// Builds a pool with slabs strictly ordered by `block_size`, as
    /// required by property #2; panics (a `ProgramError` in spirit) if the
    /// caller passes an unordered or duplicate-sized config list.
    pub fn new(configs: &[SlabConfig], fall_through: FallThrough, page_source: PageSource) -> Result<Self> {
        let mut slabs = Vec::with_capacity(configs.len());
        let mut last_size = 0usize;
        for cfg in configs {
            if cfg.block_size <= last_size {
                return Err(Error::ProgramError(
                    "slab configs must be strictly increasing by block_size".into(),
                ));
            }
            last_size = cfg.block_size;
            slabs.push(Arc::new(SlabInner {
                block_size: cfg.block_size,
                max_blocks: cfg.max_blocks,
                grow_quantum: cfg.grow_quantum.max(1),
                current_blocks: AtomicUsize::new(0),
                free_head: AtomicPtr::new(std::ptr::null_mut()),
                grow_lock: Mutex::new(()),
                regions: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
            }));
        }

        if let PageSource::Numa(node) = page_source {
            pin_current_thread(node as usize)?;
        }

        Ok(Self { slabs, fall_through, page_source })
    }

    pub fn init_eager(
        &self,
        devices: &DeviceRegistry,
        mr_registry: &MrRegistry,
        configs: &[SlabConfig],
    ) -> Result<()> {
        for (slab, cfg) in self.slabs.iter().zip(configs) {
            if cfg.initial_blocks > 0 {
                slab.new_region(devices, mr_registry, cfg.initial_blocks, self.page_source)?;
            }
        }
        Ok(())
    }

    fn index_for(&self, length: usize) -> Option<usize> {
        self.slabs.iter().position(|s| s.block_size >= length)
    }

    /// Allocates a block able to hold `length` bytes, per the routing rule
    /// in §4.2: the smallest slab with `block_size >= length`, falling
    /// through to the next larger slab on exhaustion unless the pool is
    /// configured `UseSmallestSlabOnly`.
    pub fn alloc(
        &self,
        devices: &DeviceRegistry,
        mr_registry: &MrRegistry,
        length: usize,
    ) -> Result<MemBlock> {
        let start = self
            .index_for(length)
            .ok_or_else(|| Error::OutOfMemory(format!("no slab large enough for {length} bytes")))?;

        let mut idx = start;
        loop {
            let slab = &self.slabs[idx];
            if let Some(header) = slab.try_take() {
                // SAFETY: exclusive ownership established by `try_take`.
                unsafe {
                    (*header).word.store(2, Ordering::Release);
                }
                slab.outstanding.fetch_add(1, Ordering::AcqRel);
                return Ok(MemBlock { header, block_size: slab.block_size });
            }
            match slab.grow(devices, mr_registry, self.page_source) {
                Ok(()) => {
                    if let Some(header) = slab.try_take() {
                        unsafe {
                            (*header).word.store(2, Ordering::Release);
                        }
                        slab.outstanding.fetch_add(1, Ordering::AcqRel);
                        return Ok(MemBlock { header, block_size: slab.block_size });
                    }
                }
                Err(_) => {}
            }

            if self.fall_through == FallThrough::UseSmallestSlabOnly {
                return Err(Error::OutOfMemory(format!(
                    "slab for block_size={} exhausted and USE_SMALLEST_SLAB is set",
                    slab.block_size
                )));
            }
            idx += 1;
            if idx >= self.slabs.len() {
                return Err(Error::OutOfMemory(format!("no slab could satisfy {length} bytes")));
            }
        }
    }

    /// Destroys every region in every slab. If blocks are still checked
    /// out, logs a leak diagnostic and proceeds — best-effort reclamation
    /// under shutdown, per §4.2.
    pub fn destroy(&self, mr_registry: &MrRegistry, devices: &DeviceRegistry) {
        for slab in &self.slabs {
            let outstanding = slab.outstanding.load(Ordering::Acquire);
            if outstanding > 0 {
                log::warn!(
                    "destroying slab block_size={} with {outstanding} block(s) still checked out",
                    slab.block_size
                );
            }
            for region in slab.regions.lock().drain(..) {
                mr_registry.deregister(devices, &region.mr);
            }
        }
    }
}

fn pin_current_thread(node: usize) -> Result<()> {
    // SAFETY: POD type.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(node, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(block_size: usize) -> SlabConfig {
        SlabConfig { block_size, initial_blocks: 0, max_blocks: 16, grow_quantum: 4 }
    }

    #[test]
    fn new_accepts_strictly_increasing_sizes() {
        let configs = [cfg(64), cfg(256), cfg(4096)];
        let pool = Pool::new(&configs, FallThrough::Allow, PageSource::Regular).unwrap();
        assert_eq!(pool.slabs.len(), 3);
    }

    #[test]
    fn new_rejects_non_increasing_sizes() {
        let configs = [cfg(256), cfg(256)];
        assert!(Pool::new(&configs, FallThrough::Allow, PageSource::Regular).is_err());
    }

    #[test]
    fn new_rejects_decreasing_sizes() {
        let configs = [cfg(4096), cfg(256)];
        assert!(Pool::new(&configs, FallThrough::Allow, PageSource::Regular).is_err());
    }

    #[test]
    fn index_for_picks_smallest_fitting_slab() {
        let configs = [cfg(64), cfg(256), cfg(4096)];
        let pool = Pool::new(&configs, FallThrough::Allow, PageSource::Regular).unwrap();
        assert_eq!(pool.index_for(1), Some(0));
        assert_eq!(pool.index_for(64), Some(0));
        assert_eq!(pool.index_for(65), Some(1));
        assert_eq!(pool.index_for(4096), Some(2));
    }

    #[test]
    fn index_for_none_when_too_large_for_every_slab() {
        let configs = [cfg(64), cfg(256)];
        let pool = Pool::new(&configs, FallThrough::Allow, PageSource::Regular).unwrap();
        assert_eq!(pool.index_for(257), None);
    }
}
