//! Process-wide memory-region registry (§4.1).
//!
//! Grounded on `xio_reg_mr_ex`/`xio_reg_mr_add_dev`/`xio_rkey_table_create`
//! in the original transport's `xio_rdma_verbs.c`: every user buffer is
//! registered on every known device, a device discovered later gets every
//! existing buffer registered against it retroactively, and `dup2`-style
//! reconnects need a table mapping old rkeys to new ones built by zipping
//! two devices' per-device element lists in registration order.

use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bindings::*;
use crate::device::{DeviceHandle, Registry as DeviceRegistry};
use crate::error::{Error, Result};

/// One device's registration of a [`MemoryRegion`]'s buffer.
struct MrElem {
    device_identity: usize,
    mr: NonNull<ibv_mr>,
}

// SAFETY: `ibv_mr*` is only ever dereferenced through `MrElem`'s owning
// `MemoryRegion`, which synchronizes access via `Registry`'s lock.
unsafe impl Send for MrElem {}
unsafe impl Sync for MrElem {}

impl MrElem {
    fn lkey(&self) -> u32 {
        // SAFETY: `mr` is valid for the lifetime of the owning registration.
        unsafe { self.mr.as_ref().lkey }
    }

    fn rkey(&self) -> u32 {
        // SAFETY: `mr` is valid for the lifetime of the owning registration.
        unsafe { self.mr.as_ref().rkey }
    }
}

struct MemoryRegionInner {
    addr: usize,
    length: usize,
    access: u32,
    /// Set when the registry itself allocated the backing pages (via the
    /// first device's "allocate MR" capability) and must free them on
    /// deregister.
    owns_buffer: bool,
    elems: Mutex<Vec<MrElem>>,
}

/// A buffer registered on every known device.
#[derive(Clone)]
pub struct MemoryRegion(Arc<MemoryRegionInner>);

impl MemoryRegion {
    pub fn addr(&self) -> usize {
        self.0.addr
    }

    pub fn length(&self) -> usize {
        self.0.length
    }

    /// Per-device lkey, if this MR has been registered on `device_identity`.
    pub fn lkey_for(&self, device_identity: usize) -> Option<u32> {
        self.0
            .elems
            .lock()
            .iter()
            .find(|e| e.device_identity == device_identity)
            .map(MrElem::lkey)
    }

    pub fn rkey_for(&self, device_identity: usize) -> Option<u32> {
        self.0
            .elems
            .lock()
            .iter()
            .find(|e| e.device_identity == device_identity)
            .map(MrElem::rkey)
    }
}

fn register_on_device(
    dev: &DeviceHandle,
    addr: *mut libc::c_void,
    length: usize,
    access: u32,
) -> Result<NonNull<ibv_mr>> {
    // SAFETY: FFI; `addr`/`length` describe a buffer the caller guarantees
    // is valid (and, for the registry-owned case, was itself just
    // allocated).
    let mr = unsafe { ibv_reg_mr(dev.pd_ptr(), addr, length, access as i32) };
    let mr = NonNull::new(mr).ok_or_else(|| {
        Error::OutOfMemory(format!(
            "ibv_reg_mr failed for {length} bytes (check ulimit -l / memlock)"
        ))
    })?;
    dev.record_mr(mr);
    Ok(mr)
}

fn page_size() -> usize {
    // SAFETY: FFI; `_SC_PAGESIZE` is always a supported sysconf name.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// SAFETY: caller must guarantee `mr` is currently registered on `dev` and
/// will not be used again afterwards.
unsafe fn unregister_from_device(dev: &DeviceHandle, mr: NonNull<ibv_mr>) {
    dev.forget_mr(mr);
    ibv_dereg_mr(mr.as_ptr());
}

/// Process-wide registry of memory regions, mirroring §5's "Memory-region
/// list — protected by a spinlock; traversal during `on_new_device` holds
/// both the device-list lock and the MR-list lock (lock order: device-list
/// -> MR-list)."
#[derive(Default)]
pub struct Registry {
    regions: Mutex<Vec<MemoryRegion>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a buffer on every device known to `devices`. If `addr` is
    /// `None`, the registry allocates page-aligned memory of `length` bytes
    /// itself and reuses that address for every device's registration,
    /// publishing it back via [`MemoryRegion::addr`].
    pub fn register(
        &self,
        devices: &DeviceRegistry,
        addr: Option<*mut libc::c_void>,
        length: usize,
        access: u32,
    ) -> Result<MemoryRegion> {
        let all = devices.all();
        if all.is_empty() {
            return Err(Error::OutOfMemory("no devices known; cannot register memory".into()));
        }

        let mut owns_buffer = false;
        let mut chosen_addr = addr;

        if chosen_addr.is_none() {
            // `ibv_reg_mr` registers existing memory; it does not allocate
            // any. The "first device allocates" capability is a userspace
            // convenience: we allocate page-aligned memory ourselves before
            // the first registration and reuse that address for every other
            // device, exactly as `xio_reg_mr_ex` does when handed a null
            // address.
            let mut raw: *mut libc::c_void = std::ptr::null_mut();
            // SAFETY: `length` is caller-supplied and non-zero by contract;
            // `raw` is only read on success (return code 0).
            let ret = unsafe { libc::posix_memalign(&mut raw, page_size(), length) };
            if ret != 0 || raw.is_null() {
                return Err(Error::OutOfMemory(format!(
                    "posix_memalign({length} bytes) failed: errno {ret}"
                )));
            }
            chosen_addr = Some(raw);
            owns_buffer = true;
        }

        let mut elems: Vec<(DeviceHandle, MrElem)> = Vec::with_capacity(all.len());

        for dev in all.iter() {
            let this_addr = chosen_addr.expect("allocated or caller-supplied above");
            let mr = match register_on_device(dev, this_addr, length, access) {
                Ok(mr) => mr,
                Err(e) => {
                    // Roll back every per-device registration made so far in
                    // this call, in reverse acquisition order.
                    for (dev, elem) in elems.into_iter().rev() {
                        // SAFETY: these registrations were all made earlier
                        // in this same call and published nowhere else yet.
                        unsafe {
                            unregister_from_device(&dev, elem.mr);
                        }
                    }
                    if owns_buffer {
                        if let Some(a) = chosen_addr {
                            // SAFETY: we allocated this buffer via the first
                            // device and are unwinding before publishing it.
                            unsafe {
                                libc::free(a);
                            }
                        }
                    }
                    return Err(e);
                }
            };

            elems.push((dev.clone(), MrElem { device_identity: dev.identity(), mr }));
        }

        let region = MemoryRegion(Arc::new(MemoryRegionInner {
            addr: chosen_addr.map(|p| p as usize).unwrap_or(0),
            length,
            access,
            owns_buffer,
            elems: Mutex::new(elems.into_iter().map(|(_, e)| e).collect()),
        }));

        self.regions.lock().push(region.clone());
        Ok(region)
    }

    /// Idempotently deregisters every per-device element of `mr`, and frees
    /// the backing pages if the registry allocated them.
    pub fn deregister(&self, devices: &DeviceRegistry, mr: &MemoryRegion) {
        let mut regions = self.regions.lock();
        let before = regions.len();
        regions.retain(|r| !Arc::ptr_eq(&r.0, &mr.0));
        if regions.len() == before {
            // Already removed; deregistering twice is a no-op.
            return;
        }
        drop(regions);

        let elems = std::mem::take(&mut *mr.0.elems.lock());
        for elem in elems {
            if let Some(dev) = devices.lookup(elem.device_identity) {
                // SAFETY: each element was registered by this registry and
                // has not been deregistered before (idempotency is enforced
                // by the `retain` above, which only lets this run once).
                unsafe {
                    unregister_from_device(&dev, elem.mr);
                }
            } else {
                // Device already torn down; its PD teardown implicitly
                // invalidated every MR on it.
            }
        }
        if mr.0.owns_buffer {
            // SAFETY: only freed if `register` allocated this buffer itself.
            unsafe {
                libc::free(mr.0.addr as *mut libc::c_void);
            }
        }
    }

    /// Registers every live memory region against a newly discovered
    /// device. Holds both the device registry's lock (implicitly, via
    /// `devices.all()`/`get_or_open` having already completed) and this
    /// registry's lock for the duration of the traversal, per the lock
    /// order documented in §5. Partial failure rolls back every
    /// registration this call performed.
    pub fn on_new_device(&self, dev: &DeviceHandle) -> Result<()> {
        let regions = self.regions.lock();
        let mut registered_this_call: Vec<NonNull<ibv_mr>> = Vec::new();
        let mut touched_regions: Vec<&MemoryRegion> = Vec::new();

        for region in regions.iter() {
            let addr = region.0.addr as *mut libc::c_void;
            match register_on_device(dev, addr, region.0.length, region.0.access) {
                Ok(mr) => {
                    region.0.elems.lock().push(MrElem { device_identity: dev.identity(), mr });
                    registered_this_call.push(mr);
                    touched_regions.push(region);
                }
                Err(e) => {
                    for (region, mr) in touched_regions.into_iter().zip(registered_this_call.into_iter()) {
                        region.0.elems.lock().retain(|el| el.mr != mr);
                        // SAFETY: unwinding a registration made earlier in
                        // this same call.
                        unsafe {
                            unregister_from_device(dev, mr);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Removes every MR element registered against `device_identity`, e.g.
    /// on device removal. Does not touch elements on other devices.
    pub fn on_device_removed(&self, dev: &DeviceHandle) {
        let device_identity = dev.identity();
        for region in self.regions.lock().iter() {
            let mut elems = region.0.elems.lock();
            let mut kept = Vec::with_capacity(elems.len());
            for elem in elems.drain(..) {
                if elem.device_identity == device_identity {
                    // SAFETY: the device (and its PD) is going away; the MR
                    // must be deregistered before that happens.
                    unsafe {
                        unregister_from_device(dev, elem.mr);
                    }
                } else {
                    kept.push(elem);
                }
            }
            *elems = kept;
        }
    }

    /// Produces a parallel iteration over `old_dev` and `new_dev`'s
    /// MR-element lists, pairing up old and new rkeys in registration
    /// order. Fails with [`Error::ProgramError`] if the two lists do not
    /// zip cleanly — per §4.1 this is a broken invariant, not a user error,
    /// since every region is supposed to be registered on every known
    /// device. A registry with zero registered regions is not an error: the
    /// table is simply empty.
    pub fn build_rkey_table(&self, old_dev: &DeviceHandle, new_dev: &DeviceHandle) -> Result<Vec<(u32, u32)>> {
        if old_dev.mr_elem_count() == 0 && new_dev.mr_elem_count() == 0 {
            return Ok(Vec::new());
        }

        let old_rkeys = old_dev.mr_rkeys();
        let new_rkeys = new_dev.mr_rkeys();

        if old_rkeys.len() != new_rkeys.len() {
            return Err(Error::ProgramError(format!(
                "rkey table zip mismatch: old device has {} MR elements, new device has {}",
                old_rkeys.len(),
                new_rkeys.len()
            )));
        }

        Ok(old_rkeys.into_iter().zip(new_rkeys).collect())
    }
}
