//! Device discovery, the one-protection-domain-per-device registry, and the
//! dedicated device thread that polls every device's asynchronous-event fd.
//!
//! Grounded on the teacher's `rdma::device`/`rdma::nic` split: `Device` here
//! plays the role of the teacher's `Context` (an opened `ibv_context` plus
//! its `Pd`), generalized to also hold the per-device CQ list and
//! MR-element list that the rkey-remap and CQ-sharing logic need.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::bindings::*;
use crate::error::{Error, Result};
use crate::util::interop::from_c_err;

/// Wrapper for `*mut ibv_context`. Mirrors the teacher's `IbvContext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvContext(NonNull<ibv_context>);

impl_ibv_wrapper_traits!(ibv_context, IbvContext);

/// Wrapper for `*mut ibv_pd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvPd(NonNull<ibv_pd>);

impl_ibv_wrapper_traits!(ibv_pd, IbvPd);

/// A discovered RDMA device: its verbs context, one protection domain, the
/// set of completion queues opened on it, and the MR elements registered on
/// it (used to build rkey remap tables across devices).
pub struct DeviceInner {
    ctx: IbvContext,
    pd: IbvPd,
    attr: ibv_device_attr,
    /// CQ list, keyed by the owning I/O context's identity. Protected by a
    /// per-device reader-writer lock per §5; write-locked only by destroy
    /// paths.
    pub(crate) cq_list: RwLock<Vec<crate::cq::CqHandle>>,
    /// MR handles registered against this device, in registration order.
    /// Non-owning: [`crate::mr::Registry`] owns the actual `ibv_dereg_mr`
    /// call. `build_rkey_table` zips this list against another device's.
    mr_elems: Mutex<Vec<NonNull<ibv_mr>>>,
}

// SAFETY: all mutation goes through the internal locks; verbs handles are
// safe to move and share across threads as long as libibverbs itself is
// thread-safe for the calls we make (true for PD/MR/CQ create/destroy).
unsafe impl Send for DeviceInner {}
unsafe impl Sync for DeviceInner {}

impl DeviceInner {
    pub fn context_ptr(&self) -> *mut ibv_context {
        self.ctx.as_ptr()
    }

    pub fn pd_ptr(&self) -> *mut ibv_pd {
        self.pd.as_ptr()
    }

    pub fn attr(&self) -> &ibv_device_attr {
        &self.attr
    }

    /// Distinct identity for dedup: the underlying `ibv_device*`.
    pub fn identity(&self) -> usize {
        // SAFETY: `ctx` points at a live `ibv_context`.
        unsafe { self.ctx.as_ref().device as usize }
    }

    pub fn async_fd(&self) -> std::os::unix::io::RawFd {
        // SAFETY: `ctx` points at a live `ibv_context`.
        unsafe { self.ctx.as_ref().async_fd }
    }

    /// Records that `mr` is now registered on this device. Called by
    /// [`crate::mr::Registry`] after a successful `ibv_reg_mr`.
    pub(crate) fn record_mr(&self, mr: NonNull<ibv_mr>) {
        self.mr_elems.lock().push(mr);
    }

    /// Removes `mr` from this device's element list. Called by
    /// [`crate::mr::Registry`] before `ibv_dereg_mr`.
    pub(crate) fn forget_mr(&self, mr: NonNull<ibv_mr>) {
        self.mr_elems.lock().retain(|m| *m != mr);
    }

    /// Snapshot of `(rkey)` in registration order, used by
    /// `build_rkey_table`.
    pub(crate) fn mr_rkeys(&self) -> Vec<u32> {
        self.mr_elems
            .lock()
            .iter()
            // SAFETY: every entry is a live `ibv_mr` owned by a region that
            // has not yet been deregistered.
            .map(|mr| unsafe { mr.as_ref().rkey })
            .collect()
    }

    pub(crate) fn mr_elem_count(&self) -> usize {
        self.mr_elems.lock().len()
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        // SAFETY: last strong reference; no CQ/MR should still reference
        // this PD (the registry only drops its own strong ref once all
        // connections/CQs have torn down and released theirs).
        unsafe {
            ibv_dealloc_pd(self.pd.as_ptr());
            ibv_close_device(self.ctx.as_ptr());
        }
    }
}

pub type DeviceHandle = Arc<DeviceInner>;

/// Opens `ctx` (an already-resolved `ibv_context`, typically obtained via a
/// CM id's `verbs` field), allocating a fresh PD and snapshotting device
/// attributes.
fn open_device(ctx: *mut ibv_context) -> Result<DeviceHandle> {
    let ctx = NonNull::new(ctx).ok_or_else(|| Error::InvalidArgument("null ibv_context".into()))?;
    // SAFETY: FFI; `ctx` is a live, valid pointer per the caller's contract.
    let pd = unsafe { ibv_alloc_pd(ctx.as_ptr()) };
    let pd = NonNull::new(pd).ok_or_else(|| Error::OutOfMemory("ibv_alloc_pd failed".into()))?;

    let mut attr: ibv_device_attr = unsafe { std::mem::zeroed() };
    // SAFETY: FFI; `attr` is a valid out-pointer.
    let ret = unsafe { ibv_query_device(ctx.as_ptr(), &mut attr) };
    if ret != 0 {
        // SAFETY: rolling back the PD we just allocated.
        unsafe {
            ibv_dealloc_pd(pd.as_ptr());
        }
        return from_c_err::<DeviceHandle>(ret).map_err(Error::Io);
    }

    Ok(Arc::new(DeviceInner {
        ctx: IbvContext::from(ctx),
        pd: IbvPd::from(pd),
        attr,
        cq_list: RwLock::new(Vec::new()),
        mr_elems: Mutex::new(Vec::new()),
    }))
}

/// Process-wide set of opened devices, deduplicated by verbs handle and
/// protected by a single lock per §5 ("Device list — protected by a
/// spinlock on add/remove/lookup"). `parking_lot::Mutex` is used in place of
/// a literal spinlock: contention here is rare (device open/close only) and
/// parking_lot already degrades to a short spin before parking.
#[derive(Default)]
pub struct Registry {
    devices: Mutex<HashMap<usize, DeviceHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the device for `ctx`, opening (and registering) it if this is
    /// the first time it has been observed. Devices are discovered lazily,
    /// on first CM `ADDR_RESOLVED` or `CONNECT_REQUEST` event that
    /// references them.
    pub fn get_or_open(&self, ctx: *mut ibv_context) -> Result<DeviceHandle> {
        let identity = {
            let ctx = NonNull::new(ctx).ok_or_else(|| Error::InvalidArgument("null ibv_context".into()))?;
            // SAFETY: `ctx` is non-null and assumed live by the CM.
            unsafe { ctx.as_ref().device as usize }
        };

        let mut devices = self.devices.lock();
        if let Some(dev) = devices.get(&identity) {
            return Ok(dev.clone());
        }
        let dev = open_device(ctx)?;
        devices.insert(identity, dev.clone());
        Ok(dev)
    }

    pub fn lookup(&self, identity: usize) -> Option<DeviceHandle> {
        self.devices.lock().get(&identity).cloned()
    }

    /// Move a device to the deletion list: drop the registry's own strong
    /// reference. The PD is only actually released once every CQ and
    /// connection referencing the device has dropped its `Arc` too.
    pub fn release(&self, identity: usize) {
        self.devices.lock().remove(&identity);
    }

    pub fn all(&self) -> Vec<DeviceHandle> {
        self.devices.lock().values().cloned().collect()
    }
}

/// Bridges the device thread (a separate OS thread) back onto each
/// connection's owning context. The device thread never touches connection
/// state directly; it only records which queue pairs saw a
/// `COMM_EST` asynchronous event, and the owning context drains this queue
/// on its own thread the next time it pumps CM events.
#[derive(Default)]
pub struct EstablishedHints {
    pending: Mutex<VecDeque<u32>>,
}

impl EstablishedHints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the device thread.
    fn push(&self, qp_num: u32) {
        self.pending.lock().push_back(qp_num);
    }

    /// Called from the owning context thread; drains every hint recorded
    /// since the last drain.
    pub fn drain(&self) -> Vec<u32> {
        let mut pending = self.pending.lock();
        pending.drain(..).collect()
    }
}

/// Pins the calling thread to `core_id`.
fn pin_to_core(core_id: usize) -> Result<()> {
    // SAFETY: POD type, zeroed is a valid empty cpu_set_t.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core_id, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return from_c_err::<()>(std::io::Error::last_os_error().raw_os_error().unwrap_or(ret)).map_err(Error::Io);
        }
    }
    Ok(())
}

/// Handle to the spawned device thread. Dropping this asks the thread to
/// stop and joins it.
pub struct DeviceThread {
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl DeviceThread {
    /// Spawns the device thread, pinned to `core_id`, polling every device
    /// currently (and subsequently) known to `registry` for asynchronous
    /// events. The only event with semantic effect is `IBV_EVENT_COMM_EST`,
    /// which is recorded into `hints` for the owning context to consume.
    pub fn spawn(registry: Arc<Registry>, hints: Arc<EstablishedHints>, core_id: usize) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = stop.clone();

        let join = std::thread::Builder::new()
            .name("rxio-rdma-device".into())
            .spawn(move || {
                if let Err(e) = pin_to_core(core_id) {
                    log::warn!("device thread: failed to pin to core {core_id}: {e}");
                }
                device_thread_loop(registry, hints, stop_for_thread);
            })
            .map_err(Error::Io)?;

        Ok(Self { stop, join: Some(join) })
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn device_thread_loop(registry: Arc<Registry>, hints: Arc<EstablishedHints>, stop: Arc<AtomicBool>) {
    // SAFETY: FFI; owned for the lifetime of this loop.
    let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if epoll_fd < 0 {
        log::error!("device thread: epoll_create1 failed: {}", std::io::Error::last_os_error());
        return;
    }
    let mut watched: std::collections::HashSet<std::os::unix::io::RawFd> = std::collections::HashSet::new();

    while !stop.load(Ordering::Acquire) {
        // Pick up devices opened since the last pass.
        for dev in registry.all() {
            let fd = dev.async_fd();
            if watched.insert(fd) {
                let mut ev = libc::epoll_event { events: libc::EPOLLIN as u32, u64: fd as u64 };
                // SAFETY: FFI; `fd` stays valid for the device's lifetime,
                // which outlives this loop's registration of it.
                unsafe {
                    libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev);
                }
            }
        }

        let mut events: [libc::epoll_event; 16] = unsafe { std::mem::zeroed() };
        // SAFETY: FFI; bounded buffer, 50ms timeout so `stop` is re-checked
        // promptly.
        let n = unsafe { libc::epoll_wait(epoll_fd, events.as_mut_ptr(), events.len() as i32, 50) };
        if n < 0 {
            continue;
        }
        for ev in &events[..n.max(0) as usize] {
            let fd = ev.u64 as std::os::unix::io::RawFd;
            if let Some(dev) = registry.all().into_iter().find(|d| d.async_fd() == fd) {
                drain_async_events(&dev, &hints);
            }
        }
    }

    // SAFETY: owned fd.
    unsafe {
        libc::close(epoll_fd);
    }
}

fn drain_async_events(dev: &DeviceHandle, hints: &EstablishedHints) {
    loop {
        let mut event: ibv_async_event = unsafe { std::mem::zeroed() };
        // SAFETY: FFI; non-blocking since the fd was opened non-blocking by
        // libibverbs and we only get here on epoll readiness.
        let ret = unsafe { ibv_get_async_event(dev.context_ptr(), &mut event) };
        if ret != 0 {
            break;
        }
        if event.event_type == IBV_EVENT_COMM_EST {
            // SAFETY: the union's `qp` arm is valid for this event type.
            let qp_num = unsafe { (*event.element.qp).qp_num };
            hints.push(qp_num);
        }
        // SAFETY: must ack every event we successfully retrieved.
        unsafe {
            ibv_ack_async_event(&mut event);
        }
    }
}
