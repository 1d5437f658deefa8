//! Completion-queue manager (§4.4): one CQ per (device, context), shared by
//! every connection attached to that context, reference-counted, and
//! resizable as connections reserve work-request slots.
//!
//! Grounded on `xio_cq_get`/`xio_cq_release`/`xio_cq_down` in
//! `xio_rdma_management.c` and on the teacher's `rdma::cq` for the
//! `IbvCq`/`Arc<Inner>` shape.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::rc::{Rc, Weak as RcWeak};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak as ArcWeak};

use parking_lot::Mutex;

use crate::bindings::*;
use crate::consts::{CQ_GROW_STEP, EXTRA_RQE, MAX_POLL_WC, MAX_RECV_WR, MAX_SEND_WR};
use crate::context::{ContextObserver, Interest, IoContext};
use crate::device::DeviceHandle;
use crate::error::{Error, Result};

/// Routes a beacon completion (§4.5's graceful-shutdown sequence) back to
/// whatever owns the queue pair it was posted on, without this module
/// depending on `conn`'s representation. Implemented by `conn::QpIndex`.
pub trait CompletionSink {
    fn on_beacon_completed(&self, qp_num: u32, ctx: &dyn IoContext);
}

/// Per-slab-style accounting of outstanding work-request slots reserved
/// against this CQ's current depth.
struct Slots {
    depth: u32,
    reserved: u32,
}

struct CqInner {
    cq: NonNull<ibv_cq>,
    channel: NonNull<ibv_comp_channel>,
    device: DeviceHandle,
    /// Owning I/O context, retained so teardown can unregister this CQ's fd
    /// handler and post-close observer instead of leaving them dangling.
    ctx: Rc<dyn IoContext>,
    /// Identity of the owning I/O context, used for the device's CQ-list
    /// lookup-or-create scan.
    ctx_id: usize,
    comp_vector: i32,

    slots: Mutex<Slots>,
    acked_events: AtomicU64,

    /// Number of successful `get()` calls outstanding, i.e. the
    /// application-visible refcount from §8 property 5. `post_close_observer`
    /// tears the CQ down independently of this counter, for the case where
    /// the owning context closes before every connection has put its CQ.
    refcount: AtomicU32,
    destroyed: AtomicBool,

    /// Keeps this CQ's [`PostCloseHandle`] registered with the owning
    /// context for as long as the CQ itself lives, so the context's
    /// "post-close" signal always reaches it even if no connection ever
    /// calls `put`. Only ever touched from the owning context's thread,
    /// same as `targets` in [`crate::cm::CmChannelInner`].
    post_close_observer: RefCell<Option<Rc<PostCloseHandle>>>,

    /// Dispatch target for beacon completions observed on this CQ (§4.5).
    completions: Rc<dyn CompletionSink>,
}

// SAFETY: all mutable access to `cq`/`channel`/`ctx`/`post_close_observer`
// happens through `CqInner`'s methods, which are only called from the
// owning context's single thread, except the atomics used for refcounting
// which are safe to touch from anywhere.
unsafe impl Send for CqInner {}
unsafe impl Sync for CqInner {}

impl CqInner {
    fn fd(&self) -> RawFd {
        // SAFETY: `channel` is valid for the CQ's lifetime.
        unsafe { self.channel.as_ref().fd }
    }

    fn run_teardown(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        // (a) de-link from the device's CQ list.
        let self_ptr = self as *const CqInner;
        self.device.cq_list.write().retain(|h| Arc::as_ptr(&h.0) != self_ptr);
        // (b) delete the event-loop handler; the fd is about to be closed by
        // `ibv_destroy_comp_channel` below, so no further readiness events
        // for it must reach the (about to be dangling) callback closure.
        self.ctx.unregister_fd(self.fd());
        // (c) unregister the post-close observer, if one was ever installed.
        if let Some(observer) = self.post_close_observer.borrow_mut().take() {
            self.ctx.unregister_observer(&Rc::downgrade(&observer));
        }
        // SAFETY: acknowledging every completion event we ever received
        // notification for; required before `ibv_destroy_cq`.
        let acked = self.acked_events.swap(0, Ordering::AcqRel);
        if acked > 0 {
            unsafe {
                ibv_ack_cq_events(self.cq.as_ptr(), acked as u32);
            }
        }
        // SAFETY: FFI; no other reference to this CQ survives past
        // `destroyed` being set.
        unsafe {
            ibv_destroy_cq(self.cq.as_ptr());
            ibv_destroy_comp_channel(self.channel.as_ptr());
        }
    }
}

impl Drop for CqInner {
    fn drop(&mut self) {
        self.run_teardown();
    }
}

/// Non-owning identity+teardown handle stored in [`crate::device::DeviceInner::cq_list`].
#[derive(Clone)]
pub struct CqHandle(Arc<CqInner>);

impl CqHandle {
    fn ctx_id(&self) -> usize {
        self.0.ctx_id
    }
}

/// A shared completion queue. Cloning does not bump the application-visible
/// refcount — use [`Cq::get`]/[`Cq::put`] for that; `Clone` here only shares
/// the underlying handle the way an `Rc` would.
pub struct Cq {
    inner: Arc<CqInner>,
    released: bool,
}

impl Cq {
    /// Looks up (or creates) the CQ for `(dev, ctx_id)`. Bumps the
    /// application-visible refcount by one on success.
    ///
    /// `completions` is only consulted when this call creates the CQ; a
    /// lookup that finds an existing CQ keeps dispatching to whichever sink
    /// was bound at creation (every connection on a given context shares the
    /// same `QpIndex`, so this is never observable).
    pub fn get(
        dev: &DeviceHandle,
        ctx: Rc<dyn IoContext>,
        ctx_id: usize,
        pool_default_cqe: u32,
        completions: Rc<dyn CompletionSink>,
    ) -> Result<Self> {
        {
            let list = dev.cq_list.read();
            if let Some(h) = list.iter().find(|h| h.ctx_id() == ctx_id) {
                h.0.refcount.fetch_add(1, Ordering::AcqRel);
                return Ok(Cq { inner: h.0.clone(), released: false });
            }
        }

        let alloc_size = dev.attr().max_cqe.min(pool_default_cqe as i32).max(1);
        // SAFETY: FFI; `dev.context_ptr()` is a live context for the
        // lifetime of `dev`.
        let channel = unsafe { ibv_create_comp_channel(dev.context_ptr()) };
        let channel = NonNull::new(channel)
            .ok_or_else(|| Error::OutOfMemory("ibv_create_comp_channel failed".into()))?;

        // SAFETY: FFI; making the channel fd non-blocking so the context's
        // event loop never stalls on it.
        unsafe {
            let flags = libc::fcntl(channel.as_ref().fd, libc::F_GETFL, 0);
            libc::fcntl(channel.as_ref().fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let comp_vector = (ctx.cpu_id() as i32) % dev.attr().num_comp_vectors.max(1);

        // SAFETY: FFI; `channel` was just created and is valid.
        let cq = unsafe {
            ibv_create_cq(dev.context_ptr(), alloc_size, std::ptr::null_mut(), channel.as_ptr(), comp_vector)
        };
        let cq = match NonNull::new(cq) {
            Some(cq) => cq,
            None => {
                // SAFETY: rolling back the channel we just created.
                unsafe {
                    ibv_destroy_comp_channel(channel.as_ptr());
                }
                return Err(Error::OutOfMemory("ibv_create_cq failed".into()));
            }
        };

        // SAFETY: FFI; requesting one-shot notification, which the event
        // loop callback re-arms after every drain.
        unsafe {
            ibv_req_notify_cq(cq.as_ptr(), 0);
        }

        let inner = Arc::new(CqInner {
            cq,
            channel,
            device: dev.clone(),
            ctx: ctx.clone(),
            ctx_id,
            comp_vector,
            slots: Mutex::new(Slots { depth: alloc_size as u32, reserved: 0 }),
            acked_events: AtomicU64::new(0),
            refcount: AtomicU32::new(1),
            destroyed: AtomicBool::new(false),
            post_close_observer: RefCell::new(None),
            completions,
        });

        dev.cq_list.write().push(CqHandle(inner.clone()));

        let result = Cq { inner, released: false };
        // SAFETY: `fd` stays valid for the CQ's lifetime, which this
        // registration does not extend (the callback only drains events).
        let cq_for_cb = result.inner.clone();
        ctx.register_fd(
            result.fd(),
            Interest::Readable,
            Box::new(move || {
                drain_completion_events(&cq_for_cb);
            }),
        );

        // §4.4: the CQ observes the context's post-close event and forces
        // its own teardown on that signal (independent of the application
        // refcount below), so a closed context always eventually releases
        // its CQs even if no connection explicitly released them first.
        let observer = Rc::new(PostCloseHandle(Arc::downgrade(&result.inner)));
        let observer_weak: RcWeak<dyn ContextObserver> = Rc::downgrade(&observer);
        ctx.register_observer(observer_weak);
        *result.inner.post_close_observer.borrow_mut() = Some(observer);

        Ok(result)
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd()
    }

    pub fn as_raw(&self) -> *mut ibv_cq {
        self.inner.cq.as_ptr()
    }

    pub fn refcount(&self) -> u32 {
        self.inner.refcount.load(Ordering::Acquire)
    }

    /// Reserves `n` work-request slots against this CQ's depth. If the
    /// current depth cannot satisfy the request and there is room to grow,
    /// resizes via `ibv_resize_cq`; the actually granted depth, which may be
    /// larger than requested, becomes the new depth.
    pub fn alloc_slots(&self, n: u32) -> Result<()> {
        let mut slots = self.inner.slots.lock();
        if slots.reserved + n <= slots.depth {
            slots.reserved += n;
            return Ok(());
        }

        let wanted = slots.reserved + n;
        let step = CQ_GROW_STEP * (MAX_SEND_WR + MAX_RECV_WR + EXTRA_RQE);
        let new_depth = wanted.max(slots.depth + step);
        // SAFETY: FFI.
        let ret = unsafe { ibv_resize_cq(self.inner.cq.as_ptr(), new_depth as i32) };
        if ret != 0 {
            return Err(Error::OutOfMemory(format!("ibv_resize_cq to {new_depth} failed")));
        }
        // `ibv_resize_cq` may grant more than requested; re-query to find
        // out exactly how much. Conservatively assume it granted at least
        // what we asked for if a re-query is not available here.
        slots.depth = new_depth;
        slots.reserved += n;
        Ok(())
    }

    /// Releases `n` previously reserved slots, e.g. on QP destroy.
    pub fn release_slots(&self, n: u32) {
        let mut slots = self.inner.slots.lock();
        slots.reserved = slots.reserved.saturating_sub(n);
    }

    /// Releases one reference. Runs the deleter — de-link, ack events,
    /// destroy CQ + channel — when the refcount reaches zero.
    pub fn put(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let prev = self.inner.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.inner.run_teardown();
        }
    }
}

impl Drop for Cq {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn drain_completion_events(cq: &Arc<CqInner>) {
    loop {
        let mut ev_cq: *mut ibv_cq = std::ptr::null_mut();
        let mut ev_ctx: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: FFI; non-blocking because the channel fd is non-blocking
        // and we only get here on epoll readiness.
        let ret = unsafe { ibv_get_cq_event(cq.channel.as_ptr(), &mut ev_cq, &mut ev_ctx) };
        if ret != 0 {
            break;
        }
        cq.acked_events.fetch_add(1, Ordering::AcqRel);
        // SAFETY: FFI; re-arm notification for the next batch.
        unsafe {
            ibv_req_notify_cq(cq.cq.as_ptr(), 0);
        }
        poll_beacon_completions(cq);
    }
}

/// Polls this CQ for the beacon sentinel posted on graceful disconnect
/// (§4.5). Every other completion belongs to the data-path module, which is
/// out of scope here (§1), so it is inspected only for its `wr_id` and
/// otherwise discarded.
fn poll_beacon_completions(cq: &Arc<CqInner>) {
    let mut wc: [ibv_wc; MAX_POLL_WC as usize] = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: FFI; `wc` has room for `wc.len()` entries.
        let n = unsafe { ibv_poll_cq(cq.cq.as_ptr(), wc.len() as i32, wc.as_mut_ptr()) };
        if n <= 0 {
            break;
        }
        for entry in &wc[..n as usize] {
            if entry.wr_id == XIO_BEACON_WRID {
                cq.completions.on_beacon_completed(entry.qp_num, cq.ctx.as_ref());
            }
        }
        if (n as usize) < wc.len() {
            break;
        }
    }
}

/// Bridges a [`Cq`]'s post-close observation into the [`ContextObserver`]
/// trait object the context holds a `Weak` pointer to.
struct PostCloseHandle(ArcWeak<CqInner>);

impl ContextObserver for PostCloseHandle {
    fn on_post_close(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.run_teardown();
        }
    }
}
