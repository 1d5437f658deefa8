//! Connection-manager event pump (§4.5): one CM event channel per I/O
//! context, shared by every connection in that context, draining events in
//! a loop and dispatching each to the connection it names.
//!
//! Grounded on `xio_cm_channel_get`/`xio_cma_handler`/`xio_handle_cm_event`
//! in `xio_rdma_management.c`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::bindings::*;
use crate::context::IoContext;
use crate::error::{Error, Result};

/// The event kinds the pump hands to a connection's state machine, already
/// stripped of their `rdma_cm_event` envelope (which must be acked back to
/// the kernel before the handler runs, per `xio_cma_handler`).
#[derive(Debug)]
pub enum CmEventKind {
    AddrResolved,
    RouteResolved,
    ConnectRequest { child_id: *mut rdma_cm_id, param: rdma_conn_param },
    Established { param: rdma_conn_param },
    Rejected { reason: i32 },
    Disconnected,
    AddrChange,
    TimewaitExit,
    DeviceRemoval,
    ConnectError,
    AddrError,
    RouteError,
    Unreachable,
    Other(u32),
}

/// Implemented by whatever owns a `rdma_cm_id` (a [`crate::conn::Connection`])
/// so the pump can dispatch to it without `cm` depending on `conn`'s
/// internal representation.
///
/// `ctx` is an owned, type-erased handle rather than a borrow: some
/// handlers (completion-queue creation, notably) must retain a context
/// handle past the end of the dispatch call to unregister themselves later,
/// which a borrow cannot support.
pub trait CmEventSink {
    fn handle_cm_event(self: Rc<Self>, kind: CmEventKind, ctx: &Rc<dyn IoContext>, channel: &CmChannel);
}

struct CmChannelInner {
    channel: NonNull<rdma_event_channel>,
    ctx_id: usize,
    refcount: AtomicU32,
    /// Dispatch table from `rdma_cm_id` pointer identity to the connection
    /// that owns it. Only ever touched from the owning context's thread;
    /// the `Arc` wrapper exists so the channel itself can be looked up (not
    /// mutated concurrently) from the registry's lock.
    targets: RefCell<HashMap<usize, Rc<dyn CmEventSink>>>,
    /// Owning context, bound once by [`CmChannel::bind_ctx`] right after
    /// creation. The pump closure registered on that context's event loop
    /// holds its own `CmChannel` clone for as long as it stays registered,
    /// so plain `Arc` refcounting alone would never reach zero; teardown is
    /// instead driven explicitly by [`Registry::release`] once the logical
    /// `refcount` above hits zero, same as [`crate::cq::Cq`].
    ctx: RefCell<Option<Rc<dyn IoContext>>>,
    destroyed: AtomicBool,
}

// SAFETY: `targets`/`ctx` are only read/written from the owning context's
// single thread by convention (the cooperative single-threaded-per-context
// scheduling model); only `refcount`/`destroyed` are touched from other
// threads, and those fields are atomic.
unsafe impl Send for CmChannelInner {}
unsafe impl Sync for CmChannelInner {}

impl CmChannelInner {
    fn run_teardown(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(ctx) = self.ctx.borrow_mut().take() {
            // SAFETY: `channel.fd` is valid to read until the
            // `rdma_destroy_event_channel` call below.
            let fd = unsafe { self.channel.as_ref().fd };
            ctx.unregister_fd(fd);
        }
        // SAFETY: FFI; `destroyed` guards against a double-destroy from the
        // defensive `Drop` impl below.
        unsafe {
            rdma_destroy_event_channel(self.channel.as_ptr());
        }
    }
}

impl Drop for CmChannelInner {
    fn drop(&mut self) {
        self.run_teardown();
    }
}

/// One CM event channel, shared by every connection on a context.
#[derive(Clone)]
pub struct CmChannel(Arc<CmChannelInner>);

impl CmChannel {
    pub fn as_raw(&self) -> *mut rdma_event_channel {
        self.0.channel.as_ptr()
    }

    pub fn fd(&self) -> std::os::unix::io::RawFd {
        // SAFETY: `channel` is valid for this handle's lifetime.
        unsafe { self.0.channel.as_ref().fd }
    }

    pub fn register_target(&self, cm_id: *mut rdma_cm_id, target: Rc<dyn CmEventSink>) {
        self.0.targets.borrow_mut().insert(cm_id as usize, target);
    }

    pub fn unregister_target(&self, cm_id: *mut rdma_cm_id) {
        self.0.targets.borrow_mut().remove(&(cm_id as usize));
    }

    /// Binds the context that owns this channel's pump registration, so
    /// teardown can unregister the fd handler. Called once, right after
    /// [`Registry::get_or_create`] reports that it created a fresh channel.
    pub fn bind_ctx(&self, ctx: Rc<dyn IoContext>) {
        *self.0.ctx.borrow_mut() = Some(ctx);
    }

    fn dispatch(&self, cm_id: *mut rdma_cm_id, kind: CmEventKind, ctx: &Rc<dyn IoContext>) {
        let target = self.0.targets.borrow().get(&(cm_id as usize)).cloned();
        match target {
            Some(target) => target.handle_cm_event(kind, ctx, self),
            None => {
                log::debug!("CM event for unknown cm_id {:p}; dropped", cm_id);
            }
        }
    }
}

/// Process-wide registry of CM channels, one per context, mirroring §5's
/// "CM channel list — protected by a reader-writer lock."
#[derive(Default)]
pub struct Registry {
    channels: RwLock<HashMap<usize, CmChannel>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the CM channel for `ctx_id`, if one has already been
    /// created.
    pub fn lookup(&self, ctx_id: usize) -> Option<CmChannel> {
        self.channels.read().get(&ctx_id).cloned()
    }

    /// Looks up (or creates) the CM channel for `ctx_id`. Returns the
    /// channel together with whether this call created it: on creation, the
    /// caller is responsible for registering the channel's fd with its own
    /// context handle (the registry only owns the FFI resource and the
    /// dispatch table, not a way to reach the context from a plain
    /// callback — see [`CmChannel::pump`]).
    ///
    /// Unlike [`crate::cq::Cq::get`], this does not bump a visible refcount
    /// per lookup: callers that want a counted reference use
    /// [`CmChannel::retain`]/[`CmChannel::release`].
    pub fn get_or_create(&self, ctx_id: usize) -> Result<(CmChannel, bool)> {
        if let Some(ch) = self.channels.read().get(&ctx_id) {
            return Ok((ch.clone(), false));
        }

        let mut channels = self.channels.write();
        if let Some(ch) = channels.get(&ctx_id) {
            return Ok((ch.clone(), false));
        }

        // SAFETY: FFI.
        let raw = unsafe { rdma_create_event_channel() };
        let raw = NonNull::new(raw).ok_or_else(|| Error::Io(std::io::Error::last_os_error()))?;

        // SAFETY: FFI; making the channel fd non-blocking.
        unsafe {
            let flags = libc::fcntl(raw.as_ref().fd, libc::F_GETFL, 0);
            libc::fcntl(raw.as_ref().fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let inner = Arc::new(CmChannelInner {
            channel: raw,
            ctx_id,
            refcount: AtomicU32::new(1),
            targets: RefCell::new(HashMap::new()),
            ctx: RefCell::new(None),
            destroyed: AtomicBool::new(false),
        });
        let ch = CmChannel(inner);
        channels.insert(ctx_id, ch.clone());

        Ok((ch, true))
    }

    /// Removes the registry's own entry and runs the channel's teardown:
    /// unregisters its fd handler (dropping the pump closure's `CmChannel`
    /// clone, which is otherwise the last thing keeping it alive) and
    /// destroys the underlying `rdma_event_channel`.
    pub fn release(&self, ctx_id: usize) {
        if let Some(ch) = self.channels.write().remove(&ctx_id) {
            ch.0.run_teardown();
        }
    }
}

impl CmChannel {
    pub fn retain(&self) {
        self.0.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true if this was the last reference (caller should then drop
    /// the channel and let `Drop` run `rdma_destroy_event_channel`).
    pub fn release(&self) -> bool {
        self.0.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Drains every ready event on this channel, dispatching each to its
    /// registered target, until `rdma_get_cm_event` returns `EAGAIN`. Each
    /// event is copied out and acked back to the kernel before its handler
    /// runs, matching `xio_cma_handler`'s "capture event locally, ack,
    /// then dispatch" ordering (the CM forbids touching the event after
    /// acking it).
    pub fn pump(&self, ctx: &Rc<dyn IoContext>) {
        loop {
            let mut raw_event: *mut rdma_cm_event = std::ptr::null_mut();
            // SAFETY: FFI; non-blocking since the channel fd is
            // non-blocking and we are called from the readiness callback.
            let ret = unsafe { rdma_get_cm_event(self.as_raw(), &mut raw_event) };
            if ret != 0 {
                break;
            }
            // SAFETY: `raw_event` is non-null on success.
            let event = unsafe { &*raw_event };
            let cm_id = event.id;
            let kind = classify(event);
            // SAFETY: must ack exactly once per successfully retrieved
            // event, and must do so before the event's memory is reused.
            unsafe {
                rdma_ack_cm_event(raw_event);
            }
            self.dispatch(cm_id, kind, ctx);
        }
    }
}

fn classify(event: &rdma_cm_event) -> CmEventKind {
    match event.event {
        RDMA_CM_EVENT_ADDR_RESOLVED => CmEventKind::AddrResolved,
        RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventKind::RouteResolved,
        RDMA_CM_EVENT_CONNECT_REQUEST => CmEventKind::ConnectRequest {
            child_id: event.id,
            // SAFETY: valid for `CONNECT_REQUEST`/`ESTABLISHED` events.
            param: unsafe { event.param.conn },
        },
        RDMA_CM_EVENT_ESTABLISHED => CmEventKind::Established {
            // SAFETY: valid for `ESTABLISHED` events.
            param: unsafe { event.param.conn },
        },
        RDMA_CM_EVENT_REJECTED => CmEventKind::Rejected {
            // SAFETY: valid for `REJECTED` events.
            reason: unsafe { event.status },
        },
        RDMA_CM_EVENT_DISCONNECTED => CmEventKind::Disconnected,
        RDMA_CM_EVENT_ADDR_CHANGE => CmEventKind::AddrChange,
        RDMA_CM_EVENT_TIMEWAIT_EXIT => CmEventKind::TimewaitExit,
        RDMA_CM_EVENT_DEVICE_REMOVAL => CmEventKind::DeviceRemoval,
        RDMA_CM_EVENT_CONNECT_ERROR => CmEventKind::ConnectError,
        RDMA_CM_EVENT_ADDR_ERROR => CmEventKind::AddrError,
        RDMA_CM_EVENT_ROUTE_ERROR => CmEventKind::RouteError,
        RDMA_CM_EVENT_UNREACHABLE => CmEventKind::Unreachable,
        other => CmEventKind::Other(other as u32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_event(kind: u32) -> rdma_cm_event {
        // SAFETY: test-only; `classify` never dereferences `id`, and the
        // zeroed `param` union is valid for every variant it reads from.
        let mut event: rdma_cm_event = unsafe { std::mem::zeroed() };
        event.event = kind;
        event
    }

    #[test]
    fn classifies_simple_events() {
        assert!(matches!(classify(&raw_event(RDMA_CM_EVENT_ADDR_RESOLVED)), CmEventKind::AddrResolved));
        assert!(matches!(classify(&raw_event(RDMA_CM_EVENT_ROUTE_RESOLVED)), CmEventKind::RouteResolved));
        assert!(matches!(classify(&raw_event(RDMA_CM_EVENT_DISCONNECTED)), CmEventKind::Disconnected));
        assert!(matches!(classify(&raw_event(RDMA_CM_EVENT_ADDR_CHANGE)), CmEventKind::AddrChange));
        assert!(matches!(classify(&raw_event(RDMA_CM_EVENT_TIMEWAIT_EXIT)), CmEventKind::TimewaitExit));
        assert!(matches!(classify(&raw_event(RDMA_CM_EVENT_DEVICE_REMOVAL)), CmEventKind::DeviceRemoval));
    }

    #[test]
    fn classifies_error_events() {
        assert!(matches!(classify(&raw_event(RDMA_CM_EVENT_CONNECT_ERROR)), CmEventKind::ConnectError));
        assert!(matches!(classify(&raw_event(RDMA_CM_EVENT_ADDR_ERROR)), CmEventKind::AddrError));
        assert!(matches!(classify(&raw_event(RDMA_CM_EVENT_ROUTE_ERROR)), CmEventKind::RouteError));
        assert!(matches!(classify(&raw_event(RDMA_CM_EVENT_UNREACHABLE)), CmEventKind::Unreachable));
    }

    #[test]
    fn classifies_connect_request_and_established() {
        assert!(matches!(classify(&raw_event(RDMA_CM_EVENT_CONNECT_REQUEST)), CmEventKind::ConnectRequest { .. }));
        assert!(matches!(classify(&raw_event(RDMA_CM_EVENT_ESTABLISHED)), CmEventKind::Established { .. }));
    }

    #[test]
    fn classifies_rejected_with_status_as_reason() {
        let mut event = raw_event(RDMA_CM_EVENT_REJECTED);
        event.status = 7;
        match classify(&event) {
            CmEventKind::Rejected { reason } => assert_eq!(reason, 7),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn classifies_unknown_event_as_other() {
        assert!(matches!(classify(&raw_event(9999)), CmEventKind::Other(9999)));
    }
}
