//! Connection state machine and CM dispatch table (§4.5, §4.6).
//!
//! Grounded on `xio_rdma_management.c`'s `xio_cma_handler` (the dispatch
//! table), `xio_rdma_disconnect_helper`/`xio_disconnect` (the beacon +
//! timewait shutdown sequence), and `xio_rdma_dup2` (device migration).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ptr::NonNull;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use crate::bindings::*;
use crate::cm::{self, CmChannel, CmEventKind, CmEventSink};
use crate::consts::*;
use crate::context::{ContextObserver, Interest, IoContext, TimerHandle};
use crate::cq::{CompletionSink, Cq};
use crate::device::{DeviceHandle, EstablishedHints, Registry as DeviceRegistry};
use crate::error::{Error, Result};
use crate::mr::Registry as MrRegistry;
use crate::options::Options;
use crate::pool::{self, TaskPool};
use crate::slab;

/// States a connection moves through. See the module-level transition table
/// in [`ConnectionInner::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Listen,
    Connecting,
    Connected,
    Disconnected,
    Reconnect,
    Closed,
    Destroyed,
}

/// Events delivered to an [`UpcallObserver`].
#[derive(Debug, Clone)]
pub enum UpcallEvent {
    NewConnection,
    Established,
    Refused { reason: String },
    Disconnected,
    Closed,
    Error(ErrorCode),
}

/// A coarse classification of the error kinds an observer can switch on
/// without matching the full [`Error`] enum (which also carries
/// non-upcalled variants like [`Error::ProgramError`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Addr,
    Route,
    Unreachable,
    Connect,
}

pub trait UpcallObserver {
    fn on_upcall(&self, conn: &Connection, event: UpcallEvent);
}

/// One scatter/gather entry of a message being validated.
#[derive(Debug, Clone, Copy)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    /// `Some(lkey)` for an MR-backed segment, `None` for a phantom/inline one.
    pub lkey: Option<u32>,
}

/// Shared handles every connection on a context needs: the process-wide
/// registries plus this context's identity. Constructed once by the host
/// application and handed to every [`Connection::connect`]/[`Connection::listen`]
/// call on that context.
///
/// `devices` and `established_hints` are `Arc`-wrapped rather than `Rc`:
/// both are also handed to [`crate::device::DeviceThread::spawn`], which
/// runs on a genuinely separate OS thread, so the same instances must be
/// shareable across the thread boundary. Everything else here is only ever
/// touched from the owning context's thread and stays `Rc`.
pub struct Env {
    pub devices: Arc<DeviceRegistry>,
    pub mr_registry: Rc<MrRegistry>,
    pub cm_registry: Rc<cm::Registry>,
    pub options: Rc<Options>,
    pub established_hints: Arc<EstablishedHints>,
    pub ctx_id: usize,
    pub cq_pool_default: u32,
    /// Backing for connections' "primary" task pool when
    /// [`Options::enable_mem_pool`] is set (§4.7). `None` if the host never
    /// configured a shared slab pool, in which case every connection falls
    /// back to a dedicated registration for its primary pool too.
    pub slab_pool: Option<Rc<slab::Pool>>,
}

/// Maps live queue-pair numbers to their owning connection, so the context
/// can turn a [`EstablishedHints`] drain (populated by the device thread)
/// into a forced state advance without the device thread ever touching
/// connection state itself.
#[derive(Default)]
pub struct QpIndex {
    by_qp_num: RefCell<HashMap<u32, Weak<ConnectionInner>>>,
}

impl QpIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, qp_num: u32, conn: &Rc<ConnectionInner>) {
        self.by_qp_num.borrow_mut().insert(qp_num, Rc::downgrade(conn));
    }

    fn unregister(&self, qp_num: u32) {
        self.by_qp_num.borrow_mut().remove(&qp_num);
    }

    /// Drains `hints` and forces every matching connection's CM state
    /// forward, covering the race where data arrives before the CM
    /// delivers `ESTABLISHED`.
    pub fn apply_hints(&self, hints: &EstablishedHints) {
        for qp_num in hints.drain() {
            if let Some(conn) = self.by_qp_num.borrow().get(&qp_num).and_then(Weak::upgrade) {
                conn.force_established();
            }
        }
    }
}

impl CompletionSink for QpIndex {
    /// Routes a beacon completion (§4.5) back to the connection that posted
    /// it, dropping the beacon reference taken in `on_established`.
    fn on_beacon_completed(&self, qp_num: u32, ctx: &dyn IoContext) {
        if let Some(conn) = self.by_qp_num.borrow().get(&qp_num).and_then(Weak::upgrade) {
            conn.on_beacon_completed(ctx);
        }
    }
}

struct NestingGuard<'a>(&'a Cell<u32>);

impl<'a> NestingGuard<'a> {
    fn enter(nesting: &'a Cell<u32>) -> Self {
        nesting.set(nesting.get() + 1);
        Self(nesting)
    }
}

impl Drop for NestingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

/// The per-connection object. See the Data Model's `Connection` row for the
/// full essential-state list; fields here are grouped by concern rather than
/// listed in that order.
pub struct ConnectionInner {
    env: Rc<Env>,
    qp_index: Rc<QpIndex>,

    state: Cell<State>,
    cm_id: Cell<*mut rdma_cm_id>,
    qp: Cell<*mut ibv_qp>,
    cq: RefCell<Option<Cq>>,
    device: RefCell<Option<DeviceHandle>>,
    cm_channel: RefCell<Option<CmChannel>>,
    portal_uri: RefCell<String>,
    is_listener: Cell<bool>,

    handler_nesting: Cell<u32>,
    deferred_post_close: Cell<bool>,
    refcount: Cell<u32>,

    beacon_outstanding: Cell<bool>,
    timewait_handle: RefCell<Option<TimerHandle>>,
    ignore_timewait: Cell<bool>,

    /// Built by `dup2` when migrating to a new device: maps this
    /// connection's own old rkeys to the new device's rkeys.
    rkey_tbl: RefCell<Vec<(u32, u32)>>,
    /// Supplied by the peer out of band (message framing, out of scope);
    /// used by `update_task` to translate remote SGE rkeys.
    peer_rkey_tbl: RefCell<Vec<(u32, u32)>>,

    observer: RefCell<Option<Weak<dyn UpcallObserver>>>,

    /// Small fixed pool used for handshake-time messages, created alongside
    /// the QP. §4.7.
    initial_pool: RefCell<Option<Rc<TaskPool>>>,
    /// Larger pool used for steady-state I/O, backed by the shared slab
    /// pool when available. §4.7.
    primary_pool: RefCell<Option<Rc<TaskPool>>>,
    /// Stub pool tracking in-flight zero-copy RDMA reads/writes against the
    /// peer's own registered buffers. §4.7.
    phantom_pool: RefCell<Option<Rc<TaskPool>>>,
}

/// A reference-counted handle to a connection. Cloning shares the same
/// underlying object (it does not call [`Connection::retain`] — use that
/// explicitly when taking one of the three named references described in
/// §3's Data Model).
#[derive(Clone)]
pub struct Connection(Rc<ConnectionInner>);

impl Connection {
    pub fn state(&self) -> State {
        self.0.state.get()
    }

    pub fn refcount(&self) -> u32 {
        self.0.refcount.get()
    }

    /// True once the last reference has dropped while a CM handler was
    /// still on the stack, and final teardown has been deferred to a
    /// context event (§8 property 6).
    pub fn is_post_close_deferred(&self) -> bool {
        self.0.deferred_post_close.get()
    }

    pub fn device(&self) -> Option<DeviceHandle> {
        self.0.device.borrow().clone()
    }

    pub fn portal_uri(&self) -> String {
        self.0.portal_uri.borrow().clone()
    }

    /// Opens a client connection to `remote`, starting the CM handshake.
    /// `INIT -> CONNECTING` happens immediately; further progress (device
    /// resolution, QP creation, `ESTABLISHED`) happens as CM events arrive
    /// on `ctx`.
    pub fn connect<C: IoContext + Clone + 'static>(
        env: Rc<Env>,
        qp_index: Rc<QpIndex>,
        ctx: &C,
        remote: SocketAddr,
        observer: Weak<dyn UpcallObserver>,
    ) -> Result<Connection> {
        let channel = ensure_channel_registered(&env, ctx)?;

        let mut cm_id: *mut rdma_cm_id = std::ptr::null_mut();
        // SAFETY: FFI; `channel.as_raw()` is a live event channel.
        let ret = unsafe {
            rdma_create_id(channel.as_raw(), &mut cm_id, std::ptr::null_mut(), rdma_port_space::RDMA_PS_TCP)
        };
        if ret != 0 {
            return Err(Error::ConnectError(format!("rdma_create_id failed: {}", std::io::Error::last_os_error())));
        }

        let (mut storage, len) = to_sockaddr(remote);
        // SAFETY: FFI; `cm_id` was just created, `storage` is a valid
        // out-of-scope sockaddr for the duration of this call.
        let ret = unsafe {
            rdma_resolve_addr(
                cm_id,
                std::ptr::null_mut(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                ADDR_RESOLVE_TIMEOUT_MS,
            )
        };
        let _ = len;
        if ret != 0 {
            // SAFETY: rolling back the id we just created.
            unsafe {
                rdma_destroy_id(cm_id);
            }
            return Err(Error::AddrError(format!("rdma_resolve_addr failed: {}", std::io::Error::last_os_error())));
        }

        let inner = Rc::new(ConnectionInner::new(env, qp_index, cm_id, channel.clone(), format!("rdma://{remote}")));
        inner.state.set(State::Connecting);
        *inner.observer.borrow_mut() = Some(observer);
        channel.register_target(cm_id, inner.clone() as Rc<dyn CmEventSink>);

        Ok(Connection(inner))
    }

    /// Starts listening on `local`. `INIT -> LISTEN`.
    pub fn listen<C: IoContext + Clone + 'static>(
        env: Rc<Env>,
        qp_index: Rc<QpIndex>,
        ctx: &C,
        local: SocketAddr,
        observer: Weak<dyn UpcallObserver>,
    ) -> Result<Connection> {
        let channel = ensure_channel_registered(&env, ctx)?;

        let mut cm_id: *mut rdma_cm_id = std::ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe {
            rdma_create_id(channel.as_raw(), &mut cm_id, std::ptr::null_mut(), rdma_port_space::RDMA_PS_TCP)
        };
        if ret != 0 {
            return Err(Error::ConnectError(format!("rdma_create_id failed: {}", std::io::Error::last_os_error())));
        }

        let (mut storage, _len) = to_sockaddr(local);
        // SAFETY: FFI.
        let ret = unsafe { rdma_bind_addr(cm_id, &mut storage as *mut _ as *mut libc::sockaddr) };
        if ret != 0 {
            unsafe {
                rdma_destroy_id(cm_id);
            }
            return Err(Error::AddrError(format!("rdma_bind_addr failed: {}", std::io::Error::last_os_error())));
        }
        // SAFETY: FFI; backlog of 16 is a reasonable default for a listener.
        let ret = unsafe { rdma_listen(cm_id, 16) };
        if ret != 0 {
            unsafe {
                rdma_destroy_id(cm_id);
            }
            return Err(Error::ConnectError(format!("rdma_listen failed: {}", std::io::Error::last_os_error())));
        }

        let inner = Rc::new(ConnectionInner::new(env, qp_index, cm_id, channel.clone(), format!("rdma://{local}")));
        inner.state.set(State::Listen);
        inner.is_listener.set(true);
        *inner.observer.borrow_mut() = Some(observer);
        channel.register_target(cm_id, inner.clone() as Rc<dyn CmEventSink>);

        Ok(Connection(inner))
    }

    /// Local close request. Behavior depends on the current state, per
    /// §4.6's transition table: a live connection sends `rdma_disconnect`
    /// without a beacon and moves straight to `CLOSED`; an already
    /// disconnected one just moves to `CLOSED`; anything else (including a
    /// listener) is torn down directly.
    pub fn close(&self) {
        self.0.local_close();
    }

    /// Takes one of the three named references from §3 (owner/beacon/
    /// timewait). Pair with [`Connection::release`].
    pub fn retain(&self) {
        self.0.refcount.set(self.0.refcount.get() + 1);
    }

    /// Drops one reference. Runs `post_close` when the last of the three
    /// named references (owner, beacon, timewait) is released, unless a CM
    /// handler is currently on the stack, in which case teardown is
    /// deferred to a context event.
    pub fn release(&self, ctx: &dyn IoContext) {
        self.0.release(ctx);
    }

    /// Transplants a reconnect attempt (`new`) onto an already-live
    /// connection (`old`): if they sit on different devices, builds an
    /// rkey remap table from `old`'s device to `new`'s, then tears down
    /// `new`'s resources and hands the caller back `old` with one extra
    /// reference taken. Per §9's open question, the contract for *when* the
    /// caller may safely drop its reference to `new` afterwards belongs to
    /// the enclosing reconnect/nexus layer, not to this core.
    pub fn dup2(new: Connection, old: &Connection, mr_registry: &MrRegistry) -> Result<Connection> {
        let new_dev = new.device();
        let old_dev = old.device();
        if let (Some(new_dev), Some(old_dev)) = (&new_dev, &old_dev) {
            if new_dev.identity() != old_dev.identity() {
                let table = mr_registry.build_rkey_table(old_dev, new_dev)?;
                *old.0.rkey_tbl.borrow_mut() = table;
                old.0.remap_pools(new_dev.identity());
            }
        }
        new.0.teardown_resources_only();
        old.retain();
        Ok(old.clone())
    }

    /// Translates every rkey-bearing SGE of `sges` through the peer-supplied
    /// remap table installed by the last reconnect. Fails with
    /// [`Error::InvalidArgument`] if any rkey is not present in the table.
    pub fn update_task(&self, sges: &mut [Sge]) -> Result<()> {
        let table = self.0.peer_rkey_tbl.borrow();
        for sge in sges.iter_mut() {
            if let Some(old_rkey) = sge.lkey {
                match table.iter().find(|(old, _)| *old == old_rkey) {
                    Some((_, new_rkey)) => sge.lkey = Some(*new_rkey),
                    None => {
                        return Err(Error::InvalidArgument(format!(
                            "no remap entry for rkey {old_rkey:#x}"
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    /// Installs the peer-supplied `(old_rkey, new_rkey)` table used by
    /// [`Connection::update_task`], typically received out of band after a
    /// reconnect.
    pub fn set_peer_rkey_table(&self, table: Vec<(u32, u32)>) {
        *self.0.peer_rkey_tbl.borrow_mut() = table;
    }

    /// Rejects an inbound request whose SGE list exceeds `max_in_iovsz`,
    /// mixes MR-backed and non-MR-backed segments, contains a zero-length
    /// segment with a non-null address, or whose header exceeds
    /// [`MAX_INLINE_HEADER`].
    pub fn is_valid_in_req(&self, sges: &[Sge], header_len: usize) -> bool {
        is_valid_sge_list(sges, self.0.env.options.max_in_iovsz() as usize, header_len)
    }

    pub fn is_valid_out_msg(&self, sges: &[Sge], header_len: usize) -> bool {
        is_valid_sge_list(sges, self.0.env.options.max_out_iovsz() as usize, header_len)
    }
}

fn is_valid_sge_list(sges: &[Sge], max_iovsz: usize, header_len: usize) -> bool {
    if sges.len() > max_iovsz {
        return false;
    }
    if header_len > MAX_INLINE_HEADER {
        return false;
    }
    let mr_backed = sges.iter().filter(|s| s.lkey.is_some()).count();
    if mr_backed != 0 && mr_backed != sges.len() {
        return false;
    }
    for sge in sges {
        if sge.length == 0 && sge.addr != 0 {
            return false;
        }
    }
    true
}

fn ensure_channel_registered<C: IoContext + Clone + 'static>(env: &Env, ctx: &C) -> Result<CmChannel> {
    let (channel, created) = env.cm_registry.get_or_create(env.ctx_id)?;
    if created {
        let ch = channel.clone();
        // Boxed once per channel rather than per dispatch: handlers further
        // down (completion-queue creation) need an owned context handle to
        // outlive the dispatch call, which a plain `&dyn IoContext` cannot
        // give them.
        let ctx_for_pump: Rc<dyn IoContext> = Rc::new(ctx.clone());
        channel.bind_ctx(ctx_for_pump.clone());
        ctx.register_fd(
            channel.fd(),
            Interest::Readable,
            Box::new(move || {
                ch.pump(&ctx_for_pump);
            }),
        );
    }
    Ok(channel)
}

fn to_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: zeroed `sockaddr_storage` is a valid representation.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

impl ConnectionInner {
    fn new(env: Rc<Env>, qp_index: Rc<QpIndex>, cm_id: *mut rdma_cm_id, channel: CmChannel, portal_uri: String) -> Self {
        channel.retain();
        Self {
            env,
            qp_index,
            state: Cell::new(State::Init),
            cm_id: Cell::new(cm_id),
            qp: Cell::new(std::ptr::null_mut()),
            cq: RefCell::new(None),
            device: RefCell::new(None),
            cm_channel: RefCell::new(Some(channel)),
            portal_uri: RefCell::new(portal_uri),
            is_listener: Cell::new(false),
            handler_nesting: Cell::new(0),
            deferred_post_close: Cell::new(false),
            refcount: Cell::new(1),
            beacon_outstanding: Cell::new(false),
            timewait_handle: RefCell::new(None),
            ignore_timewait: Cell::new(false),
            rkey_tbl: RefCell::new(Vec::new()),
            peer_rkey_tbl: RefCell::new(Vec::new()),
            observer: RefCell::new(None),
            initial_pool: RefCell::new(None),
            primary_pool: RefCell::new(None),
            phantom_pool: RefCell::new(None),
        }
    }

    fn emit(&self, conn: &Connection, event: UpcallEvent) {
        if let Some(obs) = self.observer.borrow().as_ref().and_then(Weak::upgrade) {
            obs.on_upcall(conn, event);
        }
    }

    /// §4.3's "force established" hint: the device thread saw
    /// `IBV_EVENT_COMM_EST` for this connection's QP before the CM
    /// delivered `ESTABLISHED`. Advances state the same way the real event
    /// would, without waiting for the CM.
    fn force_established(self: &Rc<Self>) {
        if self.state.get() == State::Connecting {
            log::debug!("forcing ESTABLISHED via device-thread hint for {:p}", self.cm_id.get());
            self.on_established(None);
        }
    }

    fn on_established(self: &Rc<Self>, param: Option<rdma_conn_param>) {
        let _ = param;
        self.state.set(State::Connected);
        // Two extra references: one for the pending beacon, one for the
        // timewait deadline, per §4.5's ESTABLISHED row.
        self.refcount.set(self.refcount.get() + 2);
        self.beacon_outstanding.set(true);
    }

    fn local_close(self: &Rc<Self>) {
        match self.state.get() {
            State::Connected => {
                // SAFETY: FFI; no beacon on a locally initiated close.
                unsafe {
                    rdma_disconnect(self.cm_id.get());
                }
                self.state.set(State::Closed);
            }
            State::Closed | State::Destroyed => {}
            _ => {
                self.state.set(State::Closed);
            }
        }
    }

    fn post_beacon(&self) {
        if let Some(qp) = NonNull::new(self.qp.get()) {
            let mut wr: ibv_send_wr = unsafe { std::mem::zeroed() };
            wr.wr_id = XIO_BEACON_WRID;
            wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            let mut bad_wr: *mut ibv_send_wr = std::ptr::null_mut();
            // SAFETY: FFI; `wr` is a minimal zero-length signalled send,
            // valid as long as the QP is still in a postable state.
            unsafe {
                ibv_post_send(qp.as_ptr(), &mut wr, &mut bad_wr);
            }
        }
    }

    fn on_disconnected(self: &Rc<Self>, ctx: &dyn IoContext) {
        match self.state.get() {
            State::Connected => {
                self.post_beacon();
                self.state.set(State::Disconnected);
                self.arm_timewait(ctx);
            }
            State::Connecting => {
                self.state.set(State::Disconnected);
                if self.beacon_outstanding.get() {
                    self.beacon_outstanding.set(false);
                    self.release(ctx);
                }
            }
            State::Closed => {
                self.post_beacon();
            }
            _ => {}
        }
    }

    /// Called when the CQ observes the beacon's completion (§4.5), proving
    /// every in-flight WR on this QP has drained. Drops the reference taken
    /// in `on_established`, mirroring the `State::Connecting` arm of
    /// `on_disconnected` above for the case where the beacon never actually
    /// goes out on the wire.
    fn on_beacon_completed(self: &Rc<Self>, ctx: &dyn IoContext) {
        if self.beacon_outstanding.get() {
            self.beacon_outstanding.set(false);
            self.release(ctx);
        }
    }

    fn arm_timewait(self: &Rc<Self>, ctx: &dyn IoContext) {
        let timeout = if self.ignore_timewait.get() {
            TIMEWAIT_EXIT_FAST_TIMEOUT_MS
        } else {
            TIMEWAIT_EXIT_TIMEOUT_MS
        };
        let weak = Rc::downgrade(self);
        let handle = ctx.schedule_delayed(
            Duration::from_millis(timeout),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    log::warn!(
                        "timewait deadline fired without a TIMEWAIT_EXIT event for {:p}; forcing teardown",
                        inner.cm_id.get()
                    );
                    let conn = Connection(inner.clone());
                    // Scheduled callbacks cannot be handed a live `&dyn
                    // IoContext` (the context's own contract in §6 only
                    // promises the callback itself runs on its thread), so
                    // the fallback path runs the same cleanup without one;
                    // this is always safe here since a timer callback is
                    // never nested inside a CM dispatch.
                    inner.on_timewait_exit(&conn, None);
                }
            }),
        );
        *self.timewait_handle.borrow_mut() = Some(handle);
    }

    fn on_timewait_exit(self: &Rc<Self>, conn: &Connection, ctx: Option<&dyn IoContext>) {
        if let Some(handle) = self.timewait_handle.borrow_mut().take() {
            if let Some(ctx) = ctx {
                ctx.cancel_delayed(handle);
            }
        }
        // Flushing the per-direction task lists is the task-pool
        // machinery's job (out of scope); here we only drop this
        // connection's handle to whichever pools it owned, once pools
        // exist (see `pool.rs`).
        if self.state.get() == State::Disconnected {
            self.emit(conn, UpcallEvent::Disconnected);
        }
        match ctx {
            Some(ctx) => self.release(ctx),
            None => self.release_no_ctx(),
        }
    }

    fn release(self: &Rc<Self>, ctx: &dyn IoContext) {
        if self.dec_refcount_and_check_zero() {
            if self.handler_nesting.get() > 0 {
                self.state.set(State::Destroyed);
                self.deferred_post_close.set(true);
                let weak = Rc::downgrade(self);
                ctx.schedule_once(Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.run_post_close();
                    }
                }));
            } else {
                self.run_post_close();
            }
        }
    }

    /// Variant of [`Self::release`] for call sites that cannot supply a
    /// context handle (the timewait fallback). Asserts it is never reached
    /// while nested inside a CM dispatch, since only `handle_cm_event`
    /// increments `handler_nesting` and its callers always have a `ctx`.
    fn release_no_ctx(self: &Rc<Self>) {
        if self.dec_refcount_and_check_zero() {
            debug_assert_eq!(self.handler_nesting.get(), 0, "release_no_ctx invoked from inside a CM handler");
            self.run_post_close();
        }
    }

    fn dec_refcount_and_check_zero(&self) -> bool {
        let prev = self.refcount.get();
        debug_assert!(prev > 0, "release on a connection with no references");
        self.refcount.set(prev - 1);
        prev - 1 == 0
    }

    fn run_post_close(self: &Rc<Self>) {
        self.destroy_pools();
        let cm_id_for_unregister = self.cm_id.get();
        if let Some(cm_id) = NonNull::new(self.cm_id.get()) {
            if let Some(qp) = NonNull::new(self.qp.get()) {
                if let Some(cq) = self.cq.borrow().as_ref() {
                    cq.release_slots(MAX_SEND_WR + MAX_RECV_WR + EXTRA_RQE);
                }
                // SAFETY: FFI; last use of the QP.
                unsafe {
                    ibv_destroy_qp(qp.as_ptr());
                }
                let qp_num = unsafe { qp.as_ref().qp_num };
                self.qp_index.unregister(qp_num);
                self.qp.set(std::ptr::null_mut());
            }
            *self.cq.borrow_mut() = None;
            // SAFETY: FFI; releases the CM id, must not be called while a
            // handler for this id is on the stack (guaranteed by the
            // nesting-deferral above).
            unsafe {
                rdma_destroy_id(cm_id.as_ptr());
            }
            self.cm_id.set(std::ptr::null_mut());
        }
        if let Some(channel) = self.cm_channel.borrow_mut().take() {
            channel.unregister_target(cm_id_for_unregister);
            if channel.release() {
                self.env.cm_registry.release(self.env.ctx_id);
            }
        }
        self.state.set(State::Destroyed);
        self.deferred_post_close.set(false);
    }

    /// Used by [`Connection::dup2`] to tear down a connection's resources
    /// without going through the graceful beacon/timewait sequence: the
    /// connection being replaced was never handed to the application.
    fn teardown_resources_only(self: &Rc<Self>) {
        self.run_post_close();
    }

    fn on_connect_request(self: &Rc<Self>, child_id: *mut rdma_cm_id, param: rdma_conn_param, ctx: &Rc<dyn IoContext>) {
        let env = self.env.clone();
        // SAFETY: `child_id` is a freshly minted CM id from `rdma_get_cm_event`;
        // its `verbs` field is populated for `CONNECT_REQUEST`.
        let verbs = unsafe { (*child_id).verbs };
        let dev = match env.devices.get_or_open(verbs) {
            Ok(dev) => dev,
            Err(e) => {
                log::warn!("rejecting incoming connection: failed to open device: {e}");
                reject(child_id);
                return;
            }
        };

        let channel = self.cm_channel.borrow().clone().expect("listener always has a channel");
        let child = Rc::new(ConnectionInner::new(
            env.clone(),
            self.qp_index.clone(),
            child_id,
            channel.clone(),
            self.portal_uri.borrow().clone(),
        ));
        child.state.set(State::Connecting);
        *child.observer.borrow_mut() = self.observer.borrow().clone();
        channel.register_target(child_id, child.clone() as Rc<dyn CmEventSink>);

        if let Err(e) = child.create_qp_on(&env, dev.clone(), ctx) {
            log::warn!("rejecting incoming connection: QP creation failed: {e}");
            reject(child_id);
            child.run_post_close();
            return;
        }

        let conn = Connection(child.clone());
        child.emit(&conn, UpcallEvent::NewConnection);

        let responder_resources = param.responder_resources.min(dev.attr().max_qp_rd_atom as u8);
        let initiator_depth = param.initiator_depth.min(dev.attr().max_qp_init_rd_atom as u8);
        let mut accept_param: rdma_conn_param = unsafe { std::mem::zeroed() };
        accept_param.responder_resources = responder_resources;
        accept_param.initiator_depth = initiator_depth;
        accept_param.retry_count = RETRY_COUNT;
        accept_param.rnr_retry_count = RETRY_COUNT;
        // SAFETY: FFI; `child_id` has a QP attached by `create_qp_on`.
        let ret = unsafe { rdma_accept(child_id, &mut accept_param) };
        if ret != 0 {
            log::warn!("rdma_accept failed: {}", std::io::Error::last_os_error());
            child.run_post_close();
        }
    }

    fn create_qp_on(self: &Rc<Self>, env: &Env, dev: DeviceHandle, ctx: &Rc<dyn IoContext>) -> Result<()> {
        let cq = Cq::get(&dev, ctx.clone(), env.ctx_id, env.cq_pool_default, self.qp_index.clone())?;
        cq.alloc_slots(MAX_SEND_WR + MAX_RECV_WR + EXTRA_RQE)?;

        let mut attr: ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.send_cq = cq.as_raw();
        attr.recv_cq = cq.as_raw();
        attr.cap.max_send_wr = MAX_SEND_WR;
        attr.cap.max_recv_wr = MAX_RECV_WR + EXTRA_RQE;
        attr.cap.max_send_sge = 4;
        attr.cap.max_recv_sge = 4;
        attr.sq_sig_all = 0;

        // SAFETY: FFI; `self.cm_id` is a live id bound to `dev`'s verbs
        // context (guaranteed by the caller having resolved/accepted on it).
        let ret = unsafe { rdma_create_qp(self.cm_id.get(), dev.pd_ptr(), &mut attr) };
        if ret != 0 {
            return Err(Error::OutOfMemory(format!("rdma_create_qp failed: {}", std::io::Error::last_os_error())));
        }
        // SAFETY: populated by `rdma_create_qp` on success.
        let qp = unsafe { (*self.cm_id.get()).qp };
        self.qp.set(qp);
        let qp_num = unsafe { (*qp).qp_num };
        self.qp_index.register(qp_num, self);

        *self.device.borrow_mut() = Some(dev);
        *self.cq.borrow_mut() = Some(cq);
        self.create_pools(env)?;
        Ok(())
    }

    /// Builds the initial, primary, and phantom pools for a freshly created
    /// QP, per §4.7: initial is always a dedicated registration sized for
    /// handshake traffic; primary draws from the shared slab pool when the
    /// host configured one and enabled it via [`Options::enable_mem_pool`],
    /// falling back to its own dedicated registration otherwise; phantom is
    /// created right alongside primary since nothing here defers it further.
    fn create_pools(&self, env: &Env) -> Result<()> {
        let initial = TaskPool::new_dedicated(
            &env.devices,
            &env.mr_registry,
            pool::PoolParams {
                initial: INITIAL_POOL_MAX_TASKS,
                grow: 0,
                max: INITIAL_POOL_MAX_TASKS,
                task_len: INITIAL_POOL_TASK_LEN,
            },
            Box::new(pool::NullHooks),
        )?;
        *self.initial_pool.borrow_mut() = Some(Rc::new(initial));

        let primary_params = pool::PoolParams {
            initial: PRIMARY_POOL_INITIAL_TASKS,
            grow: PRIMARY_POOL_GROW_TASKS,
            max: PRIMARY_POOL_MAX_TASKS,
            task_len: PRIMARY_POOL_TASK_LEN,
        };
        let primary = match &env.slab_pool {
            Some(slab_pool) if env.options.enable_mem_pool() => TaskPool::new_slab_backed(
                slab_pool.clone(),
                env.devices.clone(),
                env.mr_registry.clone(),
                primary_params,
                Box::new(pool::NullHooks),
            ),
            _ => TaskPool::new_dedicated(&env.devices, &env.mr_registry, primary_params, Box::new(pool::NullHooks))?,
        };
        *self.primary_pool.borrow_mut() = Some(Rc::new(primary));

        let phantom = TaskPool::new_phantom(
            pool::PoolParams { initial: 0, grow: 0, max: PHANTOM_POOL_MAX_TASKS, task_len: 0 },
            Box::new(pool::NullHooks),
        );
        *self.phantom_pool.borrow_mut() = Some(Rc::new(phantom));

        Ok(())
    }

    /// Rewrites every live task's lkey in all three pools after a `dup2`
    /// device migration.
    fn remap_pools(&self, new_device_identity: usize) {
        for pool in [&self.initial_pool, &self.primary_pool, &self.phantom_pool] {
            if let Some(pool) = pool.borrow().as_ref() {
                pool.remap(new_device_identity);
            }
        }
    }

    /// Tears down all three pools' backing memory. Called once, from
    /// `run_post_close`. The original only calls this out for the phantom
    /// pool explicitly (initial/primary lifecycle there belongs to a
    /// separate generic pool manager this crate doesn't implement, per
    /// §1's task-pool-machinery non-goal); since this crate's connection is
    /// the only owner of the pools it creates, it tears down all three here
    /// rather than leaking the other two.
    fn destroy_pools(&self) {
        for pool in [&self.initial_pool, &self.primary_pool, &self.phantom_pool] {
            if let Some(pool) = pool.borrow_mut().take() {
                pool.destroy(&self.env.devices, &self.env.mr_registry);
            }
        }
    }
}

fn reject(cm_id: *mut rdma_cm_id) {
    // SAFETY: FFI; rejecting with no private data.
    unsafe {
        rdma_reject(cm_id, std::ptr::null(), 0);
    }
}

impl CmEventSink for ConnectionInner {
    fn handle_cm_event(self: Rc<Self>, kind: CmEventKind, ctx: &Rc<dyn IoContext>, channel: &CmChannel) {
        let _guard = NestingGuard::enter(&self.handler_nesting);
        let conn = Connection(self.clone());

        match kind {
            CmEventKind::AddrResolved => {
                // SAFETY: populated after a successful `rdma_resolve_addr`.
                let verbs = unsafe { (*self.cm_id.get()).verbs };
                match self.env.devices.get_or_open(verbs) {
                    Ok(dev) => {
                        *self.device.borrow_mut() = Some(dev);
                        // SAFETY: FFI.
                        let ret = unsafe { rdma_resolve_route(self.cm_id.get(), ROUTE_RESOLVE_TIMEOUT_MS) };
                        if ret != 0 {
                            self.emit(&conn, UpcallEvent::Error(ErrorCode::Route));
                        }
                    }
                    Err(e) => {
                        log::warn!("failed to open device after ADDR_RESOLVED: {e}");
                        self.emit(&conn, UpcallEvent::Error(ErrorCode::Addr));
                    }
                }
            }
            CmEventKind::RouteResolved => {
                let dev = self.device.borrow().clone();
                if let Some(dev) = dev {
                    match self.create_qp_on(&self.env, dev.clone(), ctx) {
                        Ok(()) => {
                            let mut param: rdma_conn_param = unsafe { std::mem::zeroed() };
                            param.responder_resources = (dev.attr().max_qp_rd_atom as u8).min(16);
                            param.initiator_depth = (dev.attr().max_qp_init_rd_atom as u8).min(16);
                            param.retry_count = RETRY_COUNT;
                            param.rnr_retry_count = RETRY_COUNT;
                            // SAFETY: FFI; QP just created on this id.
                            let ret = unsafe { rdma_connect(self.cm_id.get(), &mut param) };
                            if ret != 0 {
                                self.emit(&conn, UpcallEvent::Error(ErrorCode::Connect));
                            } else {
                                self.state.set(State::Connecting);
                            }
                        }
                        Err(_) => self.emit(&conn, UpcallEvent::Error(ErrorCode::Connect)),
                    }
                }
            }
            CmEventKind::ConnectRequest { child_id, param } => {
                self.on_connect_request(child_id, param, ctx);
            }
            CmEventKind::Established { param } => {
                self.on_established(Some(param));
                self.emit(&conn, UpcallEvent::Established);
            }
            CmEventKind::Rejected { reason } => {
                self.emit(&conn, UpcallEvent::Refused { reason: format!("CM reject code {reason}") });
            }
            CmEventKind::Disconnected | CmEventKind::AddrChange => {
                self.on_disconnected(ctx);
            }
            CmEventKind::TimewaitExit => {
                self.on_timewait_exit(&conn, Some(ctx));
            }
            CmEventKind::DeviceRemoval => {
                let identity = self.device.borrow().as_ref().map(|dev| dev.identity());
                if let Some(identity) = identity {
                    self.env.devices.release(identity);
                }
            }
            CmEventKind::ConnectError => self.emit(&conn, UpcallEvent::Error(ErrorCode::Connect)),
            CmEventKind::AddrError => self.emit(&conn, UpcallEvent::Error(ErrorCode::Addr)),
            CmEventKind::RouteError => self.emit(&conn, UpcallEvent::Error(ErrorCode::Route)),
            CmEventKind::Unreachable => self.emit(&conn, UpcallEvent::Error(ErrorCode::Unreachable)),
            CmEventKind::Other(code) => {
                log::debug!("unhandled CM event {code} on {:p}", self.cm_id.get());
            }
        }

        let _ = channel;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mr_sge(addr: u64, length: u32, lkey: u32) -> Sge {
        Sge { addr, length, lkey: Some(lkey) }
    }

    fn phantom_sge(addr: u64, length: u32) -> Sge {
        Sge { addr, length, lkey: None }
    }

    #[test]
    fn accepts_uniform_mr_backed_list_within_limits() {
        let sges = [mr_sge(0x1000, 64, 1), mr_sge(0x2000, 128, 2)];
        assert!(is_valid_sge_list(&sges, 4, 16));
    }

    #[test]
    fn rejects_list_longer_than_max_iovsz() {
        let sges = [mr_sge(0x1000, 64, 1), mr_sge(0x2000, 128, 2)];
        assert!(!is_valid_sge_list(&sges, 1, 16));
    }

    #[test]
    fn rejects_header_longer_than_inline_limit() {
        let sges = [mr_sge(0x1000, 64, 1)];
        assert!(!is_valid_sge_list(&sges, 4, MAX_INLINE_HEADER + 1));
    }

    #[test]
    fn rejects_mixed_mr_and_phantom_segments() {
        let sges = [mr_sge(0x1000, 64, 1), phantom_sge(0x2000, 128)];
        assert!(!is_valid_sge_list(&sges, 4, 16));
    }

    #[test]
    fn rejects_zero_length_segment_with_nonzero_addr() {
        let sges = [mr_sge(0x1000, 0, 1)];
        assert!(!is_valid_sge_list(&sges, 4, 16));
    }

    #[test]
    fn accepts_zero_length_null_addr_segment() {
        let sges = [mr_sge(0, 0, 1)];
        assert!(is_valid_sge_list(&sges, 4, 16));
    }

    #[test]
    fn accepts_all_phantom_segments() {
        let sges = [phantom_sge(0x1000, 64), phantom_sge(0x2000, 128)];
        assert!(is_valid_sge_list(&sges, 4, 16));
    }
}
