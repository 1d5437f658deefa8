//! The per-context event loop contract (§6, first bullet).
//!
//! Everything else in this crate — completion queues, the CM event pump, the
//! device thread's "force established" hint, the timewait deadline — is
//! driven by a single-threaded reactor that the host application owns and
//! polls. This module states the minimal contract such a reactor must
//! satisfy and ships one concrete, non-blocking `epoll`-based implementation
//! so the rest of the crate (and its tests) has something real to run
//! against; a host is free to supply its own.

use std::cell::RefCell;
use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Readiness a registered fd should be watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
}

/// Opaque handle to a scheduled delayed callback, returned by
/// [`IoContext::schedule_delayed`] and consumed by
/// [`IoContext::cancel_delayed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

/// Receives the context's lifecycle signals. Components that hold a
/// reference to a context (a [`crate::cq::Cq`], most notably)
/// register themselves here and drop their own reference to the context on
/// `on_post_close`, which is how the cyclic
/// `Connection -> CompletionQueue -> Context -observes-> CompletionQueue`
/// relationship gets broken without either side holding a strong reference
/// to the context.
pub trait ContextObserver {
    fn on_post_close(&self);
}

/// The minimal per-context event-loop contract this crate depends on.
///
/// All callbacks registered through this trait run on the context's single
/// thread; nothing here is required to be thread-safe except where the
/// device thread is explicitly documented to call in (see
/// `ConnectionInner::force_established`, which `conn::QpIndex::apply_hints`
/// drives from the device thread's established-hint drain).
pub trait IoContext {
    /// Watch `fd` for the given interest, invoking `callback` on readiness.
    /// `callback` runs on the context thread and must not block.
    fn register_fd(&self, fd: RawFd, interest: Interest, callback: Box<dyn FnMut()>);

    /// Stop watching `fd`. No-op if not registered.
    fn unregister_fd(&self, fd: RawFd);

    /// Run `callback` once, on the next loop iteration.
    fn schedule_once(&self, callback: Box<dyn FnOnce()>);

    /// Run `callback` once, no sooner than `delay` from now.
    fn schedule_delayed(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerHandle;

    /// Cancel a delayed callback if it has not yet fired.
    fn cancel_delayed(&self, handle: TimerHandle);

    /// Register an observer to be notified when this context emits
    /// "post-close".
    fn register_observer(&self, observer: Weak<dyn ContextObserver>);

    /// Remove a previously registered observer.
    fn unregister_observer(&self, observer: &Weak<dyn ContextObserver>);

    /// The logical CPU this context is bound to, used to pick a completion
    /// vector: `comp_vec = cpu_id() % device.num_comp_vectors`.
    fn cpu_id(&self) -> u32;
}

struct DelayedEntry {
    deadline: Instant,
    id: u64,
    callback: Option<Box<dyn FnOnce()>>,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for DelayedEntry {}
impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: `BinaryHeap` is a max-heap, we want the earliest deadline first.
        other.deadline.cmp(&self.deadline).then(other.id.cmp(&self.id))
    }
}

struct Inner {
    epoll_fd: RawFd,
    handlers: RefCell<std::collections::HashMap<RawFd, Box<dyn FnMut()>>>,
    once: RefCell<std::collections::VecDeque<Box<dyn FnOnce()>>>,
    delayed: RefCell<BinaryHeap<DelayedEntry>>,
    cancelled: RefCell<std::collections::HashSet<u64>>,
    next_timer_id: RefCell<u64>,
    observers: RefCell<Vec<Weak<dyn ContextObserver>>>,
    cpu_id: u32,
    closed: RefCell<bool>,
}

/// A minimal, single-threaded, non-blocking reactor implementing
/// [`IoContext`] on top of `epoll(7)`.
#[derive(Clone)]
pub struct ReactorContext(Rc<Inner>);

impl ReactorContext {
    pub fn new(cpu_id: u32) -> Result<Self> {
        // SAFETY: FFI; the returned fd is owned by `Inner` and closed on drop.
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(Self(Rc::new(Inner {
            epoll_fd,
            handlers: RefCell::new(std::collections::HashMap::new()),
            once: RefCell::new(std::collections::VecDeque::new()),
            delayed: RefCell::new(BinaryHeap::new()),
            cancelled: RefCell::new(std::collections::HashSet::new()),
            next_timer_id: RefCell::new(0),
            observers: RefCell::new(Vec::new()),
            cpu_id,
            closed: RefCell::new(false),
        })))
    }

    /// Run one iteration: drain due timers, run queued one-shots, then poll
    /// `fds` for up to `timeout` and dispatch whichever are ready.
    pub fn turn(&self, timeout: Duration) -> Result<()> {
        self.run_once_shots();
        self.run_due_timers();

        let mut events: [libc::epoll_event; 32] = unsafe { std::mem::zeroed() };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        // SAFETY: FFI; `events` buffer sized to match `events.len()`.
        let n = unsafe {
            libc::epoll_wait(self.0.epoll_fd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::Io(err));
        }
        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            let mut handlers = self.0.handlers.borrow_mut();
            if let Some(handler) = handlers.get_mut(&fd) {
                handler();
            }
        }
        Ok(())
    }

    fn run_once_shots(&self) {
        loop {
            let next = self.0.once.borrow_mut().pop_front();
            match next {
                Some(cb) => cb(),
                None => break,
            }
        }
    }

    fn run_due_timers(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let heap = self.0.delayed.borrow();
                matches!(heap.peek(), Some(e) if e.deadline <= now)
            };
            if !due {
                break;
            }
            let entry = self.0.delayed.borrow_mut().pop();
            if let Some(mut entry) = entry {
                let was_cancelled = self.0.cancelled.borrow_mut().remove(&entry.id);
                if !was_cancelled {
                    if let Some(cb) = entry.callback.take() {
                        cb();
                    }
                }
            }
        }
    }

    /// Emit "post-close": every registered observer is notified, then the
    /// observer list is dropped. This is what finally breaks the
    /// `Connection -> CompletionQueue -observes-> Context` cycle.
    pub fn emit_post_close(&self) {
        *self.0.closed.borrow_mut() = true;
        let observers = std::mem::take(&mut *self.0.observers.borrow_mut());
        for obs in observers {
            if let Some(obs) = obs.upgrade() {
                obs.on_post_close();
            }
        }
    }
}

impl IoContext for ReactorContext {
    fn register_fd(&self, fd: RawFd, _interest: Interest, callback: Box<dyn FnMut()>) {
        let mut ev = libc::epoll_event { events: libc::EPOLLIN as u32, u64: fd as u64 };
        // SAFETY: FFI; `fd` is owned by the caller and remains valid until
        // `unregister_fd`.
        unsafe {
            libc::epoll_ctl(self.0.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev);
        }
        self.0.handlers.borrow_mut().insert(fd, callback);
    }

    fn unregister_fd(&self, fd: RawFd) {
        // SAFETY: FFI.
        unsafe {
            libc::epoll_ctl(self.0.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
        self.0.handlers.borrow_mut().remove(&fd);
    }

    fn schedule_once(&self, callback: Box<dyn FnOnce()>) {
        self.0.once.borrow_mut().push_back(callback);
    }

    fn schedule_delayed(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerHandle {
        let id = {
            let mut next = self.0.next_timer_id.borrow_mut();
            let id = *next;
            *next += 1;
            id
        };
        self.0.delayed.borrow_mut().push(DelayedEntry {
            deadline: Instant::now() + delay,
            id,
            callback: Some(callback),
        });
        TimerHandle(id)
    }

    fn cancel_delayed(&self, handle: TimerHandle) {
        self.0.cancelled.borrow_mut().insert(handle.0);
    }

    fn register_observer(&self, observer: Weak<dyn ContextObserver>) {
        self.0.observers.borrow_mut().push(observer);
    }

    fn unregister_observer(&self, observer: &Weak<dyn ContextObserver>) {
        self.0.observers.borrow_mut().retain(|o| !o.ptr_eq(observer));
    }

    fn cpu_id(&self) -> u32 {
        self.0.cpu_id
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // SAFETY: owned fd, closed once.
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn schedule_once_runs_on_next_turn() {
        let ctx = ReactorContext::new(0).unwrap();
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        ctx.schedule_once(Box::new(move || ran2.set(true)));
        ctx.turn(Duration::from_millis(0)).unwrap();
        assert!(ran.get());
    }

    #[test]
    fn schedule_delayed_does_not_fire_before_deadline() {
        let ctx = ReactorContext::new(0).unwrap();
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        ctx.schedule_delayed(Duration::from_secs(60), Box::new(move || ran2.set(true)));
        ctx.turn(Duration::from_millis(0)).unwrap();
        assert!(!ran.get());
    }

    #[test]
    fn schedule_delayed_fires_after_deadline() {
        let ctx = ReactorContext::new(0).unwrap();
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        ctx.schedule_delayed(Duration::from_millis(0), Box::new(move || ran2.set(true)));
        std::thread::sleep(Duration::from_millis(5));
        ctx.turn(Duration::from_millis(0)).unwrap();
        assert!(ran.get());
    }

    #[test]
    fn cancel_delayed_suppresses_callback() {
        let ctx = ReactorContext::new(0).unwrap();
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        let handle = ctx.schedule_delayed(Duration::from_millis(0), Box::new(move || ran2.set(true)));
        ctx.cancel_delayed(handle);
        std::thread::sleep(Duration::from_millis(5));
        ctx.turn(Duration::from_millis(0)).unwrap();
        assert!(!ran.get());
    }

    struct RecordingObserver {
        notified: Cell<bool>,
    }

    impl ContextObserver for RecordingObserver {
        fn on_post_close(&self) {
            self.notified.set(true);
        }
    }

    #[test]
    fn emit_post_close_notifies_registered_observers() {
        let ctx = ReactorContext::new(0).unwrap();
        let observer = Rc::new(RecordingObserver { notified: Cell::new(false) });
        let weak: Weak<dyn ContextObserver> = Rc::downgrade(&observer);
        ctx.register_observer(weak);
        ctx.emit_post_close();
        assert!(observer.notified.get());
    }

    #[test]
    fn unregister_observer_prevents_notification() {
        let ctx = ReactorContext::new(0).unwrap();
        let observer = Rc::new(RecordingObserver { notified: Cell::new(false) });
        let weak: Weak<dyn ContextObserver> = Rc::downgrade(&observer);
        ctx.register_observer(weak.clone());
        ctx.unregister_observer(&weak);
        ctx.emit_post_close();
        assert!(!observer.notified.get());
    }

    #[test]
    fn cpu_id_roundtrips() {
        let ctx = ReactorContext::new(3).unwrap();
        assert_eq!(ctx.cpu_id(), 3);
    }
}
