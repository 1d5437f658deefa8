//! Task pools (§4.7): per-connection pools of pre-registered message
//! buffers wrapped as lookup-by-id "tasks", backed either by a single
//! dedicated memory region (the small "initial" handshake pool), the
//! shared pre-registered slab pool (the larger "primary" pool, when
//! enabled), or no memory at all (the "phantom" pool of zero-copy stubs).
//!
//! Grounded on `xio_rdma_management.c`'s `xio_rdma_initial_pool_create`/
//! `xio_rdma_primary_pool_create`/`xio_rdma_phantom_pool_create`: each
//! wires a `{slab_pre_create, slab_post_create, slab_init_task,
//! slab_remap_task, slab_destroy, pool_post_create, task_pre_put}` hook set
//! (the generic "task pool machinery" contract in §6, which this module
//! only consumes — the engine behind it is external) around one of these
//! backing strategies, and mirrors `xio_rdma_task_pre_put`'s reset of
//! per-task scatter/gather bookkeeping on return to the pool.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::bindings::ibv_access_flags;
use crate::device::Registry as DeviceRegistry;
use crate::error::{Error, Result};
use crate::mr::{MemoryRegion, Registry as MrRegistry};
use crate::slab;

/// One scatter/gather entry carried by a task's work request.
#[derive(Debug, Clone, Copy)]
pub struct TaskSge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

enum Storage {
    Slab(slab::MemBlock),
    Dedicated,
    Phantom,
}

/// One pooled task buffer.
pub struct Task {
    pub id: u64,
    pub sge: TaskSge,
    /// Never read directly; for `Storage::Slab` its only job is to keep the
    /// claimed `MemBlock` (and therefore `sge`'s lkey) alive for as long as
    /// the task is checked out.
    storage: Storage,
}

impl Task {
    /// Rewrites this task's lkey after a device migration (`dup2`), per
    /// §4.7's "on remap, each task's scatter/gather lkeys are rewritten to
    /// the new MR's lkey".
    fn remap_lkey(&mut self, new_lkey: u32) {
        self.sge.lkey = new_lkey;
    }
}

/// Hooks a connection installs around a task pool's lifecycle, mirroring
/// the `{slab-pre-create, slab-post-create, slab-init-task,
/// slab-remap-task, slab-destroy, pool-post-create, task-pre-put}` contract
/// in §6. Every method has a no-op default.
pub trait PoolHooks {
    /// Runs once, before the backing memory is created.
    fn slab_pre_create(&mut self, _alloc_nr: u32) {}
    /// Runs once, right after the backing memory is created.
    fn slab_post_create(&mut self) {}
    /// Runs once per task, the first time it is handed out.
    fn slab_init_task(&mut self, _task: &mut Task) {}
    /// Runs once per live task during [`TaskPool::remap`].
    fn slab_remap_task(&mut self, _task: &mut Task) {}
    /// Runs once, when the pool is destroyed.
    fn slab_destroy(&mut self) {}
    /// Runs once, after the pool's backing memory is fully created.
    fn pool_post_create(&mut self) {}
    /// Runs every time a task is returned via [`TaskPool::task_put`],
    /// before it re-enters the free list.
    fn task_pre_put(&mut self, _task: &mut Task) {}
}

/// A [`PoolHooks`] implementation that does nothing; the default for a pool
/// with no per-task setup beyond the SGE itself.
#[derive(Default)]
pub struct NullHooks;
impl PoolHooks for NullHooks {}

/// Pool creation parameters, from §6's `{initial, grow, max, ...}`.
/// `initial`/`grow` only matter for the slab-backed primary pool, which
/// defers to the shared [`slab::Pool`]'s own growth policy; the dedicated
/// and phantom backends create `max` slots (or none) up front.
#[derive(Debug, Clone, Copy)]
pub struct PoolParams {
    pub initial: u32,
    pub grow: u32,
    pub max: u32,
    /// Size in bytes of one task's buffer. Unused by the phantom backend.
    pub task_len: usize,
}

enum BackingKind {
    /// Tasks come from a dedicated, freshly registered buffer sliced into
    /// `max` fixed-size slots, all created up front. Used for the
    /// "initial" pool and for the "primary" pool when the shared slab pool
    /// is unavailable or disabled.
    Dedicated { mr: MemoryRegion, device_identity: usize },
    /// Tasks draw one block per task from the shared pre-registered slab
    /// pool, growing lazily. Used for the "primary" pool when available.
    /// `devices` is `Arc`-wrapped to match [`crate::conn::Env`]'s own
    /// handle, which is shared with the device thread.
    Slab { pool: Rc<slab::Pool>, devices: Arc<DeviceRegistry>, mr_registry: Rc<MrRegistry> },
    /// No backing memory at all: stub tasks used to track in-flight
    /// zero-copy RDMA reads/writes that target the peer's registered
    /// buffer directly.
    Phantom,
}

/// A connection's task pool: the "initial", "primary", or "phantom" pool
/// named in §4.7, all implemented by the same machinery.
pub struct TaskPool {
    params: PoolParams,
    backing: BackingKind,
    hooks: RefCell<Box<dyn PoolHooks>>,
    live: RefCell<HashMap<u64, Task>>,
    free_ids: RefCell<Vec<u64>>,
    next_id: Cell<u64>,
    created: Cell<u32>,
}

impl TaskPool {
    fn finish_construction(
        params: PoolParams,
        backing: BackingKind,
        mut hooks: Box<dyn PoolHooks>,
        free_ids: Vec<u64>,
        next_id: u64,
    ) -> Self {
        hooks.slab_post_create();
        let pool = Self {
            params,
            backing,
            hooks: RefCell::new(hooks),
            live: RefCell::new(HashMap::new()),
            free_ids: RefCell::new(free_ids),
            next_id: Cell::new(next_id),
            created: Cell::new(0),
        };
        pool.hooks.borrow_mut().pool_post_create();
        pool
    }

    /// Builds the "initial" pool (or a slab-pool-disabled "primary" pool):
    /// `params.max` fixed-size task buffers sliced out of one freshly
    /// registered region, all created eagerly.
    pub fn new_dedicated(
        devices: &DeviceRegistry,
        mr_registry: &MrRegistry,
        params: PoolParams,
        mut hooks: Box<dyn PoolHooks>,
    ) -> Result<Self> {
        hooks.slab_pre_create(params.max);
        let total = params.task_len * params.max as usize;
        let mr = mr_registry.register(
            devices,
            None,
            total,
            (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
                | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0
                | ibv_access_flags::IBV_ACCESS_REMOTE_READ.0) as u32,
        )?;
        let device_identity = devices.all().first().map(|d| d.identity()).unwrap_or(0);

        Ok(Self::finish_construction(
            params,
            BackingKind::Dedicated { mr, device_identity },
            hooks,
            Vec::new(),
            0,
        ))
    }

    /// Builds the "primary" pool backed by the shared pre-registered slab
    /// pool.
    pub fn new_slab_backed(
        slab_pool: Rc<slab::Pool>,
        devices: Arc<DeviceRegistry>,
        mr_registry: Rc<MrRegistry>,
        params: PoolParams,
        hooks: Box<dyn PoolHooks>,
    ) -> Self {
        let mut hooks = hooks;
        hooks.slab_pre_create(params.max);
        Self::finish_construction(
            params,
            BackingKind::Slab { pool: slab_pool, devices, mr_registry },
            hooks,
            Vec::new(),
            0,
        )
    }

    /// Builds the "phantom" pool: stub tasks with no backing memory,
    /// created lazily once the primary pool is ready (the caller decides
    /// when; this constructor just builds the pool itself).
    pub fn new_phantom(params: PoolParams, mut hooks: Box<dyn PoolHooks>) -> Self {
        hooks.slab_pre_create(params.max);
        Self::finish_construction(params, BackingKind::Phantom, hooks, Vec::new(), 0)
    }

    /// Checks a task out of the pool, minting or reusing an id and calling
    /// `slab_init_task` the first time that id is ever handed out.
    pub fn task_get(&self) -> Result<u64> {
        if let Some(id) = self.free_ids.borrow_mut().pop() {
            return Ok(id);
        }
        if self.created.get() >= self.params.max {
            return Err(Error::OutOfMemory(format!(
                "task pool exhausted ({}/{})",
                self.created.get(),
                self.params.max
            )));
        }

        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let mut task = match &self.backing {
            BackingKind::Dedicated { mr, device_identity } => {
                let slot = id as usize;
                let addr = mr.addr() as u64 + (slot * self.params.task_len) as u64;
                let lkey = mr.lkey_for(*device_identity).unwrap_or(0);
                Task {
                    id,
                    sge: TaskSge { addr, length: self.params.task_len as u32, lkey },
                    storage: Storage::Dedicated,
                }
            }
            BackingKind::Slab { pool, devices, mr_registry } => {
                let block = pool.alloc(devices, mr_registry, self.params.task_len)?;
                let sge = TaskSge { addr: block.as_ptr() as u64, length: block.len() as u32, lkey: block.lkey() };
                Task { id, sge, storage: Storage::Slab(block) }
            }
            BackingKind::Phantom => {
                Task { id, sge: TaskSge { addr: 0, length: 0, lkey: 0 }, storage: Storage::Phantom }
            }
        };

        self.hooks.borrow_mut().slab_init_task(&mut task);
        self.live.borrow_mut().insert(id, task);
        self.created.set(self.created.get() + 1);
        Ok(id)
    }

    /// Returns a task to the free list, running `task_pre_put` first.
    pub fn task_put(&self, id: u64) {
        if let Some(task) = self.live.borrow_mut().get_mut(&id) {
            self.hooks.borrow_mut().task_pre_put(task);
        }
        self.free_ids.borrow_mut().push(id);
    }

    /// Looks up the scatter/gather entry for a currently checked-out task.
    pub fn task_lookup(&self, id: u64) -> Option<TaskSge> {
        self.live.borrow().get(&id).map(|t| t.sge)
    }

    /// Rewrites every live task's lkey to the value registered for
    /// `new_device_identity`, after a `dup2` device migration. The
    /// slab-backed case needs no explicit rewrite here: each task's
    /// `MemBlock` was registered against every known device already by
    /// [`crate::mr::Registry::on_new_device`], but its *current* lkey still
    /// names the old device until the connection that owns it asks for the
    /// new one, which `slab_remap_task` is the hook point for.
    pub fn remap(&self, new_device_identity: usize) {
        let new_lkey = match &self.backing {
            BackingKind::Dedicated { mr, .. } => mr.lkey_for(new_device_identity),
            BackingKind::Slab { .. } | BackingKind::Phantom => None,
        };
        let mut hooks = self.hooks.borrow_mut();
        for task in self.live.borrow_mut().values_mut() {
            if let Some(lkey) = new_lkey {
                task.remap_lkey(lkey);
            }
            hooks.slab_remap_task(task);
        }
    }

    /// Releases the pool's own backing memory, if any. Tasks still checked
    /// out at this point are simply dropped along with the registration;
    /// callers are expected to have put every task back first.
    pub fn destroy(&self, devices: &DeviceRegistry, mr_registry: &MrRegistry) {
        self.hooks.borrow_mut().slab_destroy();
        if let BackingKind::Dedicated { mr, .. } = &self.backing {
            mr_registry.deregister(devices, mr);
        }
        self.live.borrow_mut().clear();
        self.free_ids.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phantom_pool(max: u32) -> TaskPool {
        TaskPool::new_phantom(PoolParams { initial: 0, grow: 0, max, task_len: 0 }, Box::new(NullHooks))
    }

    #[test]
    fn task_get_mints_distinct_ids() {
        let pool = phantom_pool(4);
        let a = pool.task_get().unwrap();
        let b = pool.task_get().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn task_get_fails_once_max_reached() {
        let pool = phantom_pool(2);
        pool.task_get().unwrap();
        pool.task_get().unwrap();
        assert!(pool.task_get().is_err());
    }

    #[test]
    fn task_put_recycles_id() {
        let pool = phantom_pool(1);
        let id = pool.task_get().unwrap();
        pool.task_put(id);
        let again = pool.task_get().unwrap();
        assert_eq!(id, again);
    }

    #[test]
    fn task_lookup_reflects_checked_out_task() {
        let pool = phantom_pool(1);
        let id = pool.task_get().unwrap();
        let sge = pool.task_lookup(id).unwrap();
        assert_eq!(sge.addr, 0);
        assert_eq!(sge.length, 0);
    }

    #[test]
    fn task_lookup_none_for_unknown_id() {
        let pool = phantom_pool(1);
        assert!(pool.task_lookup(42).is_none());
    }

    #[test]
    fn remap_is_a_no_op_for_phantom_backing() {
        let pool = phantom_pool(1);
        let id = pool.task_get().unwrap();
        pool.remap(7);
        let sge = pool.task_lookup(id).unwrap();
        assert_eq!(sge.lkey, 0);
    }

    #[test]
    fn destroy_clears_live_and_free_tasks() {
        let pool = phantom_pool(2);
        let id = pool.task_get().unwrap();
        pool.task_put(id);
        pool.task_get().unwrap();

        let devices = DeviceRegistry::new();
        let mr_registry = MrRegistry::new();
        pool.destroy(&devices, &mr_registry);

        assert!(pool.task_lookup(id).is_none());
        assert!(pool.free_ids.borrow().is_empty());
    }
}
