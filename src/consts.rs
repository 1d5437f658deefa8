//! Fixed constants from the transport's external contract (§6).

/// Maximum outstanding send work requests per queue pair.
pub const MAX_SEND_WR: u32 = 257;

/// Maximum outstanding receive work requests per queue pair.
pub const MAX_RECV_WR: u32 = 256;

/// Extra receive-queue slack reserved on top of `MAX_RECV_WR`.
pub const EXTRA_RQE: u32 = 32;

/// Upper bound on work completions polled per `ibv_poll_cq` call.
pub const MAX_POLL_WC: i32 = 128;

/// Completion-queue depth is grown in steps of this many times
/// `(MAX_SEND_WR + MAX_RECV_WR + EXTRA_RQE)`.
pub const CQ_GROW_STEP: u32 = 10;

/// Default per-(device, context) completion-queue allocation size, used when
/// no connection has yet requested a specific depth.
pub const DEFAULT_CQE_ALLOC_SIZE: u32 = CQ_GROW_STEP * (MAX_SEND_WR + MAX_RECV_WR + EXTRA_RQE);

/// Default timewait deadline after a graceful disconnect.
pub const TIMEWAIT_EXIT_TIMEOUT_MS: u64 = 60_000;

/// Timewait deadline used under a forced/fast shutdown.
pub const TIMEWAIT_EXIT_FAST_TIMEOUT_MS: u64 = 0;

/// Timeout passed to `rdma_resolve_addr`.
pub const ADDR_RESOLVE_TIMEOUT_MS: i32 = 1000;

/// Timeout passed to `rdma_resolve_route`.
pub const ROUTE_RESOLVE_TIMEOUT_MS: i32 = 1000;

/// `rnr_retry_count` / `retry_count` applied to every outgoing `rdma_connect`.
pub const RETRY_COUNT: u8 = 3;

/// Upper bound on an inline message header carried in a send request,
/// beyond the scatter/gather list itself. Not named by the external
/// contract; chosen to comfortably hold a framing header plus a handful of
/// credit/serial-number fields.
pub const MAX_INLINE_HEADER: usize = 128;

/// Task-pool sizing (§4.7). Not named by the external contract; sized to
/// comfortably cover one connection's in-flight handshake/I/O tasks without
/// per-connection tuning.
pub const INITIAL_POOL_MAX_TASKS: u32 = 8;
pub const INITIAL_POOL_TASK_LEN: usize = 256;
pub const PRIMARY_POOL_INITIAL_TASKS: u32 = 32;
pub const PRIMARY_POOL_GROW_TASKS: u32 = 32;
pub const PRIMARY_POOL_MAX_TASKS: u32 = 512;
pub const PRIMARY_POOL_TASK_LEN: usize = 4096;
pub const PHANTOM_POOL_MAX_TASKS: u32 = 512;
