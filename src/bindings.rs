//! FFI surface.
//!
//! The bulk of the verbs and connection-manager bindings come straight from
//! `rdma-sys`, which wraps `libibverbs` and `librdmacm` via `bindgen`. This
//! module only adds the handful of constants and small helpers that
//! `rdma-sys` does not expose directly.

pub(crate) use rdma_sys::*;

/// Reserved work-id used to mark the beacon send posted on graceful
/// disconnect. Never a real task id.
pub(crate) const XIO_BEACON_WRID: u64 = 0xffff_ffff_ffff_fffe;

