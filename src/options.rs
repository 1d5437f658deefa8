//! Stable option names exposed to the host application (§6).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Serializable snapshot of the boolean/integer options, for hosts that want
/// to persist or exchange configuration as JSON rather than call `set` one
/// option at a time. `dma_latency_fd` is deliberately not part of the
/// snapshot: re-opening `/dev/cpu_dma_latency` is a side effect
/// [`Options::from_json`] leaves to a later explicit `set("ENABLE_DMA_LATENCY", 1)`
/// rather than triggering it implicitly during deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionsSnapshot {
    pub enable_mem_pool: bool,
    pub enable_dma_latency: bool,
    pub max_in_iovsz: u32,
    pub max_out_iovsz: u32,
}

/// Per-process/per-context knobs. `enable_mem_pool`/`enable_dma_latency`/
/// `max_in_iovsz`/`max_out_iovsz` apply to connections created after the
/// option is set; `rdma_num_devices` is read-only.
pub struct Options {
    enable_mem_pool: AtomicBool,
    enable_dma_latency: AtomicBool,
    max_in_iovsz: AtomicU32,
    max_out_iovsz: AtomicU32,
    dma_latency_fd: std::sync::Mutex<Option<std::fs::File>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enable_mem_pool: AtomicBool::new(true),
            enable_dma_latency: AtomicBool::new(false),
            max_in_iovsz: AtomicU32::new(4),
            max_out_iovsz: AtomicU32::new(4),
            dma_latency_fd: std::sync::Mutex::new(None),
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_mem_pool(&self) -> bool {
        self.enable_mem_pool.load(Ordering::Acquire)
    }

    pub fn max_in_iovsz(&self) -> u32 {
        self.max_in_iovsz.load(Ordering::Acquire)
    }

    pub fn max_out_iovsz(&self) -> u32 {
        self.max_out_iovsz.load(Ordering::Acquire)
    }

    pub fn set(&self, name: &str, value: i32) -> Result<()> {
        match name {
            "ENABLE_MEM_POOL" => {
                self.enable_mem_pool.store(value != 0, Ordering::Release);
                Ok(())
            }
            "ENABLE_DMA_LATENCY" => {
                self.enable_dma_latency.store(value != 0, Ordering::Release);
                if value != 0 {
                    self.open_dma_latency()?;
                } else {
                    *self.dma_latency_fd.lock().unwrap() = None;
                }
                Ok(())
            }
            "MAX_IN_IOVLEN" => {
                self.max_in_iovsz.store(value as u32, Ordering::Release);
                Ok(())
            }
            "MAX_OUT_IOVLEN" => {
                self.max_out_iovsz.store(value as u32, Ordering::Release);
                Ok(())
            }
            "ENABLE_FORK_INIT" => {
                enable_fork_support();
                Ok(())
            }
            "RDMA_NUM_DEVICES" => Err(Error::NotSupported("RDMA_NUM_DEVICES is read-only".into())),
            other => Err(Error::NotSupported(format!("unknown option {other}"))),
        }
    }

    pub fn get(&self, name: &str, devices: &crate::device::Registry) -> Result<i32> {
        match name {
            "ENABLE_MEM_POOL" => Ok(self.enable_mem_pool() as i32),
            "ENABLE_DMA_LATENCY" => Ok(self.enable_dma_latency.load(Ordering::Acquire) as i32),
            "MAX_IN_IOVLEN" => Ok(self.max_in_iovsz() as i32),
            "MAX_OUT_IOVLEN" => Ok(self.max_out_iovsz() as i32),
            "RDMA_NUM_DEVICES" => Ok(devices.all().len() as i32),
            other => Err(Error::NotSupported(format!("unknown option {other}"))),
        }
    }

    /// Serializes the current option values to JSON, mirroring how the
    /// teacher round-trips connection metadata through JSON at its
    /// portal-exchange boundary.
    pub fn to_json(&self) -> Result<String> {
        let snapshot = OptionsSnapshot {
            enable_mem_pool: self.enable_mem_pool(),
            enable_dma_latency: self.enable_dma_latency.load(Ordering::Acquire),
            max_in_iovsz: self.max_in_iovsz(),
            max_out_iovsz: self.max_out_iovsz(),
        };
        serde_json::to_string(&snapshot).map_err(|e| Error::NotSupported(e.to_string()))
    }

    /// Applies a JSON-encoded [`OptionsSnapshot`] on top of the current
    /// values. Does not touch `dma_latency_fd`; flip `ENABLE_DMA_LATENCY`
    /// through [`Options::set`] afterwards if the snapshot's bit should take
    /// effect.
    pub fn from_json(&self, json: &str) -> Result<()> {
        let snapshot: OptionsSnapshot = serde_json::from_str(json).map_err(|e| Error::NotSupported(e.to_string()))?;
        self.enable_mem_pool.store(snapshot.enable_mem_pool, Ordering::Release);
        self.enable_dma_latency.store(snapshot.enable_dma_latency, Ordering::Release);
        self.max_in_iovsz.store(snapshot.max_in_iovsz, Ordering::Release);
        self.max_out_iovsz.store(snapshot.max_out_iovsz, Ordering::Release);
        Ok(())
    }

    /// Opens `/dev/cpu_dma_latency` and writes a 0 latency bound, pinning
    /// C-states for as long as the fd stays open. This is the one blocking
    /// I/O permitted outside the device thread's own event fetch (§5).
    fn open_dma_latency(&self) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open("/dev/cpu_dma_latency")
            .map_err(Error::Io)?;
        let bound: i32 = 0;
        file.write_all(&bound.to_ne_bytes()).map_err(Error::Io)?;
        *self.dma_latency_fd.lock().unwrap() = Some(file);
        Ok(())
    }
}

/// Sets `RDMAV_FORK_SAFE=YES`, `RDMAV_HUGEPAGES_SAFE=YES` and calls
/// `ibv_fork_init()`, per `xio_rdma_enable_fork_support`.
pub fn enable_fork_support() {
    // SAFETY: mutating the environment before any RDMA objects are created
    // is the documented precondition for fork support to take effect.
    unsafe {
        std::env::set_var("RDMAV_FORK_SAFE", "YES");
        std::env::set_var("RDMAV_HUGEPAGES_SAFE", "YES");
    }
    // SAFETY: FFI; safe to call multiple times.
    unsafe {
        crate::bindings::ibv_fork_init();
    }
}

/// Applies the environment variables this transport honors at construction,
/// each set only if not already present in the environment.
pub fn apply_default_env() {
    for (key, value) in [
        ("RDMAV_HUGEPAGES_SAFE", "1"),
        ("MLX_QP_ALLOC_TYPE", "PREFER_CONTIG"),
        ("MLX_CQ_ALLOC_TYPE", "PREFER_CONTIG"),
    ] {
        if std::env::var_os(key).is_none() {
            // SAFETY: called once at construction, before any connection
            // objects exist to race with this.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_known_names() {
        let opts = Options::new();
        opts.set("ENABLE_MEM_POOL", 0).unwrap();
        assert!(!opts.enable_mem_pool());
        opts.set("MAX_IN_IOVLEN", 7).unwrap();
        assert_eq!(opts.max_in_iovsz(), 7);
        opts.set("MAX_OUT_IOVLEN", 9).unwrap();
        assert_eq!(opts.max_out_iovsz(), 9);
    }

    #[test]
    fn set_unknown_name_errors() {
        let opts = Options::new();
        assert!(opts.set("NOT_A_REAL_OPTION", 1).is_err());
    }

    #[test]
    fn set_read_only_name_errors() {
        let opts = Options::new();
        assert!(opts.set("RDMA_NUM_DEVICES", 1).is_err());
    }

    #[test]
    fn json_round_trip_preserves_values() {
        let opts = Options::new();
        opts.set("ENABLE_MEM_POOL", 0).unwrap();
        opts.set("MAX_IN_IOVLEN", 12).unwrap();
        opts.set("MAX_OUT_IOVLEN", 34).unwrap();

        let json = opts.to_json().unwrap();

        let restored = Options::new();
        restored.from_json(&json).unwrap();
        assert_eq!(restored.enable_mem_pool(), opts.enable_mem_pool());
        assert_eq!(restored.max_in_iovsz(), opts.max_in_iovsz());
        assert_eq!(restored.max_out_iovsz(), opts.max_out_iovsz());
    }

    #[test]
    fn from_json_rejects_malformed_input() {
        let opts = Options::new();
        assert!(opts.from_json("not json").is_err());
    }
}
