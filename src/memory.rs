/// Process memory measurements consumed by the monitors.
///
/// `ProcMemory` reads the current process's accounting from `/proc/self`
/// and the allocator's own statistics from glibc `mallinfo2`. Platforms
/// without these sources report `MemoryError::Unsupported`, which monitors
/// surface as evaluation failures (the watchdog then fails open).
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Allocator heap statistics, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    /// Bytes handed out to the program and not yet freed.
    pub in_use_bytes: u64,
    /// Bytes the allocator obtained from the system (arenas + mmapped chunks).
    pub system_bytes: u64,
}

impl HeapStats {
    /// Share of the allocator's system memory that is not in use, in `[0, 1]`.
    ///
    /// An allocator that holds no memory is considered unfragmented.
    pub fn fragmentation(&self) -> f64 {
        if self.system_bytes == 0 {
            return 0.0;
        }
        let used = self.in_use_bytes.min(self.system_bytes) as f64;
        1.0 - used / self.system_bytes as f64
    }
}

/// Errors produced while sampling process memory.
#[derive(Debug)]
pub enum MemoryError {
    /// Failed to read an accounting file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The accounting file did not contain the expected field.
    MissingField { path: PathBuf, field: &'static str },
    /// A field was present but not a number.
    Parse {
        path: PathBuf,
        field: &'static str,
        value: String,
    },
    /// The measurement is not available on this platform.
    Unsupported(&'static str),
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            MemoryError::MissingField { path, field } => {
                write!(f, "field {} not found in {}", field, path.display())
            }
            MemoryError::Parse { path, field, value } => {
                write!(
                    f,
                    "invalid value {:?} for {} in {}",
                    value,
                    field,
                    path.display()
                )
            }
            MemoryError::Unsupported(what) => {
                write!(f, "{what} is not supported on this platform")
            }
        }
    }
}

impl std::error::Error for MemoryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MemoryError::Read { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Source of memory measurements for the current process.
pub trait MemoryProbe: Send + Sync {
    /// Resident set size.
    fn rss_bytes(&self) -> Result<u64, MemoryError>;

    /// Unique set size: memory private to this process.
    fn uss_bytes(&self) -> Result<u64, MemoryError>;

    /// Allocator heap statistics.
    fn heap_stats(&self) -> Result<HeapStats, MemoryError>;
}

/// `/proc`-backed probe for the calling process.
#[derive(Debug, Clone)]
pub struct ProcMemory {
    proc_dir: PathBuf,
}

impl ProcMemory {
    /// Probe reading `/proc/self`.
    pub fn new() -> Self {
        Self::with_proc_dir("/proc/self")
    }

    /// Probe reading from an alternate directory laid out like `/proc/<pid>`.
    pub fn with_proc_dir(proc_dir: impl Into<PathBuf>) -> Self {
        Self {
            proc_dir: proc_dir.into(),
        }
    }

    fn status_path(&self) -> PathBuf {
        self.proc_dir.join("status")
    }

    fn smaps_rollup_path(&self) -> PathBuf {
        self.proc_dir.join("smaps_rollup")
    }
}

impl Default for ProcMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcMemory {
    fn rss_bytes(&self) -> Result<u64, MemoryError> {
        let path = self.status_path();
        let contents = read(&path)?;
        kb_field(&contents, &path, "VmRSS:").map(|kb| kb.saturating_mul(1024))
    }

    fn uss_bytes(&self) -> Result<u64, MemoryError> {
        let path = self.smaps_rollup_path();
        let contents = read(&path)?;
        let clean = kb_field(&contents, &path, "Private_Clean:")?;
        let dirty = kb_field(&contents, &path, "Private_Dirty:")?;
        Ok(clean.saturating_add(dirty).saturating_mul(1024))
    }

    fn heap_stats(&self) -> Result<HeapStats, MemoryError> {
        malloc_heap_stats()
    }
}

fn read(path: &Path) -> Result<String, MemoryError> {
    std::fs::read_to_string(path).map_err(|e| MemoryError::Read {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Parse a `Name:   1234 kB` line out of a `/proc` accounting file.
fn kb_field(contents: &str, path: &Path, field: &'static str) -> Result<u64, MemoryError> {
    let rest = contents
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .ok_or_else(|| MemoryError::MissingField {
            path: path.to_path_buf(),
            field,
        })?;
    let value = rest.split_whitespace().next().unwrap_or_default();
    value.parse().map_err(|_| MemoryError::Parse {
        path: path.to_path_buf(),
        field,
        value: value.to_string(),
    })
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn malloc_heap_stats() -> Result<HeapStats, MemoryError> {
    // SAFETY: mallinfo2 has no preconditions and returns a plain struct.
    let info = unsafe { libc::mallinfo2() };
    Ok(HeapStats {
        in_use_bytes: (info.uordblks + info.hblkhd) as u64,
        system_bytes: (info.arena + info.hblkhd) as u64,
    })
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn malloc_heap_stats() -> Result<HeapStats, MemoryError> {
    Err(MemoryError::Unsupported("heap statistics"))
}
