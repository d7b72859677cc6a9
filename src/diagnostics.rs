/// Diagnostic heap reports.
///
/// The watchdog only *requests* a heap dump when a monitor breaches. The
/// request sits in a `HeapDumpQueue` until the worker-stop hook takes it and
/// writes a JSON memory snapshot to the reports directory. Uses the atomic
/// write pattern: write to a temp file, then rename.
use crate::memory::{HeapStats, MemoryProbe};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// One-slot queue for heap dump requests. Shared between the watchdog
/// (which enqueues) and the worker-stop hook (which drains).
#[derive(Debug, Default)]
pub struct HeapDumpQueue {
    pending: AtomicBool,
}

impl HeapDumpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a dump. Repeated requests collapse into one.
    pub fn enqueue(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Take the pending request, leaving the queue empty.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }
}

/// Snapshot written to disk for a heap dump request.
#[derive(Debug, Clone, Serialize)]
pub struct HeapReport {
    pub pid: u32,
    pub role: String,
    pub written_at: DateTime<Utc>,
    pub rss_bytes: Option<u64>,
    pub uss_bytes: Option<u64>,
    pub heap: Option<HeapStats>,
    pub heap_fragmentation: Option<f64>,
}

impl HeapReport {
    /// Sample the probe. Measurements that fail are recorded as absent.
    pub fn capture(probe: &dyn MemoryProbe, role: &str) -> Self {
        let heap = probe.heap_stats().ok();
        Self {
            pid: std::process::id(),
            role: role.to_string(),
            written_at: Utc::now(),
            rss_bytes: probe.rss_bytes().ok(),
            uss_bytes: probe.uss_bytes().ok(),
            heap,
            heap_fragmentation: heap.map(|h| h.fragmentation()),
        }
    }

    /// File name: `heap-<role>-<pid>-<timestamp>.json`.
    pub fn file_name(&self) -> String {
        format!(
            "heap-{}-{}-{}.json",
            self.role,
            self.pid,
            self.written_at.format("%Y%m%dT%H%M%S%.3fZ")
        )
    }
}

/// Errors produced while writing a diagnostic report.
#[derive(Debug)]
pub enum DiagnosticsError {
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for DiagnosticsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiagnosticsError::CreateDir { path, source } => {
                write!(f, "failed to create reports dir {}: {}", path.display(), source)
            }
            DiagnosticsError::Serialize { source } => {
                write!(f, "failed to serialize heap report: {}", source)
            }
            DiagnosticsError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            DiagnosticsError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} to {}: {}",
                    from.display(),
                    to.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for DiagnosticsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiagnosticsError::CreateDir { source, .. } => Some(source),
            DiagnosticsError::Serialize { source } => Some(source),
            DiagnosticsError::Write { source, .. } => Some(source),
            DiagnosticsError::Rename { source, .. } => Some(source),
        }
    }
}

/// Writes heap reports into a directory.
#[derive(Debug, Clone)]
pub struct HeapReportWriter {
    dir: PathBuf,
}

impl HeapReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Atomically write `report`, returning its final path.
    pub fn write(&self, report: &HeapReport) -> Result<PathBuf, DiagnosticsError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| DiagnosticsError::CreateDir {
            path: self.dir.clone(),
            source: e,
        })?;

        let json = serde_json::to_string_pretty(report)
            .map_err(|e| DiagnosticsError::Serialize { source: e })?;

        let path = self.dir.join(report.file_name());
        let tmp_path = self.dir.join(format!(".{}.tmp", report.file_name()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| DiagnosticsError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &path).map_err(|e| DiagnosticsError::Rename {
            from: tmp_path,
            to: path.clone(),
            source: e,
        })?;

        Ok(path)
    }

    /// Write a report if one was requested. Returns the path written, if any.
    pub fn run_pending(
        &self,
        queue: &HeapDumpQueue,
        probe: &dyn MemoryProbe,
        role: &str,
    ) -> Result<Option<PathBuf>, DiagnosticsError> {
        if !queue.take() {
            return Ok(None);
        }
        let report = HeapReport::capture(probe, role);
        let path = self.write(&report)?;
        tracing::info!(path = %path.display(), "heap report written");
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMemory;
    use tempfile::tempdir;

    #[test]
    fn test_queue_take_drains() {
        let queue = HeapDumpQueue::new();
        assert!(!queue.take());
        queue.enqueue();
        queue.enqueue();
        assert!(queue.is_pending());
        assert!(queue.take());
        assert!(!queue.take());
    }

    #[test]
    fn test_capture_records_failed_measurements_as_absent() {
        let probe = FakeMemory::with_rss(4096);
        probe.fail_heap();
        let report = HeapReport::capture(&*probe, "web");
        assert_eq!(report.rss_bytes, Some(4096));
        assert!(report.heap.is_none());
        assert!(report.heap_fragmentation.is_none());
        assert_eq!(report.pid, std::process::id());
    }

    #[test]
    fn test_write_creates_dir_and_file() {
        let dir = tempdir().unwrap();
        let writer = HeapReportWriter::new(dir.path().join("reports/nested"));
        let report = HeapReport::capture(&*FakeMemory::with_rss(1), "job");

        let path = writer.write(&report).unwrap();

        assert!(path.exists());
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("heap-job-"));
        assert!(name.ends_with(".json"));

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["role"], "job");
        assert_eq!(written["rss_bytes"], 1);
    }

    #[test]
    fn test_write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let writer = HeapReportWriter::new(dir.path());
        writer
            .write(&HeapReport::capture(&*FakeMemory::with_rss(1), "web"))
            .unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_run_pending_without_request_writes_nothing() {
        let dir = tempdir().unwrap();
        let writer = HeapReportWriter::new(dir.path().join("reports"));
        let queue = HeapDumpQueue::new();
        let written = writer
            .run_pending(&queue, &*FakeMemory::with_rss(1), "web")
            .unwrap();
        assert!(written.is_none());
        assert!(!dir.path().join("reports").exists());
    }

    #[test]
    fn test_run_pending_writes_once() {
        let dir = tempdir().unwrap();
        let writer = HeapReportWriter::new(dir.path());
        let queue = HeapDumpQueue::new();
        let probe = FakeMemory::with_rss(1);
        queue.enqueue();

        assert!(writer.run_pending(&queue, &*probe, "web").unwrap().is_some());
        assert!(writer.run_pending(&queue, &*probe, "web").unwrap().is_none());
    }

    #[test]
    fn test_write_into_file_path_fails() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let writer = HeapReportWriter::new(&blocker);
        let err = writer
            .write(&HeapReport::capture(&*FakeMemory::with_rss(1), "web"))
            .unwrap_err();
        assert!(matches!(err, DiagnosticsError::CreateDir { .. }));
    }
}
