pub mod heap_fragmentation;
pub mod rss_memory_limit;
pub mod unique_memory_growth;

pub use heap_fragmentation::HeapFragmentation;
pub use rss_memory_limit::RssMemoryLimit;
pub use unique_memory_growth::UniqueMemoryGrowth;

use crate::memory::MemoryError;
use serde_json::{Map, Value};

/// Diagnostic detail attached to a monitor result. Only used for reporting.
pub type Payload = Map<String, Value>;

/// Outcome of a single monitor evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationResult {
    pub violated: bool,
    pub payload: Payload,
}

impl ViolationResult {
    /// The monitored resource is within its limit.
    pub fn ok() -> Self {
        Self {
            violated: false,
            payload: Payload::new(),
        }
    }

    /// The monitored resource is over its limit.
    pub fn violation(payload: Payload) -> Self {
        Self {
            violated: true,
            payload,
        }
    }

    /// Attach diagnostic detail without changing the verdict.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

/// Errors a monitor can return instead of a verdict.
#[derive(Debug)]
pub enum MonitorError {
    /// The underlying measurement failed.
    Measurement(MemoryError),
    /// The monitor has no reference value to compare against.
    MissingBaseline(String),
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::Measurement(e) => write!(f, "measurement failed: {e}"),
            MonitorError::MissingBaseline(reason) => {
                write!(f, "no baseline available: {reason}")
            }
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Measurement(e) => Some(e),
            MonitorError::MissingBaseline(_) => None,
        }
    }
}

impl From<MemoryError> for MonitorError {
    fn from(e: MemoryError) -> Self {
        MonitorError::Measurement(e)
    }
}

/// A health check over one resource dimension of the current process.
///
/// Monitors keep no strike state; escalation is the watchdog's job.
pub trait Monitor: Send + Sync {
    /// Default name used for reporting and strike accounting.
    fn name(&self) -> &str;

    /// Evaluate the resource once.
    fn call(&self) -> Result<ViolationResult, MonitorError>;
}

/// A monitor together with its escalation budget.
pub struct MonitorEntry {
    pub name: String,
    pub max_strikes: u32,
    pub monitor: Box<dyn Monitor>,
}

impl std::fmt::Debug for MonitorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorEntry")
            .field("name", &self.name)
            .field("max_strikes", &self.max_strikes)
            .finish_non_exhaustive()
    }
}

/// Ordered list of monitors evaluated on every tick, in push order.
#[derive(Debug, Default)]
pub struct MonitorStack {
    entries: Vec<MonitorEntry>,
}

impl MonitorStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a monitor under its own name.
    pub fn push(&mut self, monitor: impl Monitor + 'static, max_strikes: u32) -> &mut Self {
        let name = monitor.name().to_string();
        self.push_named(name, monitor, max_strikes)
    }

    /// Append a monitor under an explicit name (e.g. soft vs. hard limits
    /// backed by the same monitor type).
    pub fn push_named(
        &mut self,
        name: impl Into<String>,
        monitor: impl Monitor + 'static,
        max_strikes: u32,
    ) -> &mut Self {
        self.entries.push(MonitorEntry {
            name: name.into(),
            max_strikes,
            monitor: Box::new(monitor),
        });
        self
    }

    pub fn entries(&self) -> &[MonitorEntry] {
        &self.entries
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First name that appears more than once, if any.
    pub fn duplicate_name(&self) -> Option<&str> {
        self.entries.iter().enumerate().find_map(|(i, entry)| {
            self.entries[..i]
                .iter()
                .any(|earlier| earlier.name == entry.name)
                .then_some(entry.name.as_str())
        })
    }
}
