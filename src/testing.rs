//! Test doubles shared by the unit tests.

use crate::event_reporter::{Event, EventReporter, ReportError};
use crate::handler::{Handler, HandlerError};
use crate::memory::{HeapStats, MemoryError, MemoryProbe};
use crate::monitor::{Monitor, MonitorError, Payload, ViolationResult};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ── Memory probe ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeMemory {
    rss: AtomicU64,
    uss: AtomicU64,
    heap: Mutex<Option<HeapStats>>,
    rss_fails: AtomicBool,
    uss_fails: AtomicBool,
    heap_fails: AtomicBool,
}

impl FakeMemory {
    pub fn with_rss(bytes: u64) -> Arc<Self> {
        let probe = Self::default();
        probe.rss.store(bytes, Ordering::SeqCst);
        Arc::new(probe)
    }

    pub fn with_uss(bytes: u64) -> Arc<Self> {
        let probe = Self::default();
        probe.uss.store(bytes, Ordering::SeqCst);
        Arc::new(probe)
    }

    pub fn with_heap(stats: HeapStats) -> Arc<Self> {
        let probe = Self::default();
        *probe.heap.lock().unwrap() = Some(stats);
        Arc::new(probe)
    }

    pub fn set_rss(&self, bytes: u64) {
        self.rss.store(bytes, Ordering::SeqCst);
    }

    pub fn set_uss(&self, bytes: u64) {
        self.uss.store(bytes, Ordering::SeqCst);
    }

    pub fn fail_rss(&self) {
        self.rss_fails.store(true, Ordering::SeqCst);
    }

    pub fn fail_uss(&self) {
        self.uss_fails.store(true, Ordering::SeqCst);
    }

    pub fn fail_heap(&self) {
        self.heap_fails.store(true, Ordering::SeqCst);
    }
}

impl MemoryProbe for FakeMemory {
    fn rss_bytes(&self) -> Result<u64, MemoryError> {
        if self.rss_fails.load(Ordering::SeqCst) {
            return Err(MemoryError::Unsupported("resident memory"));
        }
        Ok(self.rss.load(Ordering::SeqCst))
    }

    fn uss_bytes(&self) -> Result<u64, MemoryError> {
        if self.uss_fails.load(Ordering::SeqCst) {
            return Err(MemoryError::Unsupported("unique memory"));
        }
        Ok(self.uss.load(Ordering::SeqCst))
    }

    fn heap_stats(&self) -> Result<HeapStats, MemoryError> {
        if self.heap_fails.load(Ordering::SeqCst) {
            return Err(MemoryError::Unsupported("heap statistics"));
        }
        Ok(self.heap.lock().unwrap().unwrap_or(HeapStats {
            in_use_bytes: 0,
            system_bytes: 0,
        }))
    }
}

// ── Monitor ─────────────────────────────────────────────────────────────

/// What a scripted monitor does on one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Ok,
    Violate,
    Fail,
    Panic,
}

/// Monitor that replays a fixed script, then reports ok forever.
pub struct ScriptedMonitor {
    name: String,
    script: Mutex<VecDeque<Step>>,
    after_script: Step,
    calls: Arc<AtomicUsize>,
}

impl ScriptedMonitor {
    pub fn new(name: &str, script: &[Step]) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script.iter().copied().collect()),
            after_script: Step::Ok,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn always_ok(name: &str) -> Self {
        Self::new(name, &[])
    }

    pub fn always(name: &str, step: Step) -> Self {
        let mut monitor = Self::new(name, &[]);
        monitor.after_script = step;
        monitor
    }

    /// Shared call counter, readable after the monitor is moved into a stack.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Monitor for ScriptedMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self) -> Result<ViolationResult, MonitorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.after_script);
        match step {
            Step::Ok => Ok(ViolationResult::ok()),
            Step::Violate => {
                let mut payload = Payload::new();
                payload.insert("message".into(), json!(format!("{} violated", self.name)));
                Ok(ViolationResult::violation(payload))
            }
            Step::Fail => Err(MonitorError::MissingBaseline("scripted failure".into())),
            Step::Panic => panic!("scripted panic in {}", self.name),
        }
    }
}

// ── Reporter ────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::kind).collect()
    }

    /// Strike counts recorded for `monitor`, in order.
    pub fn strikes_for(&self, monitor: &str) -> Vec<u32> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                Event::StrikeRecorded {
                    monitor: m,
                    strikes,
                    ..
                } if m == monitor => Some(*strikes),
                _ => None,
            })
            .collect()
    }
}

impl EventReporter for RecordingReporter {
    fn report(&self, event: &Event) -> Result<(), ReportError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Reporter that errors (or panics) on every event.
pub struct BrokenReporter {
    pub panics: bool,
}

impl EventReporter for BrokenReporter {
    fn report(&self, event: &Event) -> Result<(), ReportError> {
        if self.panics {
            panic!("reporter panicked on {}", event.kind());
        }
        Err(ReportError::new(format!("sink unavailable for {}", event.kind())))
    }
}

// ── Handler ─────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct CountingHandler {
    calls: Arc<AtomicUsize>,
    fails: bool,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fails: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Handler for CountingHandler {
    fn name(&self) -> &str {
        "counting"
    }

    fn call(&self) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fails {
            return Err(HandlerError::NoListener);
        }
        Ok(())
    }
}
