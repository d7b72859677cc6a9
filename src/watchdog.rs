/// In-process memory watchdog.
///
/// Runs alongside the worker on its own task. Every `sleep_interval` it calls
/// each monitor in stack order and keeps a strike count per monitor: a
/// violation adds a strike, anything else resets it. Once the whole stack has
/// been evaluated, the first monitor whose strikes exceed its `max_strikes`
/// triggers the handler, after which the loop ends. Monitor, handler and
/// reporter failures (errors or panics) are contained here and never take the
/// loop down.
use crate::diagnostics::HeapDumpQueue;
use crate::event_reporter::{Event, EventReporter, TracingReporter};
use crate::handler::{Handler, NullHandler};
use crate::monitor::{MonitorEntry, MonitorStack, ViolationResult};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Everything the watchdog needs to run. Read-only once the loop starts.
pub struct Configuration {
    pub handler: Arc<dyn Handler>,
    pub sleep_interval: Duration,
    pub monitors: MonitorStack,
    pub write_heap_dumps: bool,
    pub event_reporter: Arc<dyn EventReporter>,
    /// Receives heap dump requests when `write_heap_dumps` is set.
    pub heap_dumps: Arc<HeapDumpQueue>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            handler: Arc::new(NullHandler),
            sleep_interval: Duration::from_secs(crate::config::DEFAULT_SLEEP_INTERVAL_SECS),
            monitors: MonitorStack::new(),
            write_heap_dumps: false,
            event_reporter: Arc::new(TracingReporter::new()),
            heap_dumps: Arc::new(HeapDumpQueue::new()),
        }
    }
}

/// Invalid watchdog configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    ZeroSleepInterval,
    DuplicateMonitor(String),
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigurationError::ZeroSleepInterval => {
                write!(f, "watchdog sleep interval must be greater than zero")
            }
            ConfigurationError::DuplicateMonitor(name) => {
                write!(f, "monitor name {:?} is used more than once", name)
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.sleep_interval.is_zero() {
            return Err(ConfigurationError::ZeroSleepInterval);
        }
        if let Some(name) = self.monitors.duplicate_name() {
            return Err(ConfigurationError::DuplicateMonitor(name.to_string()));
        }
        Ok(())
    }

    /// Human-readable summary, one line per setting and per monitor.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "handler: {}", self.handler.name());
        let _ = writeln!(out, "sleep interval: {}s", self.sleep_interval.as_secs_f64());
        let _ = writeln!(out, "write heap dumps: {}", self.write_heap_dumps);
        if self.monitors.is_empty() {
            let _ = writeln!(out, "monitors: (none, watchdog is a no-op)");
        } else {
            let _ = writeln!(out, "monitors:");
            for entry in self.monitors.entries() {
                let _ = writeln!(out, "  - {} (max strikes: {})", entry.name, entry.max_strikes);
            }
        }
        out
    }
}

/// Watchdog lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopState::Idle,
            1 => LoopState::Running,
            _ => LoopState::Stopped,
        }
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Stopped on request (or before it ever ran).
    Stopped,
    /// A monitor exhausted its strikes and the handler was invoked.
    HandlerInvoked { monitor: String },
}

struct Shared {
    state: AtomicU8,
    stop_tx: watch::Sender<bool>,
}

impl Shared {
    fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: LoopState, to: LoopState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }
}

/// Cloneable control handle for a watchdog, usable from any thread or task.
#[derive(Clone)]
pub struct WatchdogHandle {
    shared: Arc<Shared>,
}

impl WatchdogHandle {
    /// Request the loop to stop. A running loop stops at its next wake-up,
    /// never in the middle of a tick; an idle one is stopped immediately.
    pub fn stop(&self) {
        self.shared.stop_tx.send_replace(true);
        self.shared.transition(LoopState::Idle, LoopState::Stopped);
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    /// Whether the loop has stopped or will stop at its next wake-up.
    pub fn is_stopping(&self) -> bool {
        self.shared.stop_requested() || self.state() == LoopState::Stopped
    }
}

/// Per-monitor consecutive violation counts. Lives for one loop run.
#[derive(Debug, Default)]
struct Strikes {
    counts: HashMap<String, u32>,
}

impl Strikes {
    fn record(&mut self, monitor: &str) -> u32 {
        let count = self.counts.entry(monitor.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    fn reset(&mut self, monitor: &str) {
        if let Some(count) = self.counts.get_mut(monitor) {
            *count = 0;
        }
    }

    #[cfg(test)]
    fn get(&self, monitor: &str) -> u32 {
        self.counts.get(monitor).copied().unwrap_or(0)
    }
}

pub struct Watchdog {
    config: Configuration,
    shared: Arc<Shared>,
}

impl Watchdog {
    pub fn new(config: Configuration) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            shared: Arc::new(Shared {
                state: AtomicU8::new(LoopState::Idle as u8),
                stop_tx,
            }),
        })
    }

    pub fn handle(&self) -> WatchdogHandle {
        WatchdogHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// Run the loop on a new tokio task.
    pub fn spawn(self) -> (WatchdogHandle, JoinHandle<LoopOutcome>) {
        let handle = self.handle();
        let task = tokio::spawn(async move { self.run().await });
        (handle, task)
    }

    /// Run the loop until a handler fires or a stop is requested.
    ///
    /// Only the first call runs; later calls (or a call after `stop`) return
    /// `LoopOutcome::Stopped` immediately.
    pub async fn run(&self) -> LoopOutcome {
        if !self.shared.transition(LoopState::Idle, LoopState::Running) {
            tracing::debug!(state = ?self.state(), "watchdog not idle, not starting");
            return LoopOutcome::Stopped;
        }

        self.emit(&Event::Started {
            monitors: self.config.monitors.names(),
            handler: self.config.handler.name().to_string(),
            sleep_interval_secs: self.config.sleep_interval.as_secs_f64(),
            write_heap_dumps: self.config.write_heap_dumps,
        });

        let mut stop_rx = self.shared.stop_tx.subscribe();
        let mut strikes = Strikes::default();

        let outcome = loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.sleep_interval) => {}
                _ = async { let _ = stop_rx.wait_for(|stop| *stop).await; } => {}
            }

            if self.shared.stop_requested() {
                break LoopOutcome::Stopped;
            }

            if let Some(monitor) = self.tick(&mut strikes) {
                break LoopOutcome::HandlerInvoked { monitor };
            }
        };

        self.shared.state.store(LoopState::Stopped as u8, Ordering::SeqCst);
        let reason = match &outcome {
            LoopOutcome::Stopped => "stop requested".to_string(),
            LoopOutcome::HandlerInvoked { monitor } => format!("handler invoked by {monitor}"),
        };
        self.emit(&Event::Stopped { reason });
        outcome
    }

    /// Evaluate every monitor once, then escalate the first one in stack
    /// order whose strikes exceed its limit. Returns that monitor's name.
    /// The handler runs after all strikes for the tick are recorded, so
    /// `handler_invoked` is always the last event of the tick.
    fn tick(&self, strikes: &mut Strikes) -> Option<String> {
        let mut breach = None;

        for entry in self.config.monitors.entries() {
            let Some(result) = self.evaluate(entry) else {
                strikes.reset(&entry.name);
                continue;
            };

            if !result.violated {
                strikes.reset(&entry.name);
                self.emit(&Event::MonitorOk {
                    monitor: entry.name.clone(),
                    payload: result.payload,
                });
                continue;
            }

            let count = strikes.record(&entry.name);
            self.emit(&Event::StrikeRecorded {
                monitor: entry.name.clone(),
                strikes: count,
                max_strikes: entry.max_strikes,
                payload: result.payload.clone(),
            });

            if breach.is_none() && count > entry.max_strikes {
                breach = Some((entry, count, result));
            }
        }

        let (entry, count, result) = breach?;
        self.escalate(entry, count, result);
        Some(entry.name.clone())
    }

    /// Call one monitor, turning errors and panics into `None`.
    fn evaluate(&self, entry: &MonitorEntry) -> Option<ViolationResult> {
        let error = match catch_unwind(AssertUnwindSafe(|| entry.monitor.call())) {
            Ok(Ok(result)) => return Some(result),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("monitor panicked: {}", panic_message(panic.as_ref())),
        };
        self.emit(&Event::MonitorError {
            monitor: entry.name.clone(),
            error,
        });
        None
    }

    fn escalate(&self, entry: &MonitorEntry, strikes: u32, result: ViolationResult) {
        self.emit(&Event::ThresholdExceeded {
            monitor: entry.name.clone(),
            strikes,
            max_strikes: entry.max_strikes,
            payload: result.payload,
        });

        if self.config.write_heap_dumps {
            self.config.heap_dumps.enqueue();
            self.emit(&Event::HeapDumpRequested {
                monitor: entry.name.clone(),
            });
        }

        let handler = self.config.handler.name().to_string();
        let error = match catch_unwind(AssertUnwindSafe(|| self.config.handler.call())) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(format!("handler panicked: {}", panic_message(panic.as_ref()))),
        };

        match error {
            None => self.emit(&Event::HandlerInvoked {
                monitor: entry.name.clone(),
                handler,
            }),
            Some(error) => self.emit(&Event::HandlerFailed {
                monitor: entry.name.clone(),
                handler,
                error,
            }),
        }
    }

    /// Report an event. Reporter failures are logged and swallowed.
    fn emit(&self, event: &Event) {
        let reporter = &self.config.event_reporter;
        match catch_unwind(AssertUnwindSafe(|| reporter.report(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(event = event.kind(), error = %e, "event reporter failed");
            }
            Err(panic) => {
                tracing::warn!(
                    event = event.kind(),
                    panic = %panic_message(panic.as_ref()),
                    "event reporter panicked"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
