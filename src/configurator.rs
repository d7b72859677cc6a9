/// Builds a watchdog `Configuration` for each supervised worker role.
///
/// Web workers serve requests and are asked to shut down gracefully. Job
/// workers are sent SIGTERM.
use crate::config::Settings;
use crate::diagnostics::HeapDumpQueue;
use crate::event_reporter::TracingReporter;
use crate::handler::{GracefulShutdownHandler, ShutdownRequest, TermProcessHandler};
use crate::memory::MemoryProbe;
use crate::monitor::{HeapFragmentation, MonitorStack, RssMemoryLimit, UniqueMemoryGrowth};
use crate::watchdog::{Configuration, ConfigurationError};
use std::sync::Arc;
use std::time::Duration;

pub const RSS_SOFT_LIMIT_NAME: &str = "rss_memory_soft_limit";
pub const RSS_HARD_LIMIT_NAME: &str = "rss_memory_hard_limit";

/// Kind of worker process being supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    /// Request-serving worker.
    Web,
    /// Background job worker.
    Job,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Web => "web",
            Role::Job => "job",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide collaborators the configurator wires into a configuration.
#[derive(Clone)]
pub struct WorkerContext {
    pub probe: Arc<dyn MemoryProbe>,
    pub heap_dumps: Arc<HeapDumpQueue>,
    pub graceful_shutdown: Arc<GracefulShutdownHandler>,
}

impl WorkerContext {
    /// Build a context and the shutdown request the host should wait on.
    pub fn new(probe: Arc<dyn MemoryProbe>) -> (Self, ShutdownRequest) {
        let (handler, request) = GracefulShutdownHandler::new();
        let context = Self {
            probe,
            heap_dumps: Arc::new(HeapDumpQueue::new()),
            graceful_shutdown: Arc::new(handler),
        };
        (context, request)
    }
}

pub fn configure(
    role: Role,
    settings: &Settings,
    context: &WorkerContext,
) -> Result<Configuration, ConfigurationError> {
    match role {
        Role::Web => configure_for_web_worker(settings, context),
        Role::Job => configure_for_job_worker(settings, context),
    }
}

pub fn configure_for_web_worker(
    settings: &Settings,
    context: &WorkerContext,
) -> Result<Configuration, ConfigurationError> {
    let config = Configuration {
        handler: context.graceful_shutdown.clone(),
        sleep_interval: Duration::from_secs(settings.sleep_time_secs),
        monitors: web_worker_monitors(settings, &context.probe),
        write_heap_dumps: settings.dump_heap,
        event_reporter: Arc::new(TracingReporter::for_role(Role::Web.as_str())),
        heap_dumps: context.heap_dumps.clone(),
    };
    config.validate()?;
    Ok(config)
}

pub fn configure_for_job_worker(
    settings: &Settings,
    context: &WorkerContext,
) -> Result<Configuration, ConfigurationError> {
    let config = Configuration {
        handler: Arc::new(TermProcessHandler::new()),
        sleep_interval: Duration::from_secs(settings.job_sleep_interval_secs()),
        monitors: job_worker_monitors(settings, &context.probe),
        write_heap_dumps: settings.dump_heap,
        event_reporter: Arc::new(TracingReporter::for_role(Role::Job.as_str())),
        heap_dumps: context.heap_dumps.clone(),
    };
    config.validate()?;
    Ok(config)
}

/// Heap shape monitors with a grace period when the worker killer is
/// disabled, otherwise a zero-tolerance RSS limit. Never both.
fn web_worker_monitors(settings: &Settings, probe: &Arc<dyn MemoryProbe>) -> MonitorStack {
    let mut stack = MonitorStack::new();
    if settings.disable_worker_killer {
        stack
            .push(
                HeapFragmentation::new(probe.clone(), settings.max_heap_fragmentation),
                settings.max_strikes,
            )
            .push(
                UniqueMemoryGrowth::new(probe.clone(), settings.max_memory_growth),
                settings.max_strikes,
            );
    } else {
        stack.push(
            RssMemoryLimit::new(probe.clone(), settings.web_worker_max_memory_bytes()),
            0,
        );
    }
    stack
}

/// Optional soft limit (grace period derived from the grace time) followed
/// by an optional hard limit (zero tolerance).
fn job_worker_monitors(settings: &Settings, probe: &Arc<dyn MemoryProbe>) -> MonitorStack {
    let mut stack = MonitorStack::new();
    if settings.job_max_rss_kb != 0 {
        stack.push_named(
            RSS_SOFT_LIMIT_NAME,
            RssMemoryLimit::new(probe.clone(), settings.job_max_rss_bytes()),
            settings.job_soft_limit_max_strikes(),
        );
    }
    if settings.job_hard_limit_rss_kb != 0 {
        stack.push_named(
            RSS_HARD_LIMIT_NAME,
            RssMemoryLimit::new(probe.clone(), settings.job_hard_limit_rss_bytes()),
            0,
        );
    }
    stack
}
