/// Worker lifecycle hooks and the memory watchdog's wiring into them.
///
/// The host runtime calls `do_worker_start` once the worker is ready to take
/// work and `do_worker_stop` while it is shutting down. `install` registers
/// hooks that start the watchdog on worker start, and on worker stop halt it
/// and write any heap report it requested.
use crate::config::Settings;
use crate::configurator::{configure, Role, WorkerContext};
use crate::diagnostics::HeapReportWriter;
use crate::watchdog::{LoopOutcome, Watchdog, WatchdogHandle};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

type Hook = Box<dyn FnMut() + Send>;

/// Registered worker start/stop callbacks, run in registration order.
#[derive(Default)]
pub struct LifecycleEvents {
    worker_start: Vec<Hook>,
    worker_stop: Vec<Hook>,
}

impl LifecycleEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_worker_start(&mut self, hook: impl FnMut() + Send + 'static) {
        self.worker_start.push(Box::new(hook));
    }

    pub fn on_worker_stop(&mut self, hook: impl FnMut() + Send + 'static) {
        self.worker_stop.push(Box::new(hook));
    }

    pub fn do_worker_start(&mut self) {
        for hook in &mut self.worker_start {
            hook();
        }
    }

    pub fn do_worker_stop(&mut self) {
        for hook in &mut self.worker_stop {
            hook();
        }
    }
}

struct Running {
    handle: WatchdogHandle,
    task: JoinHandle<LoopOutcome>,
}

/// The watchdog started by the lifecycle hooks, if any.
#[derive(Clone, Default)]
pub struct WatchdogSlot {
    running: Arc<Mutex<Option<Running>>>,
}

impl WatchdogSlot {
    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn handle(&self) -> Option<WatchdogHandle> {
        self.lock().as_ref().map(|r| r.handle.clone())
    }

    /// Request a stop without waiting for the loop to finish.
    pub fn stop(&self) {
        if let Some(running) = self.lock().as_ref() {
            running.handle.stop();
        }
    }

    /// Wait for the loop task to finish, taking it out of the slot.
    pub async fn join(&self) -> Option<LoopOutcome> {
        let running = self.lock().take()?;
        match running.task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(error = %e, "memory watchdog task failed");
                None
            }
        }
    }
}

/// Register the memory watchdog on `events` for a worker of `role`.
///
/// The start hook must run inside a tokio runtime. Invalid settings are
/// logged and leave the worker unsupervised rather than failing it.
pub fn install(
    events: &mut LifecycleEvents,
    role: Role,
    settings: Settings,
    context: WorkerContext,
) -> WatchdogSlot {
    let slot = WatchdogSlot::default();

    let start_slot = slot.clone();
    let start_settings = settings.clone();
    let start_context = context.clone();
    events.on_worker_start(move || {
        start_watchdog(&start_slot, role, &start_settings, &start_context);
    });

    let stop_slot = slot.clone();
    let reports = settings
        .dump_heap
        .then(|| HeapReportWriter::new(settings.reports_dir.clone()));
    events.on_worker_stop(move || {
        stop_slot.stop();
        if let Some(writer) = &reports {
            let written =
                writer.run_pending(&context.heap_dumps, context.probe.as_ref(), role.as_str());
            if let Err(e) = written {
                tracing::error!(error = %e, "failed to write heap report");
            }
        }
    });

    slot
}

fn start_watchdog(slot: &WatchdogSlot, role: Role, settings: &Settings, context: &WorkerContext) {
    let mut running = slot.lock();
    if let Some(existing) = running.as_ref() {
        if !existing.handle.is_stopping() {
            tracing::warn!(%role, "memory watchdog already running for this worker");
            return;
        }
        tracing::debug!(%role, "replacing stopped memory watchdog");
    }

    let watchdog = match configure(role, settings, context).and_then(Watchdog::new) {
        Ok(watchdog) => watchdog,
        Err(e) => {
            tracing::error!(%role, error = %e, "invalid memory watchdog configuration, not starting");
            return;
        }
    };

    if tokio::runtime::Handle::try_current().is_err() {
        tracing::error!(%role, "no tokio runtime on worker start, memory watchdog not started");
        return;
    }

    tracing::info!(
        %role,
        monitors = ?watchdog.configuration().monitors.names(),
        "starting memory watchdog"
    );
    let (handle, task) = watchdog.spawn();
    *running = Some(Running { handle, task });
}
