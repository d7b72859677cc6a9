use super::{Monitor, MonitorError, Payload, ViolationResult};
use crate::memory::MemoryProbe;
use serde_json::json;
use std::sync::Arc;

/// Violates when unique memory has grown by more than `max_growth` times
/// the reference captured when the monitor was built.
pub struct UniqueMemoryGrowth {
    probe: Arc<dyn MemoryProbe>,
    max_growth: f64,
    reference_uss: Option<u64>,
}

impl UniqueMemoryGrowth {
    pub const NAME: &'static str = "unique_memory_growth";

    /// Build the monitor, sampling the reference USS now.
    ///
    /// A failed or zero sample leaves the monitor without a baseline; every
    /// later call then returns `MonitorError::MissingBaseline`.
    pub fn new(probe: Arc<dyn MemoryProbe>, max_growth: f64) -> Self {
        let reference_uss = match probe.uss_bytes() {
            Ok(0) => {
                tracing::warn!("unique memory baseline sampled as zero");
                None
            }
            Ok(uss) => Some(uss),
            Err(e) => {
                tracing::warn!(error = %e, "failed to sample unique memory baseline");
                None
            }
        };
        Self {
            probe,
            max_growth,
            reference_uss,
        }
    }

    pub fn reference_uss(&self) -> Option<u64> {
        self.reference_uss
    }
}

impl Monitor for UniqueMemoryGrowth {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn call(&self) -> Result<ViolationResult, MonitorError> {
        let reference_uss = self.reference_uss.ok_or_else(|| {
            MonitorError::MissingBaseline("reference USS was not captured".to_string())
        })?;
        let current_uss = self.probe.uss_bytes()?;
        let growth = current_uss as f64 / reference_uss as f64;

        let mut payload = Payload::new();
        payload.insert("memwd_cur_uss_bytes".into(), json!(current_uss));
        payload.insert("memwd_ref_uss_bytes".into(), json!(reference_uss));
        payload.insert("memwd_max_uss_growth".into(), json!(self.max_growth));

        if growth > self.max_growth {
            payload.insert("message".into(), json!("memory limit exceeded"));
            payload.insert("memwd_uss_growth".into(), json!(growth));
            Ok(ViolationResult::violation(payload))
        } else {
            Ok(ViolationResult::ok().with_payload(payload))
        }
    }
}
