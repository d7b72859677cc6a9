use super::{Monitor, MonitorError, Payload, ViolationResult};
use crate::memory::MemoryProbe;
use serde_json::json;
use std::sync::Arc;

/// Violates when resident memory exceeds an absolute byte limit.
pub struct RssMemoryLimit {
    probe: Arc<dyn MemoryProbe>,
    limit_bytes: u64,
}

impl RssMemoryLimit {
    pub const NAME: &'static str = "rss_memory_limit";

    pub fn new(probe: Arc<dyn MemoryProbe>, limit_bytes: u64) -> Self {
        Self { probe, limit_bytes }
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }
}

impl Monitor for RssMemoryLimit {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn call(&self) -> Result<ViolationResult, MonitorError> {
        let rss_bytes = self.probe.rss_bytes()?;

        let mut payload = Payload::new();
        payload.insert("memwd_rss_bytes".into(), json!(rss_bytes));
        payload.insert("memwd_max_rss_bytes".into(), json!(self.limit_bytes));

        if rss_bytes > self.limit_bytes {
            payload.insert("message".into(), json!("rss memory limit exceeded"));
            Ok(ViolationResult::violation(payload))
        } else {
            Ok(ViolationResult::ok().with_payload(payload))
        }
    }
}
