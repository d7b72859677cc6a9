use super::{Monitor, MonitorError, Payload, ViolationResult};
use crate::memory::MemoryProbe;
use serde_json::json;
use std::sync::Arc;

/// Violates when the allocator's unused share of its system memory
/// exceeds `max_fragmentation` (a ratio in `[0, 1]`).
pub struct HeapFragmentation {
    probe: Arc<dyn MemoryProbe>,
    max_fragmentation: f64,
}

impl HeapFragmentation {
    pub const NAME: &'static str = "heap_fragmentation";

    pub fn new(probe: Arc<dyn MemoryProbe>, max_fragmentation: f64) -> Self {
        Self {
            probe,
            max_fragmentation,
        }
    }
}

impl Monitor for HeapFragmentation {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn call(&self) -> Result<ViolationResult, MonitorError> {
        let stats = self.probe.heap_stats()?;
        let fragmentation = stats.fragmentation();

        let mut payload = Payload::new();
        payload.insert("memwd_cur_heap_frag".into(), json!(fragmentation));
        payload.insert("memwd_max_heap_frag".into(), json!(self.max_fragmentation));

        if fragmentation > self.max_fragmentation {
            payload.insert("message".into(), json!("heap fragmentation limit exceeded"));
            Ok(ViolationResult::violation(payload))
        } else {
            Ok(ViolationResult::ok().with_payload(payload))
        }
    }
}
