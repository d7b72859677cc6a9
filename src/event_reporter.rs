/// Structured watchdog events and the sinks that record them.
///
/// The watchdog reports every state transition as an `Event`; it never logs
/// directly. `TracingReporter` is the default sink and turns each event into
/// a `tracing` event whose fields mirror the event's attributes.
use crate::monitor::Payload;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Started {
        monitors: Vec<String>,
        handler: String,
        sleep_interval_secs: f64,
        write_heap_dumps: bool,
    },
    MonitorOk {
        monitor: String,
        payload: Payload,
    },
    MonitorError {
        monitor: String,
        error: String,
    },
    StrikeRecorded {
        monitor: String,
        strikes: u32,
        max_strikes: u32,
        payload: Payload,
    },
    ThresholdExceeded {
        monitor: String,
        strikes: u32,
        max_strikes: u32,
        payload: Payload,
    },
    HeapDumpRequested {
        monitor: String,
    },
    HandlerInvoked {
        monitor: String,
        handler: String,
    },
    HandlerFailed {
        monitor: String,
        handler: String,
        error: String,
    },
    Stopped {
        reason: String,
    },
}

impl Event {
    /// Snake-case event kind, as serialized in the `event` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Started { .. } => "started",
            Event::MonitorOk { .. } => "monitor_ok",
            Event::MonitorError { .. } => "monitor_error",
            Event::StrikeRecorded { .. } => "strike_recorded",
            Event::ThresholdExceeded { .. } => "threshold_exceeded",
            Event::HeapDumpRequested { .. } => "heap_dump_requested",
            Event::HandlerInvoked { .. } => "handler_invoked",
            Event::HandlerFailed { .. } => "handler_failed",
            Event::Stopped { .. } => "stopped",
        }
    }

    /// Event attributes as a flat JSON object, without the `event` tag.
    pub fn attributes(&self) -> Map<String, Value> {
        let mut attributes = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        attributes.remove("event");
        attributes
    }
}

/// Failure inside a reporter sink.
#[derive(Debug)]
pub struct ReportError {
    message: String,
}

impl ReportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event report failed: {}", self.message)
    }
}

impl std::error::Error for ReportError {}

/// Sink for watchdog events.
///
/// Errors and panics from `report` are caught by the watchdog and logged;
/// they never stop supervision.
pub trait EventReporter: Send + Sync {
    fn report(&self, event: &Event) -> Result<(), ReportError>;
}

/// Emits events through `tracing`, tagged with the process id and worker role.
#[derive(Debug, Clone, Default)]
pub struct TracingReporter {
    role: Option<String>,
}

impl TracingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_role(role: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
        }
    }
}

impl EventReporter for TracingReporter {
    fn report(&self, event: &Event) -> Result<(), ReportError> {
        let kind = event.kind();
        let attributes = serde_json::to_string(&event.attributes())
            .map_err(|e| ReportError::new(e.to_string()))?;
        let pid = std::process::id();
        let role = self.role.as_deref().unwrap_or("-");

        match event {
            Event::MonitorOk { .. } => {
                tracing::debug!(event = kind, pid, role, %attributes, "memory watchdog")
            }
            Event::Started { .. } | Event::Stopped { .. } => {
                tracing::info!(event = kind, pid, role, %attributes, "memory watchdog")
            }
            Event::MonitorError { .. } | Event::HandlerFailed { .. } => {
                tracing::error!(event = kind, pid, role, %attributes, "memory watchdog")
            }
            _ => tracing::warn!(event = kind, pid, role, %attributes, "memory watchdog"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn strike() -> Event {
        let mut payload = Payload::new();
        payload.insert("memwd_rss_bytes".into(), json!(42));
        Event::StrikeRecorded {
            monitor: "rss_memory_limit".into(),
            strikes: 2,
            max_strikes: 5,
            payload,
        }
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let events = vec![
            strike(),
            Event::Stopped {
                reason: "stop requested".into(),
            },
            Event::HeapDumpRequested {
                monitor: "m".into(),
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["event"], event.kind());
        }
    }

    #[test]
    fn test_attributes_exclude_tag() {
        let attributes = strike().attributes();
        assert!(!attributes.contains_key("event"));
        assert_eq!(attributes["monitor"], "rss_memory_limit");
        assert_eq!(attributes["strikes"], 2);
        assert_eq!(attributes["max_strikes"], 5);
        assert_eq!(attributes["payload"]["memwd_rss_bytes"], 42);
    }

    /// Collects formatted log output in memory.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn lines(&self) -> Vec<Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    /// Report `events` under a JSON subscriber and return one log line each.
    fn capture(reporter: &TracingReporter, events: &[Event]) -> Vec<Value> {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            for event in events {
                reporter.report(event).unwrap();
            }
        });
        logs.lines()
    }

    #[test]
    fn test_strike_logged_at_warn_with_fields() {
        let lines = capture(&TracingReporter::for_role("web"), &[strike()]);
        assert_eq!(lines.len(), 1);

        let line = &lines[0];
        assert_eq!(line["level"], "WARN");
        let fields = &line["fields"];
        assert_eq!(fields["message"], "memory watchdog");
        assert_eq!(fields["event"], "strike_recorded");
        assert_eq!(fields["role"], "web");
        assert_eq!(fields["pid"], std::process::id());

        let attributes: Value =
            serde_json::from_str(fields["attributes"].as_str().unwrap()).unwrap();
        assert_eq!(attributes["monitor"], "rss_memory_limit");
        assert_eq!(attributes["strikes"], 2);
        assert_eq!(attributes["payload"]["memwd_rss_bytes"], 42);
        assert!(attributes.get("event").is_none());
    }

    #[test]
    fn test_level_per_event_kind() {
        let events = vec![
            Event::Started {
                monitors: vec!["a".into()],
                handler: "null".into(),
                sleep_interval_secs: 1.0,
                write_heap_dumps: false,
            },
            Event::MonitorOk {
                monitor: "a".into(),
                payload: Payload::new(),
            },
            Event::MonitorError {
                monitor: "a".into(),
                error: "boom".into(),
            },
            Event::ThresholdExceeded {
                monitor: "a".into(),
                strikes: 1,
                max_strikes: 0,
                payload: Payload::new(),
            },
            Event::HandlerFailed {
                monitor: "a".into(),
                handler: "null".into(),
                error: "boom".into(),
            },
            Event::Stopped {
                reason: "stop requested".into(),
            },
        ];

        let lines = capture(&TracingReporter::new(), &events);

        let levels: Vec<_> = lines.iter().map(|l| l["level"].as_str().unwrap()).collect();
        assert_eq!(levels, vec!["INFO", "DEBUG", "ERROR", "WARN", "ERROR", "INFO"]);
        let kinds: Vec<_> = lines
            .iter()
            .map(|l| l["fields"]["event"].as_str().unwrap())
            .collect();
        let expected: Vec<_> = events.iter().map(Event::kind).collect();
        assert_eq!(kinds, expected);
        assert!(lines.iter().all(|l| l["fields"]["role"] == "-"));
    }

    #[test]
    fn test_report_error_display() {
        let err = ReportError::new("disk full");
        assert_eq!(err.to_string(), "event report failed: disk full");
    }
}
