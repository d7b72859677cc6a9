use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Watchdog settings, loaded from an optional `memwatch.toml` and then
/// overridden by environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Write a heap report on worker stop after a breach.
    pub dump_heap: bool,
    /// Loop interval for web workers.
    pub sleep_time_secs: u64,
    /// Grace period for web worker monitors.
    pub max_strikes: u32,
    /// Heap fragmentation ratio limit (web, worker killer disabled).
    pub max_heap_fragmentation: f64,
    /// Unique memory growth factor limit (web, worker killer disabled).
    pub max_memory_growth: f64,
    /// Where heap reports are written.
    pub reports_dir: PathBuf,
    /// Monitor heap shape instead of enforcing an RSS limit on web workers.
    pub disable_worker_killer: bool,
    /// RSS limit for web workers, in MB.
    pub web_worker_max_memory_mb: u64,
    /// Loop interval for job workers. Clamped to `MIN_JOB_SLEEP_INTERVAL_SECS`.
    pub job_check_interval_secs: u64,
    /// Soft RSS limit for job workers, in KB. 0 disables it.
    pub job_max_rss_kb: u64,
    /// How long a job worker may stay over the soft limit.
    pub job_grace_time_secs: u64,
    /// Hard RSS limit for job workers, in KB. 0 disables it.
    pub job_hard_limit_rss_kb: u64,
}

pub const DEFAULT_SLEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_STRIKES: u32 = 5;
pub const DEFAULT_MAX_HEAP_FRAG: f64 = 0.5;
pub const DEFAULT_MAX_MEM_GROWTH: f64 = 3.0;
pub const DEFAULT_WEB_WORKER_RSS_LIMIT_MB: u64 = 1200;
pub const DEFAULT_JOB_SLEEP_INTERVAL_SECS: u64 = 3;
pub const MIN_JOB_SLEEP_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_JOB_GRACE_TIME_SECS: u64 = 300;

impl Default for Settings {
    fn default() -> Self {
        Self {
            dump_heap: false,
            sleep_time_secs: DEFAULT_SLEEP_INTERVAL_SECS,
            max_strikes: DEFAULT_MAX_STRIKES,
            max_heap_fragmentation: DEFAULT_MAX_HEAP_FRAG,
            max_memory_growth: DEFAULT_MAX_MEM_GROWTH,
            reports_dir: PathBuf::from("tmp/diagnostic_reports"),
            disable_worker_killer: false,
            web_worker_max_memory_mb: DEFAULT_WEB_WORKER_RSS_LIMIT_MB,
            job_check_interval_secs: DEFAULT_JOB_SLEEP_INTERVAL_SECS,
            job_max_rss_kb: 0,
            job_grace_time_secs: DEFAULT_JOB_GRACE_TIME_SECS,
            job_hard_limit_rss_kb: 0,
        }
    }
}

/// Errors that can occur while loading settings.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl Settings {
    /// Load settings: defaults, then the config file if it exists, then the
    /// process environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut settings = if path.exists() {
            Self::from_file(path)?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Override fields from environment-style variables.
    ///
    /// Unset keys leave the field untouched. Values that fail to parse are
    /// logged and ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvOverrides { lookup };
        env.flag("MEMWD_DUMP_HEAP", &mut self.dump_heap);
        env.number("MEMWD_SLEEP_TIME_SEC", &mut self.sleep_time_secs);
        env.number("MEMWD_MAX_STRIKES", &mut self.max_strikes);
        env.ratio("MEMWD_MAX_HEAP_FRAG", &mut self.max_heap_fragmentation);
        env.ratio("MEMWD_MAX_MEM_GROWTH", &mut self.max_memory_growth);
        if let Some(dir) = env.value("MEMWD_REPORTS_DIR") {
            self.reports_dir = PathBuf::from(dir);
        }
        env.flag("DISABLE_WEB_WORKER_KILLER", &mut self.disable_worker_killer);
        env.number("WEB_WORKER_MAX_MEMORY", &mut self.web_worker_max_memory_mb);
        env.number(
            "JOB_MEMORY_KILLER_CHECK_INTERVAL",
            &mut self.job_check_interval_secs,
        );
        env.number("JOB_MEMORY_KILLER_MAX_RSS", &mut self.job_max_rss_kb);
        env.number("JOB_MEMORY_KILLER_GRACE_TIME", &mut self.job_grace_time_secs);
        env.number(
            "JOB_MEMORY_KILLER_HARD_LIMIT_RSS",
            &mut self.job_hard_limit_rss_kb,
        );
    }

    /// Job worker loop interval, never below the floor.
    pub fn job_sleep_interval_secs(&self) -> u64 {
        self.job_check_interval_secs.max(MIN_JOB_SLEEP_INTERVAL_SECS)
    }

    /// Strikes allowed over the job soft limit: the grace time expressed in
    /// whole loop intervals, truncated.
    pub fn job_soft_limit_max_strikes(&self) -> u32 {
        let strikes = self.job_grace_time_secs / self.job_sleep_interval_secs();
        u32::try_from(strikes).unwrap_or(u32::MAX)
    }

    pub fn web_worker_max_memory_bytes(&self) -> u64 {
        self.web_worker_max_memory_mb.saturating_mul(1024 * 1024)
    }

    pub fn job_max_rss_bytes(&self) -> u64 {
        self.job_max_rss_kb.saturating_mul(1024)
    }

    pub fn job_hard_limit_rss_bytes(&self) -> u64 {
        self.job_hard_limit_rss_kb.saturating_mul(1024)
    }
}

struct EnvOverrides<F> {
    lookup: F,
}

impl<F> EnvOverrides<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn value(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn number<T: std::str::FromStr>(&self, key: &str, field: &mut T) {
        let Some(raw) = self.value(key) else {
            return;
        };
        match raw.parse() {
            Ok(v) => *field = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
        }
    }

    /// Like `number`, but only finite, non-negative values are accepted.
    fn ratio(&self, key: &str, field: &mut f64) {
        let Some(raw) = self.value(key) else {
            return;
        };
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() && v >= 0.0 => *field = v,
            _ => tracing::warn!(key, value = %raw, "ignoring invalid ratio setting"),
        }
    }

    fn flag(&self, key: &str, field: &mut bool) {
        let Some(raw) = self.value(key) else {
            return;
        };
        match parse_bool(&raw) {
            Some(v) => *field = v,
            None => tracing::warn!(key, value = %raw, "ignoring unparseable boolean setting"),
        }
    }
}

/// Accepts 1/0, true/false, yes/no, on/off (case-insensitive).
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
