use anyhow::Context;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LoggerConfig {
    pub level: String,
    pub file_dir: Option<String>,
    pub file_prefix: Option<String>,
    pub rolling: Option<String>,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_max_files() -> usize {
    2
}

impl LoggerConfig {
    /// Reads NMSRT_LOG_LEVEL, NMSRT_LOG_DIR, NMSRT_LOG_PREFIX and NMSRT_LOG_ROLLING.
    /// Unset variables fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: std::env::var("NMSRT_LOG_LEVEL").unwrap_or(defaults.level),
            file_dir: std::env::var("NMSRT_LOG_DIR").ok(),
            file_prefix: std::env::var("NMSRT_LOG_PREFIX").ok(),
            rolling: std::env::var("NMSRT_LOG_ROLLING").ok().or(defaults.rolling),
            max_files: defaults.max_files,
        }
    }

    /// Installs the global subscriber. Keep the returned guard alive for the
    /// whole run when logging to files, or buffered lines are lost on exit.
    pub fn init(&self) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
        let level = Level::from_str(&self.level).unwrap_or(Level::INFO);

        if let Some(dir_str) = self.file_dir.as_deref() {
            let prefix = self.file_prefix.as_deref().unwrap_or("nmsrt");

            let rotation = match self.rolling.as_deref() {
                Some("hourly") => Rotation::HOURLY,
                Some("minutely") => Rotation::MINUTELY,
                Some("never") => Rotation::NEVER,
                _ => Rotation::DAILY,
            };

            let appender = RollingFileAppender::builder()
                .rotation(rotation)
                .max_log_files(self.max_files.max(1))
                .filename_prefix(prefix)
                .build(dir_str)
                .with_context(|| format!("failed to create rolling appender in {dir_str}"))?;

            let (nb, guard) = tracing_appender::non_blocking(appender);

            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_thread_names(true)
                .with_writer(nb)
                .try_init();

            tracing::info!(
                "logging to dir: {}, prefix: {}, rotation: {:?}",
                dir_str,
                prefix,
                self.rolling
            );
            Ok(Some(guard))
        } else {
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_thread_names(true)
                .try_init();
            Ok(None)
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            file_prefix: None,
            rolling: Some("daily".to_string()),
            max_files: default_max_files(),
        }
    }
}

/// Rate limiter for log lines emitted from hot loops (per-record or per-step).
/// Messages inside the interval are counted and the count is attached to the
/// next line that gets through.
///
/// ```ignore
/// warn_throttled!(Duration::from_secs(5), "[Source] {} lags wall clock", name);
/// ```
pub struct Throttle {
    last: Mutex<Instant>,
    suppressed: AtomicU64,
    interval: Duration,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        // start in the past so the first message passes
        let start = Instant::now()
            .checked_sub(interval)
            .unwrap_or_else(Instant::now);
        Self {
            last: Mutex::new(start),
            suppressed: AtomicU64::new(0),
            interval,
        }
    }

    /// Returns `Some(suppressed)` when a message may be emitted.
    #[inline]
    pub fn poll(&self) -> Option<u64> {
        let mut last = self.last.lock();
        if last.elapsed() >= self.interval {
            *last = Instant::now();
            Some(self.suppressed.swap(0, Ordering::Relaxed))
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

/// Level given as an identifier (`error`, `warn`, `info`, `debug`, `trace`).
#[macro_export]
macro_rules! log_throttled {
    ($level:ident, $interval:expr, $($arg:tt)*) => {{
        // one throttle per call site
        static _THROTTLE: std::sync::OnceLock<$crate::utils::logger::Throttle> =
            std::sync::OnceLock::new();
        let t = _THROTTLE.get_or_init(|| $crate::utils::logger::Throttle::new($interval));
        if let Some(_suppressed) = t.poll() {
            if _suppressed > 0 {
                tracing::$level!(suppressed = _suppressed, $($arg)*);
            } else {
                tracing::$level!($($arg)*);
            }
        }
    }};
}

#[macro_export]
macro_rules! warn_throttled {
    ($interval:expr, $($arg:tt)*) => {
        $crate::log_throttled!(warn, $interval, $($arg)*);
    };
}
#[macro_export]
macro_rules! debug_throttled {
    ($interval:expr, $($arg:tt)*) => {
        $crate::log_throttled!(debug, $interval, $($arg)*);
    };
}
