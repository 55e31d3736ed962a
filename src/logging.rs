//! Tracing setup for the daemon and the one-shot commands.
//!
//! Integrity alerts (mismatches, refused mounts, accepted re-baselines) are
//! logged on [`SECURITY_TARGET`]. The default filter keeps that target at
//! `warn` or lower so a quiet `info` run still shows them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

pub const SECURITY_TARGET: &str = "usbwarden::security";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// One JSON object per line instead of the console format.
    pub json: bool,
    /// Lower the default level to DEBUG.
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    fn level(&self) -> Level {
        if self.verbose { Level::DEBUG } else { Level::INFO }
    }
}

/// Install the global subscriber. `RUST_LOG`, when set, replaces the default filter.
///
/// Returns `false` if a subscriber was already installed (e.g. by a test harness).
pub fn init(config: LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config.level())));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init()
    };
    installed.is_ok()
}

fn default_directives(level: Level) -> String {
    let crate_level = level.as_str().to_ascii_lowercase();
    let security_level = if level >= Level::DEBUG { "debug" } else { "warn" };
    format!("usbwarden={crate_level},{SECURITY_TARGET}={security_level}")
}

/// Lock-free gate for periodic log lines such as hash progress.
///
/// `should_log` returns `true` at most once per interval, across threads.
pub struct LogThrottle {
    interval: Duration,
    origin: Instant,
    /// Earliest offset from `origin`, in milliseconds, at which the next line may go out.
    next_allowed_ms: AtomicU64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            origin: Instant::now(),
            next_allowed_ms: AtomicU64::new(0),
        }
    }

    pub fn should_log(&self) -> bool {
        let now = self.origin.elapsed().as_millis() as u64;
        let step = self.interval.as_millis() as u64;
        self.next_allowed_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                (now >= next).then(|| now.saturating_add(step.max(1)))
            })
            .is_ok()
    }

    /// Let the next call through regardless of the interval.
    pub fn reset(&self) {
        self.next_allowed_ms.store(0, Ordering::Relaxed);
    }
}
