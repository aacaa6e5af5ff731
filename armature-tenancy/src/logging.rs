//! Operational Logging
//!
//! Migration and lock lifecycle events are emitted through `tracing` under the
//! `armature_tenancy` target, but only when debug logging is switched on.
//! Otherwise every event is discarded before it reaches a subscriber.
//!
//! # Environment Variables
//!
//! - `GMT_DEBUG=1` (or `true`) - Enable lifecycle logging
//!
//! ```rust,ignore
//! // Install a stderr subscriber when GMT_DEBUG is set
//! armature_tenancy::logging::init();
//! ```

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};

/// Environment variable toggling lifecycle logging.
pub const DEBUG_ENV: &str = "GMT_DEBUG";

/// Tracing target used for every event.
pub const TARGET: &str = "armature_tenancy";

static ENABLED: Lazy<AtomicBool> = Lazy::new(|| AtomicBool::new(enabled_from_env()));

fn enabled_from_env() -> bool {
    debug_flag(std::env::var(DEBUG_ENV).ok().as_deref())
}

fn debug_flag(value: Option<&str>) -> bool {
    value.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Whether lifecycle logging is enabled.
#[inline]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Enable or disable lifecycle logging at runtime.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::SeqCst);
}

/// Install a `tracing-subscriber` fmt subscriber if logging is enabled.
///
/// `RUST_LOG` is honored; without it this crate logs at debug level. Does
/// nothing if another global subscriber is already installed.
pub fn init() {
    if !is_enabled() {
        return;
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("{TARGET}=debug")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

macro_rules! debug {
    ($($arg:tt)+) => {
        if $crate::logging::is_enabled() {
            ::tracing::debug!(target: "armature_tenancy", $($arg)+);
        }
    };
}

macro_rules! info {
    ($($arg:tt)+) => {
        if $crate::logging::is_enabled() {
            ::tracing::info!(target: "armature_tenancy", $($arg)+);
        }
    };
}

macro_rules! log_warn {
    ($($arg:tt)+) => {
        if $crate::logging::is_enabled() {
            ::tracing::warn!(target: "armature_tenancy", $($arg)+);
        }
    };
}

pub(crate) use debug;
pub(crate) use info;
pub(crate) use log_warn;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle() {
        let original = is_enabled();

        set_enabled(true);
        assert!(is_enabled());

        set_enabled(false);
        assert!(!is_enabled());

        set_enabled(original);
    }

    #[test]
    fn test_debug_flag_values() {
        assert!(debug_flag(Some("1")));
        assert!(debug_flag(Some("true")));
        assert!(debug_flag(Some("TRUE")));
        assert!(!debug_flag(Some("0")));
        assert!(!debug_flag(Some("yes")));
        assert!(!debug_flag(Some("")));
        assert!(!debug_flag(None));
    }

    #[test]
    fn test_macros_compile() {
        let tenant = "acme";
        debug!(tenant, "debug message");
        info!(tenant = %tenant, attempt = 1, "info message");
        log_warn!("warn message {}", tenant);
    }
}
