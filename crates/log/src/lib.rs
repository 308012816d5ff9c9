//! Timestamped logging macros shared across the workspace.
//!
//! Lines go to stderr so they never interleave with shell output on stdout.
//! Debug logging is off unless `EMBERD_LOG_DEBUG` is set in the environment.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn debug_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("EMBERD_LOG_DEBUG").is_some())
}

pub fn emit(level: &str, args: std::fmt::Arguments<'_>) {
    let (secs, millis) = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| (elapsed.as_secs(), elapsed.subsec_millis()))
        .unwrap_or((0, 0));
    eprintln!("{secs}.{millis:03} [{level}] {args}");
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::emit("INFO", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::emit("WARN", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::emit("ERROR", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if $crate::debug_enabled() {
            $crate::emit("DEBUG", format_args!($($arg)*));
        }
    };
}
