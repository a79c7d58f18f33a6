//! Logging bootstrap for applications and tests

pub use log::{debug, error, info, trace, warn};

/// Initialize the logging system from `RUST_LOG`
pub fn init() {
    env_logger::init();
}

/// Initialize logging with a default filter used when `RUST_LOG` is unset.
///
/// Safe to call more than once; later calls are ignored, which keeps test
/// binaries that share a process from panicking.
pub fn init_with_level(level: log::LevelFilter) {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .is_test(cfg!(test))
        .try_init();
}
