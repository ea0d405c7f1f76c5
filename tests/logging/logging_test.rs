//! Tests for `src/logging.rs`.

use conduit::logging::{env_filter, LoggingGuard, LOG_FILE_PREFIX};

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn init_production_creates_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("nested").join("logs");
    assert!(!logs_dir.exists());

    // Only one global subscriber can be installed per process, so the
    // result is not asserted; the directory is created either way.
    let _result = conduit::logging::init_production(&logs_dir, "debug");
    assert!(logs_dir.exists(), "logs directory should be created");
}

#[test]
fn env_filter_accepts_bad_levels() {
    // Falls back to `info` instead of failing.
    let filter = env_filter("not a [valid] filter ===");
    assert!(!filter.to_string().is_empty());
}

#[test]
fn log_files_are_prefixed() {
    assert!(LOG_FILE_PREFIX.starts_with("conduit"));
}
