//! Logging setup test.
//!
//! Lives in its own test binary since a process can install only one logger.

use taskloom::logging::init_logging;
use tempfile::TempDir;

#[test]
fn test_init_logging_writes_to_file() {
    let temp = TempDir::new().unwrap();
    let log_dir = temp.path().join("logs");

    let log_file = init_logging(&log_dir).unwrap();
    assert_eq!(log_file, log_dir.join("taskloom.log"));
    assert!(log_file.exists());

    // A second logger cannot be installed
    assert!(init_logging(&log_dir).is_err());
}
