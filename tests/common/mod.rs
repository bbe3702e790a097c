#![allow(dead_code)]

use ripple::{Connection, StoreConfig};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A store config pointing into a fresh temp dir. Keep the `TempDir`
/// alive for the duration of the test.
pub fn test_config() -> (TempDir, StoreConfig) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::at(dir.path().join("store"));
    (dir, config)
}

/// Pump the connection's event queue until the condition holds.
pub fn pump_until(conn: &Connection, mut done: impl FnMut() -> bool) {
    let deadline = Duration::from_secs(10);
    let start = Instant::now();
    while !done() {
        if start.elapsed() > deadline {
            panic!("condition not reached within {:?}", deadline);
        }
        conn.pump_events(Duration::from_millis(20)).unwrap();
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
