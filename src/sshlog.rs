//! Logging goes through the `log` facade, applications install a logger.
//! Packet contents are only logged at trace level.

#[cfg(test)]
use simplelog::{LevelFilter, TestLogger};

/// Captures log output per test. `SSH_TEST_LOG` sets the level, default trace.
#[cfg(test)]
pub fn init_test_log() {
    let level = std::env::var("SSH_TEST_LOG")
        .ok()
        .and_then(|l| l.parse().ok())
        .unwrap_or(LevelFilter::Trace);
    let conf = simplelog::ConfigBuilder::new()
        .add_filter_ignore_str("flate2")
        .set_time_level(LevelFilter::Off)
        .build();
    let _ = TestLogger::init(level, conf);
}
