//! Environment overrides live in their own test binary so no other test
//! observes the mutated process environment.

use std::env;

use sedaq::config::ConfigError;
use sedaq::Config;

#[test]
fn environment_overrides_file_values() {
    env::set_var("SEDAQ_CONFIG", "sedaq.toml");
    env::set_var("SEDAQ_PROCESSORS", "3");
    env::set_var("SEDAQ_SLEEP_TIME_MS", "25");
    env::set_var("SEDAQ_FORCE_SHUTDOWN", "yes");
    env::set_var("SEDAQ_MARGIN", "100");

    let cfg = Config::load(None).unwrap();
    assert_eq!(cfg.fixed_pool.processors, 3);
    assert_eq!(cfg.fixed_pool.sleep_time_ms, 25);
    assert!(cfg.fixed_pool.force_shutdown);
    assert_eq!(cfg.elastic_pool.margin, Some(100));
    // untouched keys keep the file's values
    assert_eq!(cfg.elastic_pool.threshold, 1000);
    assert_eq!(cfg.queue.max_size, 10_000);

    env::set_var("SEDAQ_THRESHOLD", "lots");
    assert!(matches!(Config::load(None), Err(ConfigError::Parse(_))));

    env::set_var("SEDAQ_THRESHOLD", "100");
    assert!(matches!(Config::load(None), Err(ConfigError::Invalid(_))));

    for key in [
        "SEDAQ_CONFIG",
        "SEDAQ_PROCESSORS",
        "SEDAQ_SLEEP_TIME_MS",
        "SEDAQ_FORCE_SHUTDOWN",
        "SEDAQ_MARGIN",
        "SEDAQ_THRESHOLD",
    ] {
        env::remove_var(key);
    }
}
