use std::{env, path::PathBuf};

#[must_use]
pub fn slow_test_env() -> bool {
    env::var("SLOW_TEST_ENV").is_ok_and(|s| s == "true")
}

#[must_use]
pub fn fleetsim_log_dir() -> Option<PathBuf> {
    env::var("FLEETSIM_LOG_DIR").ok().map(PathBuf::from)
}

#[must_use]
pub fn fleetsim_log_level() -> Option<String> {
    env::var("FLEETSIM_LOG_LEVEL").ok()
}

#[must_use]
pub fn fleetsim_keep_logs() -> bool {
    env::var("FLEETSIM_KEEP_LOGS").is_ok()
}

#[must_use]
pub fn fleetsim_seed() -> Option<u64> {
    env::var("FLEETSIM_SEED")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
}

#[must_use]
pub fn fleetsim_report_dir() -> Option<PathBuf> {
    env::var("FLEETSIM_REPORT_DIR").ok().map(PathBuf::from)
}
