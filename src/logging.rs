//! Logger bootstrap.

use std::sync::Once;

use crate::config::Config;

static INIT: Once = Once::new();

/// Initializes the global logger from a process configuration. Later calls
/// only raise the max level; env_logger can only be installed once.
pub fn init(config: &Config) {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        builder.filter_level(config.log_lvl);
        builder.format_timestamp(None);
        let _ = builder.try_init();
    });
    log::set_max_level(config.log_lvl.max(log::max_level()));
}
