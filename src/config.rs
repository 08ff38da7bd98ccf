//! Runtime configuration carried by each emulated process.

use log::LevelFilter;

#[derive(Clone, Debug)]
pub struct Config {
    /// Verbosity of the runtime's own logging.
    pub log_lvl: LevelFilter,
    /// When false, read/write/poll-family handlers probe the host fd and
    /// yield the thread quantum instead of blocking the whole group.
    pub thread_blocking_io: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            log_lvl: LevelFilter::Info,
            thread_blocking_io: false,
        }
    }
}

impl Config {
    pub fn with_log_lvl(mut self, lvl: LevelFilter) -> Config {
        self.log_lvl = lvl;
        self
    }

    pub fn with_thread_blocking_io(mut self, blocking: bool) -> Config {
        self.thread_blocking_io = blocking;
        self
    }
}
