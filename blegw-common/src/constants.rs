use log::LevelFilter;

pub const ADDR_LEN: usize = 6;

pub const APP_ID: &str = "blegw";

pub const SOCKET_PATH: &str = "/var/run/blegw.sock"; // Needs to be sudo bc /run is root owned
pub const LOG_PATH: &str = "/var/log/blegw.log";

#[cfg(debug_assertions)]
pub const LOG_LEVEL: LevelFilter = LevelFilter::Trace;
#[cfg(not(debug_assertions))]
pub const LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// Upper bound of an IPC frame body, a status snapshot of a large catalog fits well below it
pub const MAX_FRAME_LEN: usize = 1 << 20;

pub mod defaults {
    pub const RETRY_MAX_ATTEMPTS: u32 = 5;
    pub const RETRY_BASE_DELAY_MS: u64 = 1_000;
    pub const RETRY_MAX_DELAY_MS: u64 = 60_000;

    pub const MAX_SERVICE_RETRIES: u32 = 2;

    pub const SCAN_INTERVAL_SECS: u64 = 30;
    pub const SCAN_DURATION_SECS: u64 = 10;
}
