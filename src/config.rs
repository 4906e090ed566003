//! Tunables for probing and polling a device.

use std::time::Duration;

use crate::scsi::response::STANDARD_INQUIRY_LEN;

#[derive(Clone, Debug)]
pub struct Config {
    /// Start watching for media as soon as the device is started.
    pub polling_enabled: bool,
    pub poll_interval: Duration,
    /// Attempts per probe step before giving up on it.
    pub probe_attempts: u32,
    /// Pause between probe attempts.
    pub retry_delay: Duration,
    /// INQUIRY allocation length. `None` asks for the standard 36 bytes.
    pub inquiry_length: Option<u8>,
    /// Read the caching mode page of fixed disks and store it back as saved values.
    pub check_write_cache: bool,
    /// Tasks the transport may hold at once.
    pub max_in_flight: usize,
    pub control_timeout: Duration,
    /// START STOP UNIT, MODE SELECT, SYNCHRONIZE CACHE and medium locking.
    pub long_control_timeout: Duration,
    pub read_write_timeout: Duration,
}

impl Config {
    pub fn inquiry_length(&self) -> u8 {
        self.inquiry_length.unwrap_or(STANDARD_INQUIRY_LEN)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            polling_enabled: true,
            poll_interval: Duration::from_secs(1),
            probe_attempts: 8,
            retry_delay: Duration::from_secs(1),
            inquiry_length: None,
            check_write_cache: true,
            max_in_flight: 1,
            control_timeout: Duration::from_secs(10),
            long_control_timeout: Duration::from_secs(30),
            read_write_timeout: Duration::from_secs(30),
        }
    }
}
