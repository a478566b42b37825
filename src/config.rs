//! Runtime configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Configuration of device discovery and transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// Root of the usbfs device hierarchy.
    pub dev_root: PathBuf,
    /// Mount point of sysfs.
    pub sysfs_root: PathBuf,
    /// Interval between two device scans.
    pub scan_interval: Duration,
    /// Time to wait for a bulk write to complete.
    pub write_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dev_root: PathBuf::from(Self::DEV_ROOT),
            sysfs_root: PathBuf::from(Self::SYSFS_ROOT),
            scan_interval: Self::SCAN_INTERVAL,
            write_timeout: Self::WRITE_TIMEOUT,
        }
    }
}

impl Config {
    /// Default root of the usbfs device hierarchy.
    pub const DEV_ROOT: &'static str = "/dev/bus/usb";
    /// Default mount point of sysfs.
    pub const SYSFS_ROOT: &'static str = "/sys";
    /// Default interval between two device scans.
    pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);
    /// Default time to wait for a bulk write to complete.
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the root of the usbfs device hierarchy.
    #[must_use]
    pub fn with_dev_root(mut self, dev_root: impl AsRef<Path>) -> Self {
        self.dev_root = dev_root.as_ref().to_path_buf();
        self
    }

    /// Sets the mount point of sysfs.
    #[must_use]
    pub fn with_sysfs_root(mut self, sysfs_root: impl AsRef<Path>) -> Self {
        self.sysfs_root = sysfs_root.as_ref().to_path_buf();
        self
    }

    /// Sets the interval between two device scans.
    #[must_use]
    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    /// Sets the time to wait for a bulk write to complete.
    #[must_use]
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Path of the serial number attribute in sysfs of the USB device with the specified
    /// sysfs name.
    pub(crate) fn serial_path(&self, sysfs_name: &str) -> PathBuf {
        self.sysfs_root.join("bus/usb/devices").join(sysfs_name).join("serial")
    }

    /// Path of the sysfs link of the character device with the specified numbers.
    pub(crate) fn char_dev_path(&self, major: u32, minor: u32) -> PathBuf {
        self.sysfs_root.join("dev/char").join(format!("{major}:{minor}"))
    }
}
