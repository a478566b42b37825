//! Configuration file.

use serde::Deserialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use usb_bridge_host::{desc::FilterRule, Class, ClassFilter, Config};

/// Interface class of the bridge protocol.
pub const BRIDGE_CLASS: Class = Class::vendor_specific(0x42, 0x01);

/// Contents of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Root of the usbfs device hierarchy.
    pub dev_root: Option<PathBuf>,
    /// Mount point of sysfs.
    pub sysfs_root: Option<PathBuf>,
    /// Scan interval in milliseconds.
    pub scan_interval_ms: Option<u64>,
    /// Write timeout in milliseconds.
    pub write_timeout_ms: Option<u64>,
    /// Interface match rules.
    #[serde(default, rename = "interface")]
    pub interfaces: Vec<InterfaceRule>,
}

/// Interface match rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceRule {
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub vendor: Option<u16>,
    pub product: Option<u16>,
}

impl Settings {
    /// Loads settings from a TOML file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses settings in TOML format.
    pub fn parse(text: &str) -> io::Result<Self> {
        toml::from_str(text).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Library configuration.
    pub fn config(&self) -> Config {
        let mut config = Config::new();
        if let Some(dev_root) = &self.dev_root {
            config = config.with_dev_root(dev_root);
        }
        if let Some(sysfs_root) = &self.sysfs_root {
            config = config.with_sysfs_root(sysfs_root);
        }
        if let Some(ms) = self.scan_interval_ms {
            config = config.with_scan_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = self.write_timeout_ms {
            config = config.with_write_timeout(Duration::from_millis(ms));
        }
        config
    }

    /// Interface filter.
    ///
    /// Matches the bridge interface class if no rules are configured.
    pub fn filter(&self) -> ClassFilter {
        if self.interfaces.is_empty() {
            return ClassFilter::new().with_class(BRIDGE_CLASS);
        }

        self.interfaces.iter().fold(ClassFilter::new(), |filter, rule| {
            filter.with_rule(FilterRule {
                class: Class::new(rule.class, rule.sub_class, rule.protocol),
                vendor: rule.vendor,
                product: rule.product,
            })
        })
    }
}
