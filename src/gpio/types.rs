//! GPIO data types
//!
//! Configuration and value types shared by every backend.

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Highest GPIO number addressable on the SoC header
pub const PIN_MAX: u32 = 53;

/// Pin direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

/// Edge that arms an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Keyword written to the sysfs `edge` attribute
    pub fn sysfs_keyword(&self) -> &'static str {
        match self {
            Self::Rising => "rising",
            Self::Falling => "falling",
            Self::Both => "both",
        }
    }
}

impl Default for Edge {
    fn default() -> Self {
        Self::Falling
    }
}

/// An edge observed on an input pin
#[derive(Debug, Clone, Copy)]
pub struct EdgeEvent {
    /// Pin the edge was seen on
    pub pin: u32,
    /// Monotonic time the event was picked up
    pub at: Instant,
}

/// Hardware access strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Memory-mapped BCM283x GPIO registers (/dev/mem or /dev/gpiomem)
    Register,
    /// Legacy /sys/class/gpio interface
    Sysfs,
    /// GPIO character device (/dev/gpiochipX)
    Cdev,
    /// In-memory pins, no hardware
    Simulated,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Cdev
    }
}

/// Backend selection plus the device paths each strategy needs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GpioConfig {
    /// Backend type
    pub backend: BackendKind,
    /// Character device for the cdev backend
    pub chip: String,
    /// Memory device for the register backend
    pub mem_device: String,
    /// sysfs GPIO class directory (also used for register backend interrupts)
    pub sysfs_root: PathBuf,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Cdev,
            chip: "/dev/gpiochip0".to_string(),
            mem_device: "/dev/mem".to_string(),
            sysfs_root: PathBuf::from("/sys/class/gpio"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_keywords() {
        assert_eq!(Edge::Falling.sysfs_keyword(), "falling");
        assert_eq!(Edge::Rising.sysfs_keyword(), "rising");
        assert_eq!(Edge::Both.sysfs_keyword(), "both");
        assert_eq!(Edge::default(), Edge::Falling);
    }

    #[test]
    fn test_gpio_config_default() {
        let config = GpioConfig::default();
        assert_eq!(config.backend, BackendKind::Cdev);
        assert_eq!(config.chip, "/dev/gpiochip0");
        assert_eq!(config.sysfs_root, PathBuf::from("/sys/class/gpio"));
    }

    #[test]
    fn test_backend_kind_serde() {
        let json = serde_json::to_string(&BackendKind::Register).unwrap();
        assert_eq!(json, "\"register\"");
        let kind: BackendKind = serde_json::from_str("\"sysfs\"").unwrap();
        assert_eq!(kind, BackendKind::Sysfs);
    }
}
