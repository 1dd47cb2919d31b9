//! Power control data types

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Logical state of the power rail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

impl From<bool> for PowerState {
    fn from(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "ON"),
            Self::Off => write!(f, "OFF"),
        }
    }
}

/// External scripts run on power transitions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HookConfig {
    /// Run after the rail has been switched on
    pub power_up: PathBuf,
    /// Run after the rail has been switched off
    pub power_down: PathBuf,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            power_up: PathBuf::from("/etc/pow-mon/power-up"),
            power_down: PathBuf::from("/etc/pow-mon/power-down"),
        }
    }
}
