use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::gpio::{check_pin, GpioConfig};
use crate::power::HookConfig;
use crate::protocol::PinAssignment;
use crate::server::ServerConfig;

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// TCP port for the command protocol
    pub port: u16,
    /// Address to listen on
    pub bind: IpAddr,
    /// GPIO backend settings
    pub gpio: GpioConfig,
    /// Power transition scripts
    pub hooks: HookConfig,
    /// Pin roles
    pub pins: PinAssignment,
    /// Minimum time between accepted button presses, in milliseconds
    pub debounce_ms: u64,
    /// Connection handling
    pub server: ServerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: 8888,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            gpio: GpioConfig::default(),
            hooks: HookConfig::default(),
            pins: PinAssignment::default(),
            debounce_ms: 2000,
            server: ServerConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(AppError::Config("port must be non-zero".to_string()));
        }

        let PinAssignment { power, led, button } = self.pins;
        for pin in [power, led, button] {
            check_pin(pin).map_err(|_| AppError::Config(format!("GPIO{} is out of range", pin)))?;
        }
        if power == led || power == button || led == button {
            return Err(AppError::Config(format!(
                "power, LED and button pins must differ (got {}, {}, {})",
                power, led, button
            )));
        }
        Ok(())
    }
}
