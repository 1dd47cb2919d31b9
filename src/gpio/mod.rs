//! GPIO access layer
//!
//! One capability interface over the ways this board's GPIOs can be driven.
//!
//! # Backends
//!
//! - **Register**: maps the BCM283x GPIO register block and pokes
//!   `GPFSEL`/`GPSET`/`GPCLR`/`GPLEV` directly. Interrupts go through sysfs.
//! - **Sysfs**: per-pin `direction`/`edge`/`value` files under `/sys/class/gpio`
//! - **Cdev**: line handles and line event handles on `/dev/gpiochipX`
//! - **Simulated**: in-memory pins, for development hosts and tests
//!
//! The rest of the daemon only sees [`GpioBackend`] and [`EdgeSource`].

mod cdev;
mod register;
mod simulated;
mod sysfs;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::{AppError, Result};

pub use cdev::CdevBackend;
pub use register::RegisterBackend;
pub use simulated::SimulatedBackend;
pub use sysfs::SysfsBackend;
pub use types::{BackendKind, Direction, Edge, EdgeEvent, GpioConfig, PIN_MAX};

/// GPIO capability interface
///
/// Every method validates the pin number first and fails with
/// [`AppError::InvalidPin`] when it is out of range. Hardware calls are plain
/// syscalls or register accesses, so the interface is synchronous.
pub trait GpioBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Configure a pin as input or output
    fn configure(&self, pin: u32, direction: Direction) -> Result<()>;

    /// Read the current level of a pin
    fn read(&self, pin: u32) -> Result<bool>;

    /// Drive an output pin high
    fn set(&self, pin: u32) -> Result<()>;

    /// Drive an output pin low
    fn clear(&self, pin: u32) -> Result<()>;

    /// Drive an output pin to `level`
    fn write(&self, pin: u32, level: bool) -> Result<()> {
        if level {
            self.set(pin)
        } else {
            self.clear(pin)
        }
    }

    /// Arm edge detection on an input pin
    ///
    /// Anything already latched by arming the interrupt is drained before
    /// returning, so the first event a caller sees is a real edge.
    fn subscribe_edge(&self, pin: u32, edge: Edge) -> Result<Box<dyn EdgeSource>>;

    /// Release every resource held by the backend
    ///
    /// Safe to call more than once. Backends also release on drop.
    fn release(&self) -> Result<()>;
}

/// A waitable source of edge events
pub trait EdgeSource: Send {
    /// Block until an edge arrives or `timeout` expires (`Ok(None)`)
    fn wait(&mut self, timeout: Duration) -> Result<Option<EdgeEvent>>;
}

/// Validate a pin number against the SoC range
pub fn check_pin(pin: u32) -> Result<()> {
    if pin > PIN_MAX {
        return Err(AppError::InvalidPin(pin as i32));
    }
    Ok(())
}

/// Convert a pin number received from the wire
pub fn pin_from_wire(raw: i32) -> Result<u32> {
    let pin = u32::try_from(raw).map_err(|_| AppError::InvalidPin(raw))?;
    check_pin(pin)?;
    Ok(pin)
}

/// Open the backend selected in the configuration
pub fn open_backend(config: &GpioConfig) -> Result<Arc<dyn GpioBackend>> {
    let backend: Arc<dyn GpioBackend> = match config.backend {
        BackendKind::Register => Arc::new(RegisterBackend::open(
            &config.mem_device,
            &config.sysfs_root,
        )?),
        BackendKind::Sysfs => Arc::new(SysfsBackend::new(&config.sysfs_root)),
        BackendKind::Cdev => Arc::new(CdevBackend::open(&config.chip)?),
        BackendKind::Simulated => Arc::new(SimulatedBackend::new()),
    };
    info!("GPIO backend ready: {}", backend.name());
    Ok(backend)
}

/// Poll timeout in milliseconds as nix expects it
pub(crate) fn poll_timeout(timeout: Duration) -> nix::poll::PollTimeout {
    let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
    nix::poll::PollTimeout::from(timeout_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_pin() {
        assert!(check_pin(0).is_ok());
        assert!(check_pin(PIN_MAX).is_ok());
        assert!(matches!(check_pin(54), Err(AppError::InvalidPin(54))));
    }

    #[test]
    fn test_pin_from_wire() {
        assert_eq!(pin_from_wire(3).unwrap(), 3);
        assert!(matches!(pin_from_wire(-1), Err(AppError::InvalidPin(-1))));
        assert!(matches!(pin_from_wire(100), Err(AppError::InvalidPin(100))));
    }

    #[test]
    fn test_open_simulated_backend() {
        let config = GpioConfig {
            backend: BackendKind::Simulated,
            ..Default::default()
        };
        let backend = open_backend(&config).unwrap();
        assert_eq!(backend.name(), "simulated");
    }

    #[test]
    fn test_write_dispatches_to_set_and_clear() {
        let backend = SimulatedBackend::new();
        backend.configure(3, Direction::Output).unwrap();
        backend.write(3, true).unwrap();
        assert!(backend.read(3).unwrap());
        backend.write(3, false).unwrap();
        assert!(!backend.read(3).unwrap());
    }

    #[test]
    fn test_poll_timeout_saturates() {
        let _ = poll_timeout(Duration::from_secs(3600));
        let _ = poll_timeout(Duration::from_millis(10));
    }
}
