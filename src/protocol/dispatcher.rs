//! Command dispatcher
//!
//! Executes one decoded request against the power controller or the GPIO
//! backend and fills in the reply. No socket code lives here.

use std::sync::Arc;

use tracing::{debug, warn};

use super::types::{Command, Opcode, PinAssignment, PinPolicy, ERROR_SENTINEL};
use crate::error::{AppError, Result};
use crate::gpio::{pin_from_wire, GpioBackend};
use crate::power::PowerController;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Request dispatcher shared by all connections
pub struct Dispatcher {
    gpio: Arc<dyn GpioBackend>,
    power: Arc<PowerController>,
    pins: PinAssignment,
    policy: PinPolicy,
    throttler: LogThrottler,
}

impl Dispatcher {
    pub fn new(gpio: Arc<dyn GpioBackend>, power: Arc<PowerController>, pins: PinAssignment) -> Self {
        let policy = PinPolicy::for_assignment(&pins);
        debug!(
            "Remote access: readable {:?}, writable {:?}",
            policy.readable.iter().collect::<Vec<_>>(),
            policy.writable.iter().collect::<Vec<_>>()
        );
        Self {
            gpio,
            power,
            pins,
            policy,
            throttler: LogThrottler::default(),
        }
    }

    pub fn policy(&self) -> &PinPolicy {
        &self.policy
    }

    /// Execute `cmd` and return the reply record
    ///
    /// Failures never escape: they become `p3 = -2000` in the reply.
    pub async fn handle(&self, mut cmd: Command) -> Command {
        match self.execute(&cmd).await {
            Ok(value) => cmd.p3 = value,
            Err(e) if e.is_request_error() => {
                warn!("Rejected request {:?}: {}", cmd, e);
                cmd.p3 = ERROR_SENTINEL;
            }
            Err(e) => {
                warn_throttled!(self.throttler, "dispatch_io", "Request {:?} failed: {}", cmd, e);
                cmd.p3 = ERROR_SENTINEL;
            }
        }
        cmd
    }

    async fn execute(&self, cmd: &Command) -> Result<i32> {
        match Opcode::try_from(cmd.cmd)? {
            Opcode::Read => {
                let value = self.read(cmd.p1)?;
                debug!("READ GPIO{} = {}", cmd.p1, value);
                Ok(value)
            }
            Opcode::Write => {
                self.write(cmd.p1, cmd.p2).await?;
                debug!("WRITE GPIO{} <- {}", cmd.p1, cmd.p2);
                Ok(0)
            }
        }
    }

    fn read(&self, raw_pin: i32) -> Result<i32> {
        let pin = pin_from_wire(raw_pin)?;
        if !self.policy.readable.contains(pin) {
            return Err(AppError::InvalidPin(raw_pin));
        }

        let level = if pin == self.pins.power {
            self.power.get_power()
        } else {
            self.gpio.read(pin)?
        };
        Ok(level as i32)
    }

    async fn write(&self, raw_pin: i32, value: i32) -> Result<()> {
        let pin = pin_from_wire(raw_pin)?;
        if !self.policy.writable.contains(pin) {
            return Err(AppError::InvalidPin(raw_pin));
        }

        if pin == self.pins.power {
            self.power.set_power(value != 0).await?;
        } else {
            // LED pin: reserved, accepted without touching hardware
            debug!("WRITE to reserved GPIO{} ignored", pin);
        }
        Ok(())
    }
}
