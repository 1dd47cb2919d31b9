//! GPIO character device backend
//!
//! Drives lines through `/dev/gpiochipX` line handles. Edge detection uses a
//! line event handle whose descriptor becomes readable on every edge.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gpio_cdev::{Chip, EventRequestFlags, LineEventHandle, LineHandle, LineRequestFlags};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::types::{Direction, Edge, EdgeEvent};
use super::{check_pin, poll_timeout, EdgeSource, GpioBackend};
use crate::error::{AppError, Result};

/// Consumer label shown by `gpioinfo` for output and input lines
const CONSUMER: &str = "pow-mon";
/// Consumer label for the interrupt line
const CONSUMER_EVENTS: &str = "pow-mon-button";

type SharedEventHandle = Arc<Mutex<LineEventHandle>>;

/// Character device GPIO backend
pub struct CdevBackend {
    path: String,
    num_lines: u32,
    chip: Mutex<Option<Chip>>,
    lines: Mutex<HashMap<u32, LineHandle>>,
    events: Mutex<HashMap<u32, SharedEventHandle>>,
}

impl CdevBackend {
    /// Open a GPIO chip such as `/dev/gpiochip0`
    pub fn open(path: &str) -> Result<Self> {
        info!("Opening GPIO chip {}", path);
        let chip = Chip::new(path)
            .map_err(|e| AppError::Gpio(format!("GPIO chip {} open failed: {}", path, e)))?;
        let num_lines = chip.num_lines();
        debug!("{} ({}) exposes {} lines", chip.name(), chip.label(), num_lines);

        Ok(Self {
            path: path.to_string(),
            num_lines,
            chip: Mutex::new(Some(chip)),
            lines: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
        })
    }

    fn check_line(&self, pin: u32) -> Result<()> {
        check_pin(pin)?;
        if pin >= self.num_lines {
            return Err(AppError::InvalidPin(pin as i32));
        }
        Ok(())
    }

    fn with_chip<T>(&self, f: impl FnOnce(&mut Chip) -> Result<T>) -> Result<T> {
        let mut guard = self.chip.lock();
        let chip = guard
            .as_mut()
            .ok_or_else(|| AppError::Gpio(format!("GPIO chip {} released", self.path)))?;
        f(chip)
    }

    fn request(&self, pin: u32, flags: LineRequestFlags, value: u8) -> Result<LineHandle> {
        self.with_chip(|chip| {
            let line = chip
                .get_line(pin)
                .map_err(|e| AppError::Gpio(format!("GPIO line {} failed: {}", pin, e)))?;
            line.request(flags, value, CONSUMER)
                .map_err(|e| AppError::Gpio(format!("GPIO line {} request failed: {}", pin, e)))
        })
    }
}

impl GpioBackend for CdevBackend {
    fn name(&self) -> &'static str {
        "cdev"
    }

    fn configure(&self, pin: u32, direction: Direction) -> Result<()> {
        self.check_line(pin)?;
        let mut lines = self.lines.lock();

        // Sample the level before re-requesting so outputs come up unchanged
        let level = match lines.remove(&pin) {
            Some(handle) => handle.get_value()?,
            None => self.request(pin, line_flags(None), 0)?.get_value()?,
        };

        let handle = match direction {
            Direction::Input => self.request(pin, line_flags(Some(direction)), 0)?,
            Direction::Output => self.request(pin, line_flags(Some(direction)), level)?,
        };
        lines.insert(pin, handle);
        debug!("GPIO line {} configured as {:?}", pin, direction);
        Ok(())
    }

    fn read(&self, pin: u32) -> Result<bool> {
        self.check_line(pin)?;
        if let Some(handle) = self.lines.lock().get(&pin) {
            return Ok(handle.get_value()? != 0);
        }
        if let Some(events) = self.events.lock().get(&pin) {
            return Ok(events.lock().get_value()? != 0);
        }
        let handle = self.request(pin, line_flags(None), 0)?;
        Ok(handle.get_value()? != 0)
    }

    fn set(&self, pin: u32) -> Result<()> {
        self.check_line(pin)?;
        let lines = self.lines.lock();
        let handle = lines
            .get(&pin)
            .ok_or_else(|| AppError::Gpio(format!("GPIO line {} not configured", pin)))?;
        handle.set_value(1)?;
        Ok(())
    }

    fn clear(&self, pin: u32) -> Result<()> {
        self.check_line(pin)?;
        let lines = self.lines.lock();
        let handle = lines
            .get(&pin)
            .ok_or_else(|| AppError::Gpio(format!("GPIO line {} not configured", pin)))?;
        handle.set_value(0)?;
        Ok(())
    }

    fn subscribe_edge(&self, pin: u32, edge: Edge) -> Result<Box<dyn EdgeSource>> {
        self.check_line(pin)?;
        // A line can only have one owner
        self.lines.lock().remove(&pin);

        let mut handle = self.with_chip(|chip| {
            let line = chip
                .get_line(pin)
                .map_err(|e| AppError::Gpio(format!("GPIO line {} failed: {}", pin, e)))?;
            line.events(LineRequestFlags::INPUT, event_flags(edge), CONSUMER_EVENTS)
                .map_err(|e| AppError::Gpio(format!("GPIO line {} event request failed: {}", pin, e)))
        })?;

        let fd = handle.as_raw_fd();
        let mut drained = 0;
        while readable(fd, PollTimeout::ZERO)? {
            handle.get_event()?;
            drained += 1;
        }
        if drained > 0 {
            debug!("Drained {} stale events on GPIO line {}", drained, pin);
        }

        let handle = Arc::new(Mutex::new(handle));
        self.events.lock().insert(pin, handle.clone());
        info!("Armed {:?} edge on {} line {}", edge, self.path, pin);

        Ok(Box::new(CdevEdgeSource { pin, fd, handle }))
    }

    fn release(&self) -> Result<()> {
        self.lines.lock().clear();
        self.events.lock().clear();
        if self.chip.lock().take().is_some() {
            debug!("GPIO chip {} released", self.path);
        }
        Ok(())
    }
}

/// Flags for a line request
///
/// `None` asks for neither direction, which leaves the line as it is, so a
/// driven output can be sampled without releasing it.
fn line_flags(direction: Option<Direction>) -> LineRequestFlags {
    match direction {
        None => LineRequestFlags::empty(),
        Some(Direction::Input) => LineRequestFlags::INPUT,
        Some(Direction::Output) => LineRequestFlags::OUTPUT,
    }
}

fn event_flags(edge: Edge) -> EventRequestFlags {
    match edge {
        Edge::Rising => EventRequestFlags::RISING_EDGE,
        Edge::Falling => EventRequestFlags::FALLING_EDGE,
        Edge::Both => EventRequestFlags::BOTH_EDGES,
    }
}

fn readable(fd: RawFd, timeout: PollTimeout) -> Result<bool> {
    // The descriptor is owned by a live LineEventHandle for the whole call
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    if poll(&mut fds, timeout)? == 0 {
        return Ok(false);
    }
    Ok(fds[0]
        .revents()
        .map_or(false, |r| r.contains(PollFlags::POLLIN)))
}

struct CdevEdgeSource {
    pin: u32,
    fd: RawFd,
    handle: SharedEventHandle,
}

impl EdgeSource for CdevEdgeSource {
    fn wait(&mut self, timeout: Duration) -> Result<Option<EdgeEvent>> {
        if !readable(self.fd, poll_timeout(timeout))? {
            return Ok(None);
        }
        let at = Instant::now();
        let event = self.handle.lock().get_event()?;
        debug!("GPIO line {} {:?} at {}ns", self.pin, event.event_type(), event.timestamp());
        Ok(Some(EdgeEvent { pin: self.pin, at }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_chip_fails() {
        let err = CdevBackend::open("/dev/gpiochip-does-not-exist").err().unwrap();
        assert!(matches!(err, AppError::Gpio(_)));
    }

    #[test]
    fn test_event_flags() {
        assert_eq!(event_flags(Edge::Falling).bits(), EventRequestFlags::FALLING_EDGE.bits());
        assert_eq!(event_flags(Edge::Rising).bits(), EventRequestFlags::RISING_EDGE.bits());
        assert_eq!(event_flags(Edge::Both).bits(), EventRequestFlags::BOTH_EDGES.bits());
    }

    #[test]
    fn test_sampling_keeps_line_direction() {
        let sample = line_flags(None);
        assert!(!sample.contains(LineRequestFlags::INPUT));
        assert!(!sample.contains(LineRequestFlags::OUTPUT));
        assert_eq!(sample.bits(), 0);

        assert_eq!(
            line_flags(Some(Direction::Output)).bits(),
            LineRequestFlags::OUTPUT.bits()
        );
        assert_eq!(
            line_flags(Some(Direction::Input)).bits(),
            LineRequestFlags::INPUT.bits()
        );
    }
}
