//! In-memory GPIO backend
//!
//! Lets the daemon run on a host without GPIO hardware. Button presses are
//! injected with [`SimulatedBackend::inject_edge`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::types::{Direction, Edge, EdgeEvent, PIN_MAX};
use super::{check_pin, EdgeSource, GpioBackend};
use crate::error::{AppError, Result};

const PIN_COUNT: usize = PIN_MAX as usize + 1;

struct Pins {
    levels: [bool; PIN_COUNT],
    directions: [Option<Direction>; PIN_COUNT],
}

/// Simulated GPIO backend
pub struct SimulatedBackend {
    pins: Mutex<Pins>,
    subscribers: Mutex<Vec<(u32, Sender<EdgeEvent>)>>,
    /// Number of output writes (set/clear) performed
    writes: AtomicUsize,
    released: AtomicBool,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            pins: Mutex::new(Pins {
                levels: [false; PIN_COUNT],
                directions: [None; PIN_COUNT],
            }),
            subscribers: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    /// Force the level seen on a pin, as if driven externally
    pub fn set_input_level(&self, pin: u32, level: bool) -> Result<()> {
        check_pin(pin)?;
        self.pins.lock().levels[pin as usize] = level;
        Ok(())
    }

    /// Deliver an edge to every subscriber of `pin`
    ///
    /// Returns the number of sources that received it.
    pub fn inject_edge(&self, pin: u32) -> usize {
        let event = EdgeEvent {
            pin,
            at: Instant::now(),
        };
        let mut delivered = 0;
        // Sources that went away are pruned on their first missed delivery
        self.subscribers.lock().retain(|(p, tx)| {
            if *p != pin {
                return true;
            }
            let alive = tx.send(event).is_ok();
            if alive {
                delivered += 1;
            }
            alive
        });
        delivered
    }

    /// Direction a pin was last configured with
    #[cfg(test)]
    pub(crate) fn direction(&self, pin: u32) -> Option<Direction> {
        self.pins
            .lock()
            .directions
            .get(pin as usize)
            .copied()
            .flatten()
    }

    /// Total number of set/clear operations
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn drive(&self, pin: u32, level: bool) -> Result<()> {
        check_pin(pin)?;
        if self.is_released() {
            return Err(AppError::Gpio("simulated backend released".to_string()));
        }
        self.pins.lock().levels[pin as usize] = level;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn configure(&self, pin: u32, direction: Direction) -> Result<()> {
        check_pin(pin)?;
        self.pins.lock().directions[pin as usize] = Some(direction);
        Ok(())
    }

    fn read(&self, pin: u32) -> Result<bool> {
        check_pin(pin)?;
        Ok(self.pins.lock().levels[pin as usize])
    }

    fn set(&self, pin: u32) -> Result<()> {
        self.drive(pin, true)
    }

    fn clear(&self, pin: u32) -> Result<()> {
        self.drive(pin, false)
    }

    fn subscribe_edge(&self, pin: u32, edge: Edge) -> Result<Box<dyn EdgeSource>> {
        check_pin(pin)?;
        self.configure(pin, Direction::Input)?;
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push((pin, tx));
        debug!("Simulated {:?} edge armed on pin {}", edge, pin);
        Ok(Box::new(SimulatedEdgeSource { rx }))
    }

    fn release(&self) -> Result<()> {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.subscribers.lock().clear();
            debug!("Simulated backend released");
        }
        Ok(())
    }
}

struct SimulatedEdgeSource {
    rx: Receiver<EdgeEvent>,
}

impl EdgeSource for SimulatedEdgeSource {
    fn wait(&mut self, timeout: Duration) -> Result<Option<EdgeEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(AppError::Gpio("edge source closed".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_and_writes() {
        let backend = SimulatedBackend::new();
        backend.configure(3, Direction::Output).unwrap();
        assert_eq!(backend.direction(3), Some(Direction::Output));
        backend.set(3).unwrap();
        assert!(backend.read(3).unwrap());
        backend.clear(3).unwrap();
        assert!(!backend.read(3).unwrap());
        assert_eq!(backend.write_count(), 2);
    }

    #[test]
    fn test_invalid_pin() {
        let backend = SimulatedBackend::new();
        assert!(matches!(backend.read(54), Err(AppError::InvalidPin(54))));
        assert!(matches!(backend.set(99), Err(AppError::InvalidPin(99))));
        assert_eq!(backend.write_count(), 0);
    }

    #[test]
    fn test_edge_delivery() {
        let backend = SimulatedBackend::new();
        let mut source = backend.subscribe_edge(2, Edge::Falling).unwrap();
        assert_eq!(backend.direction(2), Some(Direction::Input));

        assert!(source.wait(Duration::from_millis(5)).unwrap().is_none());
        assert_eq!(backend.inject_edge(2), 1);
        assert_eq!(backend.inject_edge(7), 0);

        let event = source.wait(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(event.pin, 2);
        assert!(source.wait(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn test_release_closes_sources() {
        let backend = SimulatedBackend::new();
        let mut source = backend.subscribe_edge(2, Edge::Falling).unwrap();
        backend.release().unwrap();
        backend.release().unwrap();
        assert!(backend.is_released());
        assert!(source.wait(Duration::from_millis(5)).is_err());
        assert!(backend.set(3).is_err());
    }
}
