//! Pushbutton handling
//!
//! A blocking watcher thread waits on the button's [`EdgeSource`] and forwards
//! timestamped edges to the event loop, where a [`Debouncer`] decides which of
//! them toggle the power rail.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error_throttled;
use crate::gpio::{EdgeEvent, EdgeSource};
use crate::power::PowerController;
use crate::utils::LogThrottler;

/// Minimum time between accepted presses
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_micros(2_000_000);

/// Longest a single wait blocks before the stop flag is checked again
const WAIT_SLICE: Duration = Duration::from_millis(250);

/// Pause after a failed wait so a broken source cannot spin
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Sliding-window debouncer
///
/// An edge is accepted when at least `min_interval` has passed since the
/// previous edge. The reference point moves on every edge, accepted or not,
/// so a train of bounces keeps extending the quiet period.
#[derive(Debug, Clone)]
pub struct Debouncer {
    min_interval: Duration,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Register an edge seen at `now`; returns whether it counts as a press
    pub fn accept(&mut self, now: Instant) -> bool {
        let accepted = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        };
        self.last = Some(now);
        accepted
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

/// Turns debounced button edges into power toggles
pub struct ButtonHandler {
    debouncer: Debouncer,
    power: Arc<PowerController>,
}

impl ButtonHandler {
    pub fn new(debouncer: Debouncer, power: Arc<PowerController>) -> Self {
        Self { debouncer, power }
    }

    /// Handle one edge; returns the new power state if the rail was toggled
    pub async fn on_edge(&mut self, event: EdgeEvent) -> Option<bool> {
        if !self.debouncer.accept(event.at) {
            debug!("Ignoring bounce on GPIO{}", event.pin);
            return None;
        }

        match self.power.toggle().await {
            Ok(on) => {
                let state = if on { "on" } else { "off" };
                info!("Button press on GPIO{} switched power {}", event.pin, state);
                Some(on)
            }
            Err(e) => {
                error!("Button press on GPIO{} could not toggle power: {}", event.pin, e);
                None
            }
        }
    }
}

/// Background thread that waits on the button's edge source
pub struct ButtonWatcher {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ButtonWatcher {
    /// Start watching; edges are delivered on the returned receiver
    pub fn spawn(source: Box<dyn EdgeSource>) -> (Self, mpsc::Receiver<EdgeEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let stop_flag = Arc::new(AtomicBool::new(false));

        let stop = stop_flag.clone();
        let handle = tokio::task::spawn_blocking(move || {
            watch_loop(source, tx, stop);
        });

        (
            Self {
                stop_flag,
                handle: Some(handle),
            },
            rx,
        )
    }

    /// Stop the watcher and wait for its thread to finish
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        debug!("Button watcher stopped");
    }
}

impl Drop for ButtonWatcher {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

fn watch_loop(mut source: Box<dyn EdgeSource>, tx: mpsc::Sender<EdgeEvent>, stop: Arc<AtomicBool>) {
    let throttler = LogThrottler::with_secs(30);

    while !stop.load(Ordering::SeqCst) {
        match source.wait(WAIT_SLICE) {
            Ok(Some(event)) => {
                throttler.clear("button_wait");
                if tx.blocking_send(event).is_err() {
                    debug!("Button event receiver closed");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                error_throttled!(throttler, "button_wait", "Button wait failed: {}", e);
                std::thread::sleep(ERROR_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{Edge, GpioBackend, SimulatedBackend};
    use crate::power::{rig, PowerState};

    const I: Duration = DEFAULT_MIN_INTERVAL;

    fn edge(at: Instant) -> EdgeEvent {
        EdgeEvent { pin: 2, at }
    }

    #[test]
    fn test_first_edge_accepted() {
        let mut debouncer = Debouncer::default();
        assert!(debouncer.accept(Instant::now()));
        assert_eq!(debouncer.min_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_bounce_within_interval_rejected() {
        let mut debouncer = Debouncer::default();
        let t0 = Instant::now();
        assert!(debouncer.accept(t0));
        assert!(!debouncer.accept(t0 + I / 2));
    }

    #[test]
    fn test_window_slides_from_most_recent_edge() {
        let mut debouncer = Debouncer::default();
        let t0 = Instant::now();
        let third = t0 + I * 3 / 2 - Duration::from_micros(1);
        let accepted: Vec<bool> = [t0, t0 + I / 2, third]
            .iter()
            .map(|t| debouncer.accept(*t))
            .collect();
        // The third edge is well past I from the first, but not from the bounce
        assert_eq!(accepted, vec![true, false, false]);
    }

    #[test]
    fn test_quiet_period_after_bounce_accepts() {
        let mut debouncer = Debouncer::default();
        let t0 = Instant::now();
        let accepted: Vec<bool> = [t0, t0 + I / 2, t0 + I * 8 / 5]
            .iter()
            .map(|t| debouncer.accept(*t))
            .collect();
        assert_eq!(accepted, vec![true, false, true]);
    }

    #[test]
    fn test_edge_exactly_interval_after_bounce_accepted() {
        let mut debouncer = Debouncer::default();
        let t0 = Instant::now();
        let accepted: Vec<bool> = [t0, t0 + I / 2, t0 + I * 3 / 2]
            .iter()
            .map(|t| debouncer.accept(*t))
            .collect();
        assert_eq!(accepted, vec![true, false, true]);
    }

    #[test]
    fn test_limit_is_inclusive() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(debouncer.accept(t0));
        assert!(debouncer.accept(t0 + Duration::from_millis(100)));
        assert!(!debouncer.accept(t0 + Duration::from_millis(199)));
    }

    #[tokio::test]
    async fn test_handler_toggles_once_per_press() {
        let (_gpio, hook, power) = rig();
        let mut handler = ButtonHandler::new(Debouncer::default(), power.clone());
        let t0 = Instant::now();

        assert_eq!(handler.on_edge(edge(t0)).await, Some(true));
        assert_eq!(handler.on_edge(edge(t0 + I / 10)).await, None);
        assert_eq!(handler.on_edge(edge(t0 + I / 5)).await, None);
        assert!(power.get_power());

        assert_eq!(handler.on_edge(edge(t0 + I * 3)).await, Some(false));
        assert!(!power.get_power());
        assert_eq!(hook.calls(), vec![PowerState::On, PowerState::Off]);
    }

    #[tokio::test]
    async fn test_watcher_forwards_edges() {
        let gpio = SimulatedBackend::new();
        let source = gpio.subscribe_edge(2, Edge::Falling).unwrap();
        let (watcher, mut rx) = ButtonWatcher::spawn(source);

        assert_eq!(gpio.inject_edge(2), 1);
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.pin, 2);

        watcher.stop().await;
    }
}
