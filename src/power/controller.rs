//! Power Controller
//!
//! Single owner of the power rail. The button path and every connection
//! funnel their transitions through here.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::hook::PowerHook;
use super::types::PowerState;
use crate::error::Result;
use crate::gpio::GpioBackend;

/// Power rail controller
///
/// `set_power` holds an async mutex across drive-pin, run-hook and
/// update-cache, so concurrent triggers are applied one at a time in lock
/// order and the hook sequence always matches the rail. `get_power` reads an
/// atomic snapshot that is only written at the end of a transition.
pub struct PowerController {
    gpio: Arc<dyn GpioBackend>,
    pin: u32,
    hook: Arc<dyn PowerHook>,
    /// Cached state; the lock is the serialization point
    state: Mutex<bool>,
    snapshot: AtomicBool,
    transitions: AtomicU64,
}

impl PowerController {
    /// Create a controller for `pin`, seeded from the rail's current level
    ///
    /// The pin must already be configured as an output.
    pub fn new(gpio: Arc<dyn GpioBackend>, pin: u32, hook: Arc<dyn PowerHook>) -> Result<Self> {
        let power_on = gpio.read(pin)?;
        info!(
            "Power controller on GPIO{} ({}), rail is {}",
            pin,
            gpio.name(),
            PowerState::from(power_on)
        );

        Ok(Self {
            gpio,
            pin,
            hook,
            state: Mutex::new(power_on),
            snapshot: AtomicBool::new(power_on),
            transitions: AtomicU64::new(0),
        })
    }

    /// Rail pin
    pub fn pin(&self) -> u32 {
        self.pin
    }

    /// Switch the rail on or off
    ///
    /// The hook runs on every call, also when the rail already had the
    /// requested level. A GPIO failure aborts before the hook and leaves the
    /// cached state untouched.
    pub async fn set_power(&self, on: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        self.apply(&mut state, on).await
    }

    /// Invert the cached state; returns the new state
    pub async fn toggle(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        let target = !*state;
        self.apply(&mut state, target).await?;
        Ok(target)
    }

    /// Cached state, without touching hardware
    pub fn get_power(&self) -> bool {
        self.snapshot.load(Ordering::Acquire)
    }

    /// Number of transitions applied since start
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Acquire)
    }

    async fn apply(&self, state: &mut bool, on: bool) -> Result<()> {
        let target = PowerState::from(on);
        self.gpio.write(self.pin, on)?;
        info!("Power {}", target);

        self.hook.run(target).await;

        *state = on;
        self.snapshot.store(on, Ordering::Release);
        let count = self.transitions.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Power transition #{} applied", count);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::gpio::{Direction, SimulatedBackend};
    use crate::power::hook::ScriptHook;
    use crate::power::types::HookConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    pub const RAIL: u32 = 3;

    /// Hook that remembers every transition it saw
    #[derive(Default)]
    pub struct RecordingHook {
        pub calls: SyncMutex<Vec<PowerState>>,
    }

    impl RecordingHook {
        pub fn calls(&self) -> Vec<PowerState> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl PowerHook for RecordingHook {
        async fn run(&self, state: PowerState) {
            // Widen the window for interleavings
            tokio::task::yield_now().await;
            self.calls.lock().push(state);
        }
    }

    pub fn rig() -> (Arc<SimulatedBackend>, Arc<RecordingHook>, Arc<PowerController>) {
        let gpio = Arc::new(SimulatedBackend::new());
        gpio.configure(RAIL, Direction::Output).unwrap();
        let hook = Arc::new(RecordingHook::default());
        let controller = PowerController::new(gpio.clone(), RAIL, hook.clone()).unwrap();
        (gpio, hook, Arc::new(controller))
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (gpio, hook, power) = rig();
        assert!(!power.get_power());

        power.set_power(true).await.unwrap();
        assert!(power.get_power());
        assert!(gpio.read(RAIL).unwrap());

        power.set_power(false).await.unwrap();
        assert!(!power.get_power());
        assert!(!gpio.read(RAIL).unwrap());

        assert_eq!(hook.calls(), vec![PowerState::On, PowerState::Off]);
    }

    #[tokio::test]
    async fn test_repeated_set_runs_hook_each_time() {
        let (gpio, hook, power) = rig();
        power.set_power(true).await.unwrap();
        power.set_power(true).await.unwrap();

        assert!(gpio.read(RAIL).unwrap());
        assert_eq!(gpio.write_count(), 2);
        assert_eq!(hook.calls(), vec![PowerState::On, PowerState::On]);
        assert_eq!(power.transitions(), 2);
    }

    #[tokio::test]
    async fn test_initial_state_follows_rail() {
        let gpio = Arc::new(SimulatedBackend::new());
        gpio.configure(RAIL, Direction::Output).unwrap();
        gpio.set(RAIL).unwrap();
        let power = PowerController::new(gpio, RAIL, Arc::new(RecordingHook::default())).unwrap();
        assert!(power.get_power());
        assert_eq!(power.pin(), RAIL);
    }

    #[tokio::test]
    async fn test_toggle() {
        let (_gpio, hook, power) = rig();
        assert!(power.toggle().await.unwrap());
        assert!(!power.toggle().await.unwrap());
        assert_eq!(hook.calls(), vec![PowerState::On, PowerState::Off]);
    }

    #[tokio::test]
    async fn test_gpio_failure_skips_hook_and_keeps_state() {
        let (gpio, hook, power) = rig();
        gpio.release().unwrap();

        let err = power.set_power(true).await.unwrap_err();
        assert!(matches!(err, AppError::Gpio(_)));
        assert!(!power.get_power());
        assert!(hook.calls().is_empty());
        assert_eq!(power.transitions(), 0);
    }

    #[tokio::test]
    async fn test_hook_failure_does_not_roll_back() {
        let gpio = Arc::new(SimulatedBackend::new());
        gpio.configure(RAIL, Direction::Output).unwrap();
        let hook = Arc::new(ScriptHook::new(&HookConfig {
            power_up: "/nonexistent/power-up".into(),
            power_down: "/nonexistent/power-down".into(),
        }));
        let power = PowerController::new(gpio.clone(), RAIL, hook).unwrap();

        power.set_power(true).await.unwrap();
        assert!(power.get_power());
        assert!(gpio.read(RAIL).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_toggles_never_lose_a_transition() {
        let (gpio, hook, power) = rig();

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let power = power.clone();
                tokio::spawn(async move { power.toggle().await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        // Even number of toggles from OFF ends OFF
        assert!(!power.get_power());
        assert_eq!(gpio.read(RAIL).unwrap(), power.get_power());
        assert_eq!(power.transitions(), 64);

        // Transitions strictly alternate: none duplicated, none lost
        let calls = hook.calls();
        assert_eq!(calls.len(), 64);
        for (i, state) in calls.iter().enumerate() {
            assert_eq!(*state, PowerState::from(i % 2 == 0));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_settle_consistently() {
        let (gpio, hook, power) = rig();

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let power = power.clone();
                tokio::spawn(async move { power.set_power(i % 3 == 0).await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let calls = hook.calls();
        assert_eq!(calls.len(), 50);
        let last = *calls.last().unwrap();
        assert_eq!(power.get_power(), last.is_on());
        assert_eq!(gpio.read(RAIL).unwrap(), last.is_on());
    }
}
