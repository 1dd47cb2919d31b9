//! Power transition hooks
//!
//! A hook is told about every applied transition. The daemon runs the
//! configured power-up/power-down executables; tests plug in recorders.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::types::{HookConfig, PowerState};

/// Side effect run after the rail has been switched
///
/// Hooks cannot fail the transition: the rail level is already applied when
/// they run, so implementations report their own problems.
#[async_trait]
pub trait PowerHook: Send + Sync {
    async fn run(&self, state: PowerState);
}

/// Runs an external executable per transition and waits for it to exit
pub struct ScriptHook {
    power_up: PathBuf,
    power_down: PathBuf,
}

impl ScriptHook {
    pub fn new(config: &HookConfig) -> Self {
        Self {
            power_up: config.power_up.clone(),
            power_down: config.power_down.clone(),
        }
    }

    fn script(&self, state: PowerState) -> &Path {
        match state {
            PowerState::On => &self.power_up,
            PowerState::Off => &self.power_down,
        }
    }
}

#[async_trait]
impl PowerHook for ScriptHook {
    async fn run(&self, state: PowerState) {
        let script = self.script(state);
        debug!("Running power {} script {}", state, script.display());

        let status = Command::new(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => {
                debug!("Power {} script finished", state);
            }
            Ok(status) => {
                warn!("Power {} script {} exited with {}", state, script.display(), status);
            }
            Err(e) => {
                warn!("Failed to run power {} script {}: {}", state, script.display(), e);
            }
        }
    }
}
