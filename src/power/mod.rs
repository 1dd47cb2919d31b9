//! Power rail control
//!
//! The [`PowerController`] owns the rail pin and the cached ON/OFF state. Every
//! trigger (pushbutton or remote command) goes through it; nothing else drives
//! the rail pin. After each transition the configured [`PowerHook`] runs, which
//! in the daemon means the external power-up/power-down scripts.

mod controller;
mod hook;
mod types;

pub use controller::PowerController;
pub use hook::{PowerHook, ScriptHook};
pub use types::{HookConfig, PowerState};

#[cfg(test)]
pub(crate) use controller::tests::{rig, RecordingHook, RAIL};
