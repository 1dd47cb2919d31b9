//! pow-mon - GPIO power-rail daemon
//!
//! Switches a power rail through a GPIO output, toggles it from a debounced
//! pushbutton, and accepts READ/WRITE requests from remote peers over a
//! fixed-size binary TCP protocol.

pub mod button;
pub mod config;
pub mod error;
pub mod gpio;
pub mod power;
pub mod protocol;
pub mod server;
pub mod utils;

pub use error::{AppError, Result};
