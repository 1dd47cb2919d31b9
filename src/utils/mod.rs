//! Shared helpers: socket setup and log throttling

pub mod net;
pub mod throttle;

pub use net::{bind_tcp_listener, set_keepalive, KeepaliveConfig};
pub use throttle::LogThrottler;
