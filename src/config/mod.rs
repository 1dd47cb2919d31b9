//! Daemon configuration

mod schema;

pub use schema::*;
