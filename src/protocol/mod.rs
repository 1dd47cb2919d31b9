//! Remote command protocol
//!
//! A peer sends fixed 16-byte [`Command`] records and gets the same record
//! back with `p3` filled in:
//!
//! | field | request | reply |
//! |-------|---------|-------|
//! | `cmd` | 3 = READ, 4 = WRITE | echoed |
//! | `p1`  | pin | echoed |
//! | `p2`  | value (WRITE) | echoed |
//! | `p3`  | ignored | result, or -2000 on error |
//!
//! Integers travel in the host's native byte order.

mod dispatcher;
mod types;

pub use dispatcher::Dispatcher;
pub use types::{Command, Opcode, PinAssignment, PinPolicy, PinSet, ERROR_SENTINEL, RECORD_SIZE};
