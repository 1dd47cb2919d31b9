//! Wire record and pin policy types

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// `p3` value returned for rejected requests
pub const ERROR_SENTINEL: i32 = -2000;

/// Size of one request or reply on the wire
pub const RECORD_SIZE: usize = std::mem::size_of::<Command>();

/// Request/reply record
///
/// Four native-endian `i32`s with no padding. The reply is the request with
/// `p3` filled in.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct Command {
    /// Opcode, echoed
    pub cmd: i32,
    /// Pin number, echoed
    pub p1: i32,
    /// Value to write (WRITE only), echoed
    pub p2: i32,
    /// Result or [`ERROR_SENTINEL`]
    pub p3: i32,
}

impl Command {
    pub fn new(cmd: i32, p1: i32, p2: i32) -> Self {
        Self { cmd, p1, p2, p3: 0 }
    }

    /// Decode a received record; anything but exactly one record is rejected
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != RECORD_SIZE {
            return Err(AppError::Protocol(format!(
                "expected {} bytes, got {}",
                RECORD_SIZE,
                buf.len()
            )));
        }
        Ok(bytemuck::pod_read_unaligned(buf))
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        bytemuck::cast(*self)
    }
}

/// Request opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Read = 3,
    Write = 4,
}

impl TryFrom<i32> for Opcode {
    type Error = AppError;

    fn try_from(raw: i32) -> Result<Self> {
        match raw {
            3 => Ok(Self::Read),
            4 => Ok(Self::Write),
            other => Err(AppError::InvalidCommand(other)),
        }
    }
}

/// Which GPIO does what on this board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinAssignment {
    /// Output switching the power rail
    pub power: u32,
    /// Output reserved for a status LED
    pub led: u32,
    /// Input wired to the pushbutton
    pub button: u32,
}

impl Default for PinAssignment {
    fn default() -> Self {
        Self {
            power: 3,
            led: 4,
            button: 2,
        }
    }
}

/// Set of GPIO numbers (0..=63)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinSet(u64);

impl PinSet {
    pub fn from_pins(pins: &[u32]) -> Self {
        Self(
            pins.iter()
                .filter(|pin| **pin < 64)
                .fold(0, |mask, pin| mask | (1u64 << pin)),
        )
    }

    pub fn contains(&self, pin: u32) -> bool {
        pin < 64 && self.0 & (1u64 << pin) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..64).filter(move |pin| self.contains(*pin))
    }
}

/// Remote access allow-lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinPolicy {
    pub readable: PinSet,
    pub writable: PinSet,
}

impl PinPolicy {
    /// Button and rail are readable; rail and LED are writable
    pub fn for_assignment(pins: &PinAssignment) -> Self {
        Self {
            readable: PinSet::from_pins(&[pins.button, pins.power]),
            writable: PinSet::from_pins(&[pins.power, pins.led]),
        }
    }
}
