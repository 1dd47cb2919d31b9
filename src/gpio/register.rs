//! Memory-mapped register backend
//!
//! Maps the BCM283x GPIO register block from `/dev/mem` (or `/dev/gpiomem`)
//! and accesses it with volatile reads and writes. Edge interrupts are not
//! available at register level without a kernel driver, so they are armed
//! through sysfs.
//!
//! Register layout (32-bit words from the block base):
//!
//! | word | register |
//! |------|----------|
//! | 0x00..=0x05 | GPFSEL0..5, 3 bits per pin, 10 pins per word |
//! | 0x07, 0x08 | GPSET0/1 |
//! | 0x0A, 0x0B | GPCLR0/1 |
//! | 0x0D, 0x0E | GPLEV0/1 |

use std::fs::{self, OpenOptions};
use std::num::NonZeroUsize;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::sysfs::SysfsBackend;
use super::types::{Direction, Edge};
use super::{check_pin, EdgeSource, GpioBackend};
use crate::error::{AppError, Result};

/// GPIO block offset from the peripheral base
const GPIO_BLOCK_OFFSET: u64 = 0x0020_0000;

/// Peripheral base of the first-generation BCM2835, used when the device tree says nothing
const DEFAULT_PERIPHERAL_BASE: u32 = 0x2000_0000;

const SOC_RANGES: &str = "/proc/device-tree/soc/ranges";

mod reg {
    pub const GPFSEL0: usize = 0x00;
    pub const GPSET0: usize = 0x07;
    pub const GPCLR0: usize = 0x0A;
    pub const GPLEV0: usize = 0x0D;
    /// One past the last register this backend touches
    pub const SPAN: usize = 0x0F;

    pub const NAMES: [(&str, usize); 12] = [
        ("GPFSEL0", 0x00),
        ("GPFSEL1", 0x01),
        ("GPFSEL2", 0x02),
        ("GPFSEL3", 0x03),
        ("GPFSEL4", 0x04),
        ("GPFSEL5", 0x05),
        ("GPSET0", 0x07),
        ("GPSET1", 0x08),
        ("GPCLR0", 0x0A),
        ("GPCLR1", 0x0B),
        ("GPLEV0", 0x0D),
        ("GPLEV1", 0x0E),
    ];
}

/// Function select codes
const FSEL_INPUT: u32 = 0b000;
const FSEL_OUTPUT: u32 = 0b001;

/// Bank (register index) and bit mask of a pin in the SET/CLR/LEV registers
fn bank_bit(pin: u32) -> (usize, u32) {
    ((pin / 32) as usize, 1 << (pin % 32))
}

/// Word index and bit shift of a pin in the GPFSEL registers
fn fsel_slot(pin: u32) -> (usize, u32) {
    ((pin / 10) as usize, 3 * (pin % 10))
}

enum Storage {
    Mapped { len: usize },
    #[cfg(test)]
    Heap,
}

/// Window of 32-bit registers
struct RegisterWindow {
    base: NonNull<u32>,
    words: usize,
    storage: Storage,
}

// The window is only reached through the backend's mutex
unsafe impl Send for RegisterWindow {}

impl RegisterWindow {
    fn read(&self, offset: usize) -> u32 {
        assert!(offset < self.words, "register offset out of window");
        unsafe { std::ptr::read_volatile(self.base.as_ptr().add(offset)) }
    }

    fn write(&self, offset: usize, value: u32) {
        assert!(offset < self.words, "register offset out of window");
        unsafe { std::ptr::write_volatile(self.base.as_ptr().add(offset), value) }
    }

    #[cfg(test)]
    fn heap(words: usize) -> Self {
        let buf = vec![0u32; words].into_boxed_slice();
        let ptr = Box::into_raw(buf) as *mut u32;
        Self {
            base: NonNull::new(ptr).expect("boxed slice pointer is non-null"),
            words,
            storage: Storage::Heap,
        }
    }
}

impl Drop for RegisterWindow {
    fn drop(&mut self) {
        match self.storage {
            Storage::Mapped { len } => {
                if let Err(e) = unsafe { munmap(self.base.cast(), len) } {
                    warn!("Failed to unmap GPIO registers: {}", e);
                }
            }
            #[cfg(test)]
            Storage::Heap => unsafe {
                let slice = std::ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.words);
                drop(Box::from_raw(slice));
            },
        }
    }
}

/// Register-level GPIO backend
pub struct RegisterBackend {
    regs: Mutex<Option<RegisterWindow>>,
    interrupts: SysfsBackend,
}

impl RegisterBackend {
    /// Map the GPIO block through `mem_device`
    ///
    /// `/dev/gpiomem` exposes the block at offset 0 and works without root;
    /// `/dev/mem` needs the physical address and root privileges.
    pub fn open(mem_device: &str, sysfs_root: impl AsRef<Path>) -> Result<Self> {
        info!("Mapping GPIO registers through {}", mem_device);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(mem_device)
            .map_err(|e| AppError::Gpio(format!("{} open failed: {}", mem_device, e)))?;

        let offset = if mem_device.ends_with("gpiomem") {
            0
        } else {
            peripheral_base() as u64 + GPIO_BLOCK_OFFSET
        };

        let len = page_size();
        if len / std::mem::size_of::<u32>() < reg::SPAN {
            return Err(AppError::Gpio(format!("page size {} too small for GPIO block", len)));
        }
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| AppError::Gpio("invalid page size".to_string()))?;
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                offset as libc::off_t,
            )
        }
        .map_err(|e| AppError::Gpio(format!("GPIO register map at {:#x} failed: {}", offset, e)))?;

        let window = RegisterWindow {
            base: ptr.cast(),
            words: len / std::mem::size_of::<u32>(),
            storage: Storage::Mapped { len },
        };
        debug!("GPIO registers mapped at physical {:#x}", offset);

        let backend = Self {
            regs: Mutex::new(Some(window)),
            interrupts: SysfsBackend::new(sysfs_root),
        };
        backend.dump_registers();
        Ok(backend)
    }

    #[cfg(test)]
    fn with_window(window: RegisterWindow, sysfs_root: impl AsRef<Path>) -> Self {
        Self {
            regs: Mutex::new(Some(window)),
            interrupts: SysfsBackend::new(sysfs_root),
        }
    }

    fn with_regs<T>(&self, f: impl FnOnce(&RegisterWindow) -> T) -> Result<T> {
        let guard = self.regs.lock();
        let regs = guard
            .as_ref()
            .ok_or_else(|| AppError::Gpio("GPIO registers not mapped".to_string()))?;
        Ok(f(regs))
    }

    /// Log the register block at debug level
    fn dump_registers(&self) {
        let _ = self.with_regs(|regs| {
            for (name, offset) in reg::NAMES {
                debug!("{}: ({:#04x}) = {:#010x}", name, offset * 4, regs.read(offset));
            }
        });
    }
}

impl GpioBackend for RegisterBackend {
    fn name(&self) -> &'static str {
        "register"
    }

    fn configure(&self, pin: u32, direction: Direction) -> Result<()> {
        check_pin(pin)?;
        let func = match direction {
            Direction::Input => FSEL_INPUT,
            Direction::Output => FSEL_OUTPUT,
        };
        let (idx, shift) = fsel_slot(pin);
        let (bank, bit) = bank_bit(pin);
        self.with_regs(|regs| {
            if direction == Direction::Output {
                // Load the output latch with the current level first
                let latch = if regs.read(reg::GPLEV0 + bank) & bit != 0 {
                    reg::GPSET0
                } else {
                    reg::GPCLR0
                };
                regs.write(latch + bank, bit);
            }
            let mut value = regs.read(reg::GPFSEL0 + idx);
            value &= !(0b111 << shift);
            value |= func << shift;
            regs.write(reg::GPFSEL0 + idx, value);
        })
    }

    fn read(&self, pin: u32) -> Result<bool> {
        check_pin(pin)?;
        let (bank, bit) = bank_bit(pin);
        self.with_regs(|regs| regs.read(reg::GPLEV0 + bank) & bit != 0)
    }

    fn set(&self, pin: u32) -> Result<()> {
        check_pin(pin)?;
        let (bank, bit) = bank_bit(pin);
        self.with_regs(|regs| regs.write(reg::GPSET0 + bank, bit))
    }

    fn clear(&self, pin: u32) -> Result<()> {
        check_pin(pin)?;
        let (bank, bit) = bank_bit(pin);
        self.with_regs(|regs| regs.write(reg::GPCLR0 + bank, bit))
    }

    fn subscribe_edge(&self, pin: u32, edge: Edge) -> Result<Box<dyn EdgeSource>> {
        Ok(Box::new(self.interrupts.open_edge_source(pin, edge)?))
    }

    fn release(&self) -> Result<()> {
        if self.regs.lock().take().is_some() {
            debug!("GPIO registers unmapped");
        }
        self.interrupts.release()
    }
}

/// Physical peripheral base, as the firmware reports it
fn peripheral_base() -> u32 {
    fs::read(SOC_RANGES)
        .ok()
        .and_then(|raw| parse_soc_ranges(&raw))
        .unwrap_or(DEFAULT_PERIPHERAL_BASE)
}

/// Extract the CPU-side peripheral address from `soc/ranges`
///
/// Older SoCs store it in the second cell; the BCM2711 has a zero there and
/// a 64-bit address whose low word is the third cell.
fn parse_soc_ranges(raw: &[u8]) -> Option<u32> {
    let cell = |idx: usize| -> Option<u32> {
        let bytes = raw.get(idx * 4..idx * 4 + 4)?;
        Some(u32::from_be_bytes(bytes.try_into().ok()?))
    };
    match cell(1)? {
        0 => cell(2).filter(|base| *base != 0),
        base => Some(base),
    }
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> RegisterBackend {
        RegisterBackend::with_window(RegisterWindow::heap(64), "/nonexistent")
    }

    fn peek(backend: &RegisterBackend, offset: usize) -> u32 {
        backend.with_regs(|regs| regs.read(offset)).unwrap()
    }

    fn poke(backend: &RegisterBackend, offset: usize, value: u32) {
        backend.with_regs(|regs| regs.write(offset, value)).unwrap()
    }

    #[test]
    fn test_bit_arithmetic() {
        assert_eq!(bank_bit(3), (0, 1 << 3));
        assert_eq!(bank_bit(31), (0, 1 << 31));
        assert_eq!(bank_bit(32), (1, 1));
        assert_eq!(bank_bit(53), (1, 1 << 21));
        assert_eq!(fsel_slot(3), (0, 9));
        assert_eq!(fsel_slot(17), (1, 21));
        assert_eq!(fsel_slot(53), (5, 9));
    }

    #[test]
    fn test_configure_output_preserves_neighbours() {
        let gpio = backend();
        poke(&gpio, reg::GPFSEL0, 0xFFFF_FFFF);
        gpio.configure(3, Direction::Output).unwrap();
        let value = peek(&gpio, reg::GPFSEL0);
        assert_eq!((value >> 9) & 0b111, FSEL_OUTPUT);
        assert_eq!(value | (0b111 << 9), 0xFFFF_FFFF);
    }

    #[test]
    fn test_configure_output_latches_current_level() {
        let gpio = backend();
        poke(&gpio, reg::GPLEV0, 1 << 3);
        gpio.configure(3, Direction::Output).unwrap();
        assert_eq!(peek(&gpio, reg::GPSET0), 1 << 3);
        assert_eq!(peek(&gpio, reg::GPCLR0), 0);

        gpio.configure(4, Direction::Output).unwrap();
        assert_eq!(peek(&gpio, reg::GPCLR0), 1 << 4);
    }

    #[test]
    fn test_configure_input() {
        let gpio = backend();
        poke(&gpio, reg::GPFSEL0 + 1, 0b001 << 21);
        gpio.configure(17, Direction::Input).unwrap();
        assert_eq!(peek(&gpio, reg::GPFSEL0 + 1), 0);
    }

    #[test]
    fn test_set_and_clear_hit_the_right_bank() {
        let gpio = backend();
        gpio.set(3).unwrap();
        assert_eq!(peek(&gpio, reg::GPSET0), 1 << 3);
        gpio.set(40).unwrap();
        assert_eq!(peek(&gpio, reg::GPSET0 + 1), 1 << 8);
        gpio.clear(4).unwrap();
        assert_eq!(peek(&gpio, reg::GPCLR0), 1 << 4);
        assert_eq!(peek(&gpio, reg::GPCLR0 + 1), 0);
    }

    #[test]
    fn test_read_levels() {
        let gpio = backend();
        poke(&gpio, reg::GPLEV0, 1 << 2);
        poke(&gpio, reg::GPLEV0 + 1, 1 << 1);
        assert!(gpio.read(2).unwrap());
        assert!(!gpio.read(3).unwrap());
        assert!(gpio.read(33).unwrap());
    }

    #[test]
    fn test_invalid_pin() {
        let gpio = backend();
        assert!(matches!(gpio.read(54), Err(AppError::InvalidPin(54))));
        assert!(matches!(
            gpio.configure(60, Direction::Output),
            Err(AppError::InvalidPin(60))
        ));
    }

    #[test]
    fn test_release_unmaps() {
        let gpio = backend();
        gpio.release().unwrap();
        gpio.release().unwrap();
        assert!(matches!(gpio.set(3), Err(AppError::Gpio(_))));
    }

    #[test]
    fn test_parse_soc_ranges() {
        let pi3 = [0x7e, 0, 0, 0, 0x3f, 0, 0, 0, 0x01, 0, 0, 0];
        assert_eq!(parse_soc_ranges(&pi3), Some(0x3F00_0000));

        let pi4 = [0x7e, 0, 0, 0, 0, 0, 0, 0, 0xfe, 0, 0, 0, 0x01, 0x80, 0, 0];
        assert_eq!(parse_soc_ranges(&pi4), Some(0xFE00_0000));

        assert_eq!(parse_soc_ranges(&[0x7e, 0]), None);
    }

    #[test]
    fn test_register_span_fits_window() {
        assert!(reg::SPAN <= 4096 / 4);
        assert_eq!(reg::NAMES.last().map(|(_, o)| o + 1), Some(reg::SPAN));
    }
}
