//! Legacy sysfs GPIO backend
//!
//! Each pin is exported under `/sys/class/gpio/gpioN` and driven through its
//! `direction`, `edge` and `value` attributes. Interrupts are delivered as
//! `POLLPRI` on the `value` file.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::types::{Direction, Edge, EdgeEvent};
use super::{check_pin, poll_timeout, EdgeSource, GpioBackend};
use crate::error::{AppError, Result};

/// sysfs GPIO backend
pub struct SysfsBackend {
    root: PathBuf,
    /// Pins this process exported and must unexport on release
    exported: Mutex<BTreeSet<u32>>,
    released: AtomicBool,
}

impl SysfsBackend {
    /// Create a backend rooted at the GPIO class directory
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            exported: Mutex::new(BTreeSet::new()),
            released: AtomicBool::new(false),
        }
    }

    fn attr(&self, pin: u32, name: &str) -> PathBuf {
        self.root.join(format!("gpio{}", pin)).join(name)
    }

    /// Export a pin unless the kernel already shows it
    pub(crate) fn export(&self, pin: u32) -> Result<()> {
        check_pin(pin)?;
        if self.root.join(format!("gpio{}", pin)).exists() {
            return Ok(());
        }
        write_attr(&self.root.join("export"), &format!("{}\n", pin))?;
        self.exported.lock().insert(pin);
        debug!("Exported GPIO{} via sysfs", pin);
        Ok(())
    }

    /// Arm an interrupt and open the `value` file for polling
    pub(crate) fn open_edge_source(&self, pin: u32, edge: Edge) -> Result<SysfsEdgeSource> {
        check_pin(pin)?;
        self.export(pin)?;
        write_attr(&self.attr(pin, "direction"), "in\n")?;
        write_attr(&self.attr(pin, "edge"), &format!("{}\n", edge.sysfs_keyword()))?;

        let path = self.attr(pin, "value");
        let mut file = File::open(&path).map_err(|e| attr_error(&path, e))?;
        // Arming latches an event; consume it so only real edges are reported
        drain_value(&mut file).map_err(|e| attr_error(&path, e))?;

        info!("Armed {} edge on GPIO{} ({})", edge.sysfs_keyword(), pin, path.display());
        Ok(SysfsEdgeSource { pin, file })
    }
}

impl GpioBackend for SysfsBackend {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn configure(&self, pin: u32, direction: Direction) -> Result<()> {
        check_pin(pin)?;
        self.export(pin)?;
        let path = self.attr(pin, "direction");
        match direction {
            Direction::Input => write_attr(&path, "in\n"),
            Direction::Output => {
                // "high"/"low" switch to output without a glitch on the line
                let keyword = match self.read(pin) {
                    Ok(true) => "high\n",
                    Ok(false) => "low\n",
                    Err(_) => "out\n",
                };
                write_attr(&path, keyword)
            }
        }
    }

    fn read(&self, pin: u32) -> Result<bool> {
        check_pin(pin)?;
        let path = self.attr(pin, "value");
        let raw = fs::read_to_string(&path).map_err(|e| attr_error(&path, e))?;
        parse_level(&raw)
            .ok_or_else(|| AppError::Gpio(format!("{}: unexpected value {:?}", path.display(), raw)))
    }

    fn set(&self, pin: u32) -> Result<()> {
        check_pin(pin)?;
        write_attr(&self.attr(pin, "value"), "1\n")
    }

    fn clear(&self, pin: u32) -> Result<()> {
        check_pin(pin)?;
        write_attr(&self.attr(pin, "value"), "0\n")
    }

    fn subscribe_edge(&self, pin: u32, edge: Edge) -> Result<Box<dyn EdgeSource>> {
        Ok(Box::new(self.open_edge_source(pin, edge)?))
    }

    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let pins = std::mem::take(&mut *self.exported.lock());
        for pin in pins {
            if let Err(e) = write_attr(&self.root.join("unexport"), &format!("{}\n", pin)) {
                warn!("Failed to unexport GPIO{}: {}", pin, e);
            } else {
                debug!("Unexported GPIO{}", pin);
            }
        }
        Ok(())
    }
}

impl Drop for SysfsBackend {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Interrupt source backed by a sysfs `value` file
pub(crate) struct SysfsEdgeSource {
    pin: u32,
    file: File,
}

impl EdgeSource for SysfsEdgeSource {
    fn wait(&mut self, timeout: Duration) -> Result<Option<EdgeEvent>> {
        let revents = {
            let mut fds = [PollFd::new(
                self.file.as_fd(),
                PollFlags::POLLPRI | PollFlags::POLLERR,
            )];
            if poll(&mut fds, poll_timeout(timeout))? == 0 {
                return Ok(None);
            }
            fds[0].revents().unwrap_or(PollFlags::empty())
        };

        if !revents.intersects(PollFlags::POLLPRI | PollFlags::POLLERR) {
            return Ok(None);
        }
        let at = Instant::now();
        drain_value(&mut self.file)?;
        Ok(Some(EdgeEvent { pin: self.pin, at }))
    }
}

fn write_attr(path: &Path, value: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| attr_error(path, e))?;
    file.write_all(value.as_bytes())
        .map_err(|e| attr_error(path, e))
}

fn drain_value(file: &mut File) -> std::io::Result<()> {
    let mut buf = [0u8; 8];
    file.seek(SeekFrom::Start(0))?;
    let _ = file.read(&mut buf)?;
    Ok(())
}

fn parse_level(raw: &str) -> Option<bool> {
    match raw.trim() {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

fn attr_error(path: &Path, e: std::io::Error) -> AppError {
    AppError::Gpio(format!("{}: {}", path.display(), e))
}
