//! Kernel logger.
//!
//! Two phases, both installed through the swappable function pointers in
//! `muon-core`: an early lock-free COM1 writer available before the heap
//! exists, and a sink-list logger with per-sink level filtering once
//! allocation works. The console framebuffer is an external collaborator
//! that registers itself as a [`LogSink`].

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use muon_core::log::LogLevel;
use muon_core::sync::SpinLock;

use crate::drivers::serial::{COM1, Uart16550};

/// An output sink for the logger. `&self` because writes are serialized by
/// the logger's own lock.
pub trait LogSink: Send + Sync {
    /// Writes a string fragment.
    fn write_str(&self, s: &str);
    /// Most verbose level this sink accepts.
    fn max_level(&self) -> LogLevel;
    /// Sink name, for diagnostics.
    fn name(&self) -> &str;
}

/// A [`LogSink`] writing to a 16550 UART.
pub struct SerialSink {
    uart: Uart16550,
    max_level: LogLevel,
}

impl LogSink for SerialSink {
    fn write_str(&self, s: &str) {
        self.uart.write_str(s);
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "serial"
    }
}

// ---------------------------------------------------------------------------
// Phase 1: early serial
// ---------------------------------------------------------------------------

static EARLY_UART: SpinLock<Option<Uart16550>> = SpinLock::new(None);

struct EarlyWriter;

impl fmt::Write for EarlyWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(uart) = *EARLY_UART.lock() {
            uart.write_str(s);
        }
        Ok(())
    }
}

fn early_print(args: fmt::Arguments<'_>) {
    let _ = EarlyWriter.write_fmt(args);
}

fn early_log(level: LogLevel, args: fmt::Arguments<'_>) {
    early_print(format_args!("[{}] {}\n", level.name(), args));
}

/// Brings up COM1 and routes the log macros through it. Safe to call
/// before the PMM, VMM or heap exist.
pub fn init_early_serial() {
    *EARLY_UART.lock() = Some(Uart16550::init(COM1));
    // SAFETY: early_print/early_log only touch the UART behind a lock.
    unsafe {
        muon_core::log::set_print_fn(early_print);
        muon_core::log::set_log_fn(early_log);
    }
}

// ---------------------------------------------------------------------------
// Phase 2: sink-list logger
// ---------------------------------------------------------------------------

static LOGGER: SpinLock<Option<Logger>> = SpinLock::new(None);

/// The full logger: a list of sinks, each with its own level cap.
pub struct Logger {
    sinks: Vec<Box<dyn LogSink>>,
}

impl Logger {
    fn write(&self, level: Option<LogLevel>, args: fmt::Arguments<'_>) {
        let mut buf = FmtBuffer::new();
        match level {
            Some(level) => {
                let _ = write!(buf, "[{:>6}.{:03}] {} ",
                    crate::time::ticks_ms() / 1000,
                    crate::time::ticks_ms() % 1000,
                    level.name());
                let _ = buf.write_fmt(args);
                let _ = buf.write_str("\n");
            }
            None => {
                let _ = buf.write_fmt(args);
            }
        }
        for sink in &self.sinks {
            if level.is_none_or(|l| l <= sink.max_level()) {
                sink.write_str(buf.as_str());
            }
        }
    }
}

/// Bounded formatting buffer so logging never allocates.
struct FmtBuffer {
    data: [u8; 512],
    len: usize,
}

impl FmtBuffer {
    const fn new() -> Self {
        Self {
            data: [0; 512],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.data[..self.len]).unwrap_or("<bad utf8>")
    }
}

impl fmt::Write for FmtBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(self.data.len() - self.len);
        self.data[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

fn logger_print(args: fmt::Arguments<'_>) {
    if let Some(logger) = LOGGER.lock().as_ref() {
        logger.write(None, args);
    }
}

fn logger_log(level: LogLevel, args: fmt::Arguments<'_>) {
    if let Some(logger) = LOGGER.lock().as_ref() {
        logger.write(Some(level), args);
    }
}

/// Replaces the early serial functions with the sink-list logger, seeded
/// with a serial sink. Requires a working heap.
pub fn init_logger() {
    let mut sinks: Vec<Box<dyn LogSink>> = Vec::new();
    sinks.push(Box::new(SerialSink {
        uart: Uart16550::init(COM1),
        max_level: LogLevel::Debug,
    }));
    *LOGGER.lock() = Some(Logger { sinks });
    // SAFETY: logger_print/logger_log guard everything behind LOGGER's
    // lock and never allocate.
    unsafe {
        muon_core::log::set_print_fn(logger_print);
        muon_core::log::set_log_fn(logger_log);
    }
}

/// Adds a sink (e.g. the external framebuffer console).
pub fn add_sink(sink: Box<dyn LogSink>) {
    if let Some(logger) = LOGGER.lock().as_mut() {
        logger.sinks.push(sink);
    }
}
