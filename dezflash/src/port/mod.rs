//! Port abstraction for serial communication with the ROM bootloader.
//!
//! The bootloader protocol only needs a byte stream plus the two modem
//! control lines wired to the chip's `EN` and `IO0` pins. This module
//! captures that as the [`Port`] trait, and separates *opening* a port into
//! the [`PortOpener`] capability so that a [`Transport`](crate::transport::Transport)
//! can be handed any port source (a native serial device, or a fake in tests).
//!
//! ```text
//! +-------------------+
//! |  Session / Job    |
//! +---------+---------+
//!           |
//! +---------v---------+      opens       +------------------+
//! |    Transport      | ---------------> |   PortOpener     |
//! +---------+---------+                  +------------------+
//!           |
//! +---------v---------+
//! |    Port trait     |  NativePort (serialport) / test fakes
//! +-------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use dezflash::port::Port;
//!
//! fn example<P: Port>(port: &mut P) -> dezflash::Result<()> {
//!     port.write_all_bytes(&[0xC0, 0xC0])?;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
///
/// The ROM bootloader always speaks 8-N-1 without flow control, so only the
/// port name, baud rate and poll timeout are configurable.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Timeout of a single blocking read.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(50),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the single-read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Byte-stream port with the modem control lines used for reset sequencing.
///
/// Reads must honour the configured timeout and report an elapsed timeout as
/// [`std::io::ErrorKind::TimedOut`]; `Ok(0)` means end-of-stream.
pub trait Port: Read + Write + Send {
    /// Set the single-read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Set the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard pending input and output bytes.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes and flush, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Capability to open a [`Port`] at a given baud rate.
///
/// Implemented for [`SerialConfig`] on native platforms and for any closure
/// `FnMut(u32) -> Result<P>`, which is how tests inject fake ports.
pub trait PortOpener {
    /// Port type produced by this opener.
    type Port: Port;

    /// Open the port. Fails with `PortUnavailable` or `PortBusy`.
    fn open(&mut self, baud_rate: u32) -> Result<Self::Port>;
}

impl<P, F> PortOpener for F
where
    P: Port,
    F: FnMut(u32) -> Result<P>,
{
    type Port = P;

    fn open(&mut self, baud_rate: u32) -> Result<P> {
        self(baud_rate)
    }
}

/// Trait for listing available serial ports.
///
/// This is separated from `Port` because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
