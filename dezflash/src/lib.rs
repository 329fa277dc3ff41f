//! # dezflash
//!
//! A library for flashing ESP32-family chips through their ROM serial
//! bootloader.
//!
//! This crate provides:
//!
//! - a byte-level [`Transport`] over a serial port with a leftover buffer
//! - SLIP framing and the ROM command/response packets
//! - a bootloader [`Session`] (handshake, chip detection, flash erase and
//!   block writes, reset control)
//! - a [`FlashCoordinator`] that runs a [`FlashJob`] and reports
//!   percentages and log lines
//! - serial port discovery with USB bridge classification
//!
//! ## Supported Chips
//!
//! ESP8266, ESP32, ESP32-S2, ESP32-S3, ESP32-C2, ESP32-C3, ESP32-C6 and
//! ESP32-H2, detected automatically.
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use dezflash::{FlashCoordinator, FlashJob, FlashRequest, LoaderConfig, SerialConfig, Session};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::new(
//!         SerialConfig::new("/dev/ttyUSB0", 115_200),
//!         LoaderConfig::default(),
//!     );
//!     let mut coordinator = FlashCoordinator::new(session);
//!
//!     let job = FlashJob::new(vec![
//!         FlashRequest::new(std::fs::read("firmware.bin")?, 0x10000),
//!         FlashRequest::new(std::fs::read("spiffs.bin")?, 0x110000),
//!     ]);
//!     coordinator.run(
//!         &job,
//!         |line| println!("{line}"),
//!         |index, percent| println!("request {index}: {percent}%"),
//!     )?;
//!
//!     coordinator.session_mut().hard_reset()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod host;
pub mod job;
pub mod port;
pub mod protocol;
pub mod session;
pub mod target;
pub mod transport;

#[cfg(test)]
mod mock;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Pending
/// transport reads then fail with [`Error::Cancelled`].
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    device::{DetectedPort, DeviceKind},
    error::{Error, Result},
    host::{auto_detect_port, discover_ports},
    job::{FlashCoordinator, FlashJob, FlashOptions, FlashRequest, ProgressState},
    port::{Port, PortEnumerator, PortInfo, PortOpener, SerialConfig},
    session::{FlashReport, LoaderConfig, ResetMode, Session, SessionState},
    target::{Chip, FlashFrequency, FlashMode, FlashSize},
    transport::{AbortHandle, Transport},
};
