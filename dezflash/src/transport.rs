//! Byte-level duplex channel over a serial port.
//!
//! A [`Transport`] owns at most one open [`Port`] and knows nothing about
//! frames. Its one piece of state besides the port is the *leftover* buffer:
//! bytes handed back with [`Transport::unread`] are returned, in order, by the
//! next [`Transport::read`] before anything new is pulled from the port.

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortOpener},
    },
    log::{debug, trace},
    std::{
        io::{self, Read},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::{Duration, Instant},
    },
};

/// Poll interval of a single blocking port read.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Size of the scratch buffer used per port read.
const READ_CHUNK: usize = 1024;

/// Cloneable trigger that cancels in-flight transport reads.
///
/// Another thread (typically a UI or signal handler) calls
/// [`AbortHandle::abort`]; the next poll of a pending read fails with
/// [`Error::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Request cancellation.
    pub fn abort(&self) {
        self.0
            .store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_aborted(&self) -> bool {
        self.0
            .load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0
            .store(false, Ordering::SeqCst);
    }
}

/// Raw byte-stream channel over a serial connection.
pub struct Transport<O: PortOpener> {
    opener: O,
    port: Option<O::Port>,
    baud_rate: u32,
    leftover: Vec<u8>,
    abort: AbortHandle,
}

impl<O: PortOpener> Transport<O> {
    /// Create a closed transport that opens ports through `opener`.
    pub fn new(opener: O) -> Self {
        Self {
            opener,
            port: None,
            baud_rate: 0,
            leftover: Vec::new(),
            abort: AbortHandle::default(),
        }
    }

    /// Open the port at `baud_rate` if it is not already open.
    pub fn connect(&mut self, baud_rate: u32) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let mut port = self.opener.open(baud_rate)?;
        port.set_timeout(POLL_INTERVAL)?;
        debug!("Transport connected to {} at {baud_rate} baud", port.name());

        self.abort.reset();
        self.leftover.clear();
        self.baud_rate = baud_rate;
        self.port = Some(port);
        Ok(())
    }

    /// Release the port and drop any leftover bytes.
    ///
    /// Safe to call any number of times.
    pub fn disconnect(&mut self) {
        self.leftover.clear();
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.close() {
                debug!("Error while closing {}: {e}", port.name());
            } else {
                debug!("Transport disconnected from {}", port.name());
            }
        }
    }

    /// Whether a port is currently open.
    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    /// Name of the open port, if any.
    pub fn port_name(&self) -> Option<&str> {
        self.port
            .as_ref()
            .map(Port::name)
    }

    /// Baud rate the port was opened or last switched at.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Handle that cancels pending reads from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Send a buffer.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("-> {} bytes", bytes.len());
        self.port_mut()?
            .write_all_bytes(bytes)
    }

    /// Return the next available chunk of bytes.
    ///
    /// Leftover bytes are returned first. A zero `timeout` waits
    /// indefinitely; otherwise [`Error::ReadTimeout`] is returned once it
    /// elapses with no data.
    pub fn read(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        if !self
            .leftover
            .is_empty()
        {
            return Ok(std::mem::take(&mut self.leftover));
        }

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut buf = [0u8; READ_CHUNK];

        loop {
            if self
                .abort
                .is_aborted()
                || crate::is_interrupted_requested()
            {
                return Err(Error::Cancelled);
            }

            match self
                .port_mut()?
                .read(&mut buf)
            {
                Ok(0) => return Err(Error::StreamClosed),
                Ok(n) => {
                    trace!("<- {n} bytes");
                    return Ok(buf[..n].to_vec());
                },
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {},
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(Error::StreamClosed);
                },
                Err(e) => return Err(Error::TransportIo(e)),
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(Error::ReadTimeout(timeout));
            }
        }
    }

    /// Push bytes back so the next [`read`](Self::read) returns them first.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut pending = bytes.to_vec();
        pending.append(&mut self.leftover);
        self.leftover = pending;
    }

    /// Discard leftover bytes and anything buffered by the port driver.
    pub fn clear_input(&mut self) -> Result<()> {
        self.leftover.clear();
        self.port_mut()?
            .clear_buffers()
    }

    /// Switch the local side to a new baud rate.
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.port_mut()?
            .set_baud_rate(baud_rate)?;
        self.baud_rate = baud_rate;
        Ok(())
    }

    /// Drive the DTR line.
    pub fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.port_mut()?
            .set_dtr(level)
    }

    /// Drive the RTS line.
    pub fn set_rts(&mut self, level: bool) -> Result<()> {
        self.port_mut()?
            .set_rts(level)
    }

    fn port_mut(&mut self) -> Result<&mut O::Port> {
        self.port
            .as_mut()
            .ok_or_else(|| {
                Error::TransportIo(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "transport is not connected",
                ))
            })
    }
}

impl<O: PortOpener> Drop for Transport<O> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
