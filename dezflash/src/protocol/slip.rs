//! SLIP framing used by the ROM bootloader.
//!
//! Every packet is wrapped in `0xC0` delimiters; a literal `0xC0` inside the
//! packet is sent as `0xDB 0xDC` and a literal `0xDB` as `0xDB 0xDD`.

use crate::error::{Error, Result};

/// Frame delimiter.
pub const END: u8 = 0xC0;
/// Escape introducer.
pub const ESC: u8 = 0xDB;
/// Escaped `END`.
pub const ESC_END: u8 = 0xDC;
/// Escaped `ESC`.
pub const ESC_ESC: u8 = 0xDD;

/// Wrap a packet in a SLIP frame.
pub fn encode(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packet.len() + packet.len() / 16 + 2);
    out.push(END);
    for &b in packet {
        match b {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(b),
        }
    }
    out.push(END);
    out
}

/// Incremental SLIP decoder.
///
/// Bytes seen outside a frame (boot banners, line noise) are discarded. Two
/// consecutive delimiters are treated as the start of a frame so that a
/// decoder that joined the stream mid-frame resynchronizes on the next one.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    buf: Vec<u8>,
    in_frame: bool,
    escaped: bool,
    discarded: usize,
}

impl SlipDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns a completed frame once its closing delimiter
    /// arrives.
    pub fn push(&mut self, byte: u8) -> Result<Option<Vec<u8>>> {
        if !self.in_frame {
            if byte == END {
                self.in_frame = true;
            } else {
                self.discarded += 1;
            }
            return Ok(None);
        }

        if self.escaped {
            self.escaped = false;
            match byte {
                ESC_END => self
                    .buf
                    .push(END),
                ESC_ESC => self
                    .buf
                    .push(ESC),
                other => {
                    self.reset();
                    return Err(Error::Protocol(format!(
                        "invalid SLIP escape sequence 0xDB 0x{other:02X}"
                    )));
                },
            }
            return Ok(None);
        }

        match byte {
            END if self
                .buf
                .is_empty() => Ok(None),
            END => {
                self.in_frame = false;
                Ok(Some(std::mem::take(&mut self.buf)))
            },
            ESC => {
                self.escaped = true;
                Ok(None)
            },
            _ => {
                self.buf
                    .push(byte);
                Ok(None)
            },
        }
    }

    /// Drop any partially decoded frame.
    pub fn reset(&mut self) {
        self.buf
            .clear();
        self.in_frame = false;
        self.escaped = false;
    }

    /// Number of bytes discarded outside frames since creation.
    pub fn discarded(&self) -> usize {
        self.discarded
    }
}
