//! ROM bootloader command and response packets.
//!
//! ## Packet Format
//!
//! ```text
//! request:
//! +-----+--------+---------+------------+------------------+
//! | dir | opcode | size    | checksum   | data             |
//! +-----+--------+---------+------------+------------------+
//! | 0x00| 1 byte | u16 LE  | u32 LE     | `size` bytes     |
//! +-----+--------+---------+------------+------------------+
//!
//! response:
//! +-----+--------+---------+------------+------------------+
//! | dir | opcode | size    | value      | data + status    |
//! +-----+--------+---------+------------+------------------+
//! | 0x01| echoed | u16 LE  | u32 LE     | `size` bytes     |
//! +-----+--------+---------+------------+------------------+
//! ```
//!
//! Packets travel inside SLIP frames (see [`super::slip`]). The checksum is
//! only meaningful for data-carrying commands and is the XOR of the data
//! bytes seeded with [`CHECKSUM_SEED`].

use {
    crate::{
        error::{Error, Result},
        protocol::slip,
    },
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
    std::{fmt, io::Cursor},
};

/// Seed of the data checksum.
pub const CHECKSUM_SEED: u8 = 0xEF;

/// Direction byte of a request.
pub const DIR_REQUEST: u8 = 0x00;
/// Direction byte of a response.
pub const DIR_RESPONSE: u8 = 0x01;

/// Size of a request/response header.
pub const HEADER_LEN: usize = 8;

/// Block size used by the ROM flash write commands.
pub const FLASH_WRITE_SIZE: usize = 0x400;

/// Payload of the SYNC command: `07 07 12 20` followed by 32 x `0x55`.
pub const SYNC_PAYLOAD: [u8; 36] = {
    let mut payload = [0x55u8; 36];
    payload[0] = 0x07;
    payload[1] = 0x07;
    payload[2] = 0x12;
    payload[3] = 0x20;
    payload
};

/// Bootloader command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Begin an uncompressed flash write (erases the target region).
    FlashBegin = 0x02,
    /// One uncompressed flash block.
    FlashData = 0x03,
    /// Finish flashing, optionally rebooting into the application.
    FlashEnd = 0x04,
    /// Synchronize with the bootloader.
    Sync = 0x08,
    /// Write a 32-bit register.
    WriteReg = 0x09,
    /// Read a 32-bit register.
    ReadReg = 0x0A,
    /// Configure SPI flash geometry.
    SpiSetParams = 0x0B,
    /// Attach the SPI flash chip.
    SpiAttach = 0x0D,
    /// Change the UART baud rate.
    ChangeBaudrate = 0x0F,
    /// Begin a compressed flash write.
    FlashDeflBegin = 0x10,
    /// One compressed flash block.
    FlashDeflData = 0x11,
    /// Finish a compressed flash write.
    FlashDeflEnd = 0x12,
    /// Erase the whole flash chip.
    EraseFlash = 0xD0,
    /// Erase a flash region.
    EraseRegion = 0xD1,
}

impl Opcode {
    /// Command name as used by esptool-compatible tooling.
    pub fn name(self) -> &'static str {
        match self {
            Self::FlashBegin => "FLASH_BEGIN",
            Self::FlashData => "FLASH_DATA",
            Self::FlashEnd => "FLASH_END",
            Self::Sync => "SYNC",
            Self::WriteReg => "WRITE_REG",
            Self::ReadReg => "READ_REG",
            Self::SpiSetParams => "SPI_SET_PARAMS",
            Self::SpiAttach => "SPI_ATTACH",
            Self::ChangeBaudrate => "CHANGE_BAUDRATE",
            Self::FlashDeflBegin => "FLASH_DEFL_BEGIN",
            Self::FlashDeflData => "FLASH_DEFL_DATA",
            Self::FlashDeflEnd => "FLASH_DEFL_END",
            Self::EraseFlash => "ERASE_FLASH",
            Self::EraseRegion => "ERASE_REGION",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compute the data checksum of a flash block.
pub fn checksum(data: &[u8]) -> u32 {
    u32::from(
        data.iter()
            .fold(CHECKSUM_SEED, |acc, b| acc ^ b),
    )
}

/// Human-readable description of a ROM error code.
pub fn rom_error_reason(code: u8) -> &'static str {
    match code {
        0x05 => "received message is invalid",
        0x06 => "failed to act on received message",
        0x07 => "invalid CRC in message",
        0x08 => "flash write error",
        0x09 => "flash read error",
        0x0A => "flash read length error",
        0x0B => "deflate error",
        _ => "unknown error",
    }
}

/// Command frame builder.
#[derive(Debug, Clone)]
pub struct CommandFrame {
    opcode: Opcode,
    checksum: u32,
    data: Vec<u8>,
}

impl CommandFrame {
    /// Create a frame with no payload.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            checksum: 0,
            data: Vec::new(),
        }
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn with_words(opcode: Opcode, words: &[u32]) -> Self {
        let mut frame = Self::new(opcode);
        for &word in words {
            frame
                .data
                .write_u32::<LittleEndian>(word)
                .unwrap();
        }
        frame
    }

    /// SYNC command.
    pub fn sync() -> Self {
        let mut frame = Self::new(Opcode::Sync);
        frame
            .data
            .extend_from_slice(&SYNC_PAYLOAD);
        frame
    }

    /// READ_REG command.
    pub fn read_reg(address: u32) -> Self {
        Self::with_words(Opcode::ReadReg, &[address])
    }

    /// WRITE_REG command (`address`, `value`, `mask`, zero delay).
    pub fn write_reg(address: u32, value: u32, mask: u32) -> Self {
        Self::with_words(Opcode::WriteReg, &[address, value, mask, 0])
    }

    /// SPI_ATTACH command for the ROM loader (default pin configuration).
    pub fn spi_attach() -> Self {
        Self::with_words(Opcode::SpiAttach, &[0, 0])
    }

    /// SPI_SET_PARAMS command for a flash chip of `total_size` bytes.
    pub fn spi_set_params(total_size: u32) -> Self {
        // fl_id, total size, block size, sector size, page size, status mask
        Self::with_words(
            Opcode::SpiSetParams,
            &[0, total_size, 64 * 1024, 4 * 1024, 256, 0xFFFF],
        )
    }

    /// CHANGE_BAUDRATE command (`prior` is 0 when talking to the ROM).
    pub fn change_baudrate(new_baud: u32, prior_baud: u32) -> Self {
        Self::with_words(Opcode::ChangeBaudrate, &[new_baud, prior_baud])
    }

    /// FLASH_BEGIN / FLASH_DEFL_BEGIN command.
    ///
    /// `encrypted` appends the trailing flag newer ROMs expect.
    pub fn flash_begin(
        compressed: bool,
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encrypted: Option<bool>,
    ) -> Self {
        let opcode = if compressed {
            Opcode::FlashDeflBegin
        } else {
            Opcode::FlashBegin
        };
        let mut frame = Self::with_words(opcode, &[size, blocks, block_size, offset]);
        if let Some(encrypted) = encrypted {
            frame
                .data
                .extend_from_slice(&u32::from(encrypted).to_le_bytes());
        }
        frame
    }

    /// FLASH_DATA / FLASH_DEFL_DATA command carrying one block.
    #[allow(clippy::cast_possible_truncation)]
    pub fn flash_data(compressed: bool, sequence: u32, block: &[u8]) -> Self {
        let opcode = if compressed {
            Opcode::FlashDeflData
        } else {
            Opcode::FlashData
        };
        // Safe cast: blocks are at most FLASH_WRITE_SIZE bytes
        let mut frame = Self::with_words(opcode, &[block.len() as u32, sequence, 0, 0]);
        frame
            .data
            .extend_from_slice(block);
        frame.checksum = checksum(block);
        frame
    }

    /// FLASH_END / FLASH_DEFL_END command.
    pub fn flash_end(compressed: bool, reboot: bool) -> Self {
        let opcode = if compressed {
            Opcode::FlashDeflEnd
        } else {
            Opcode::FlashEnd
        };
        // The ROM expects "stay in loader", i.e. the inverse of reboot.
        Self::with_words(opcode, &[u32::from(!reboot)])
    }

    /// ERASE_FLASH command.
    pub fn erase_flash() -> Self {
        Self::new(Opcode::EraseFlash)
    }

    /// ERASE_REGION command.
    pub fn erase_region(offset: u32, size: u32) -> Self {
        Self::with_words(Opcode::EraseRegion, &[offset, size])
    }

    /// Build the raw packet (header + data), without SLIP framing.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            HEADER_LEN
                + self
                    .data
                    .len(),
        );
        buf.push(DIR_REQUEST);
        buf.push(self.opcode as u8);
        // Safe cast: payloads are bounded by the flash block size
        buf.write_u16::<LittleEndian>(
            self.data
                .len() as u16,
        )
        .unwrap();
        buf.write_u32::<LittleEndian>(self.checksum)
            .unwrap();
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Build the SLIP-framed bytes ready for the wire.
    pub fn encode(&self) -> Vec<u8> {
        slip::encode(&self.build())
    }

    /// Get the opcode.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Get the payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Decoded response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Echoed opcode.
    pub opcode: u8,
    /// Value word (register contents for READ_REG).
    pub value: u32,
    /// Response data, ending in the status bytes.
    pub data: Vec<u8>,
}

impl Response {
    /// Parse an unescaped SLIP frame.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(Error::Protocol(format!(
                "response too short ({} bytes)",
                frame.len()
            )));
        }

        let mut cursor = Cursor::new(frame);
        let direction = cursor.read_u8()?;
        if direction != DIR_RESPONSE {
            return Err(Error::Protocol(format!(
                "unexpected direction byte 0x{direction:02X}"
            )));
        }
        let opcode = cursor.read_u8()?;
        let size = usize::from(cursor.read_u16::<LittleEndian>()?);
        let value = cursor.read_u32::<LittleEndian>()?;

        let data = &frame[HEADER_LEN..];
        if data.len() != size {
            return Err(Error::Protocol(format!(
                "response length mismatch: header says {size}, frame carries {}",
                data.len()
            )));
        }

        Ok(Self {
            opcode,
            value,
            data: data.to_vec(),
        })
    }

    /// Status and error bytes, given the chip's status trailer length.
    ///
    /// When `status_len` is `None` the whole data section is taken as the
    /// trailer, which is what SYNC and READ_REG replies carry.
    pub fn status(&self, status_len: Option<usize>) -> Result<(u8, u8)> {
        let len = status_len.unwrap_or(
            self.data
                .len(),
        );
        if len < 2
            || self
                .data
                .len()
                < len
        {
            return Err(Error::Protocol(format!(
                "response to opcode 0x{:02X} lacks status bytes",
                self.opcode
            )));
        }
        let start = self
            .data
            .len()
            - len;
        Ok((self.data[start], self.data[start + 1]))
    }
}
