//! SPI flash geometry and image header patching.
//!
//! An ESP application or bootloader image starts with an 8-byte header:
//!
//! ```text
//! +-------+----------+------------+--------------------------+
//! | magic | segments | flash mode | size (hi) | freq (lo)    |
//! +-------+----------+------------+--------------------------+
//! | 0xE9  |  1 byte  |  1 byte    |  1 byte                  |
//! +-------+----------+------------+--------------------------+
//! ```
//!
//! The second-stage bootloader reads bytes 2 and 3 to configure the flash
//! chip, so when the caller overrides mode, size or frequency the image at
//! the bootloader offset is patched in place before it is written.

use {
    crate::{
        error::{Error, Result},
        target::Chip,
    },
    log::{debug, warn},
    std::{fmt, str::FromStr},
};

/// First byte of every ESP image.
pub const IMAGE_MAGIC: u8 = 0xE9;

/// Offset of the "SHA-256 appended" flag in the extended header.
const HASH_APPENDED_OFFSET: usize = 23;

/// Flash chip capacity.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FlashSize {
    _256Kb,
    _512Kb,
    _1Mb,
    _2Mb,
    _4Mb,
    _8Mb,
    _16Mb,
    _32Mb,
    _64Mb,
    _128Mb,
}

impl FlashSize {
    /// Capacity in bytes.
    pub fn bytes(self) -> u32 {
        const KB: u32 = 1024;
        const MB: u32 = 1024 * KB;
        match self {
            Self::_256Kb => 256 * KB,
            Self::_512Kb => 512 * KB,
            Self::_1Mb => MB,
            Self::_2Mb => 2 * MB,
            Self::_4Mb => 4 * MB,
            Self::_8Mb => 8 * MB,
            Self::_16Mb => 16 * MB,
            Self::_32Mb => 32 * MB,
            Self::_64Mb => 64 * MB,
            Self::_128Mb => 128 * MB,
        }
    }

    /// Decode the capacity byte of a JEDEC RDID answer (`id >> 16`).
    pub fn from_jedec_id(flash_id: u32) -> Option<Self> {
        match (flash_id >> 16) & 0xFF {
            0x12 => Some(Self::_256Kb),
            0x13 => Some(Self::_512Kb),
            0x14 => Some(Self::_1Mb),
            0x15 => Some(Self::_2Mb),
            0x16 => Some(Self::_4Mb),
            0x17 => Some(Self::_8Mb),
            0x18 => Some(Self::_16Mb),
            0x19 => Some(Self::_32Mb),
            0x1A => Some(Self::_64Mb),
            0x1B => Some(Self::_128Mb),
            _ => None,
        }
    }

    /// Value of the size nibble in the image header for `chip`.
    pub fn header_code(self, chip: Chip) -> Result<u8> {
        let code = if chip == Chip::Esp8266 {
            match self {
                Self::_512Kb => Some(0x0),
                Self::_256Kb => Some(0x1),
                Self::_1Mb => Some(0x2),
                Self::_2Mb => Some(0x3),
                Self::_4Mb => Some(0x4),
                Self::_8Mb => Some(0x8),
                Self::_16Mb => Some(0x9),
                _ => None,
            }
        } else {
            match self {
                Self::_1Mb => Some(0x0),
                Self::_2Mb => Some(0x1),
                Self::_4Mb => Some(0x2),
                Self::_8Mb => Some(0x3),
                Self::_16Mb => Some(0x4),
                Self::_32Mb => Some(0x5),
                Self::_64Mb => Some(0x6),
                Self::_128Mb => Some(0x7),
                _ => None,
            }
        };
        code.ok_or_else(|| Error::Unsupported(format!("{self} flash is not supported on {chip}")))
    }
}

impl fmt::Display for FlashSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.bytes();
        if bytes < 1024 * 1024 {
            write!(f, "{}KB", bytes / 1024)
        } else {
            write!(f, "{}MB", bytes / (1024 * 1024))
        }
    }
}

impl FromStr for FlashSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let size = match s
            .trim()
            .to_uppercase()
            .as_str()
        {
            "256KB" => Self::_256Kb,
            "512KB" => Self::_512Kb,
            "1MB" => Self::_1Mb,
            "2MB" => Self::_2Mb,
            "4MB" => Self::_4Mb,
            "8MB" => Self::_8Mb,
            "16MB" => Self::_16Mb,
            "32MB" => Self::_32Mb,
            "64MB" => Self::_64Mb,
            "128MB" => Self::_128Mb,
            _ => return Err(Error::Config(format!("unknown flash size '{s}'"))),
        };
        Ok(size)
    }
}

/// SPI flash clock frequency.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FlashFrequency {
    _20Mhz,
    _26Mhz,
    _40Mhz,
    _80Mhz,
}

impl FlashFrequency {
    /// Value of the frequency nibble in the image header.
    pub fn header_code(self) -> u8 {
        match self {
            Self::_40Mhz => 0x0,
            Self::_26Mhz => 0x1,
            Self::_20Mhz => 0x2,
            Self::_80Mhz => 0xF,
        }
    }
}

impl fmt::Display for FlashFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::_20Mhz => "20m",
            Self::_26Mhz => "26m",
            Self::_40Mhz => "40m",
            Self::_80Mhz => "80m",
        })
    }
}

impl FromStr for FlashFrequency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s
            .trim()
            .to_lowercase();
        let digits = normalized
            .trim_end_matches("hz")
            .trim_end_matches('m');
        match digits {
            "20" => Ok(Self::_20Mhz),
            "26" | "26.7" => Ok(Self::_26Mhz),
            "40" => Ok(Self::_40Mhz),
            "80" => Ok(Self::_80Mhz),
            _ => Err(Error::Config(format!("unknown flash frequency '{s}'"))),
        }
    }
}

/// SPI flash I/O mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FlashMode {
    /// Quad I/O.
    Qio,
    /// Quad output.
    Qout,
    /// Dual I/O.
    Dio,
    /// Dual output.
    Dout,
}

impl FlashMode {
    /// Value of the mode byte in the image header.
    pub fn header_code(self) -> u8 {
        match self {
            Self::Qio => 0,
            Self::Qout => 1,
            Self::Dio => 2,
            Self::Dout => 3,
        }
    }
}

impl fmt::Display for FlashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Qio => "qio",
            Self::Qout => "qout",
            Self::Dio => "dio",
            Self::Dout => "dout",
        })
    }
}

impl FromStr for FlashMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s
            .trim()
            .to_lowercase()
            .as_str()
        {
            "qio" => Ok(Self::Qio),
            "qout" => Ok(Self::Qout),
            "dio" => Ok(Self::Dio),
            "dout" => Ok(Self::Dout),
            _ => Err(Error::Config(format!("unknown flash mode '{s}'"))),
        }
    }
}

/// Header overrides; `None` keeps the value the image was built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashSettings {
    /// Flash size override.
    pub size: Option<FlashSize>,
    /// Flash frequency override.
    pub freq: Option<FlashFrequency>,
    /// Flash mode override.
    pub mode: Option<FlashMode>,
}

impl FlashSettings {
    /// Whether no field is overridden.
    pub fn is_empty(&self) -> bool {
        self.size
            .is_none()
            && self
                .freq
                .is_none()
            && self
                .mode
                .is_none()
    }
}

fn is_bootloader_image(chip: Chip, address: u32, image: &[u8]) -> bool {
    address == chip.bootloader_offset() && image.len() >= 8 && image[0] == IMAGE_MAGIC
}

fn has_digest(chip: Chip, image: &[u8]) -> bool {
    chip.has_extended_header()
        && image
            .get(HASH_APPENDED_OFFSET)
            .is_some_and(|&flag| flag == 1)
}

/// Header bytes 2 (mode) and 3 (size/frequency) with `settings` applied.
fn header_bytes(chip: Chip, image: &[u8], settings: &FlashSettings) -> Result<[u8; 2]> {
    let [mut mode, mut size_freq] = [image[2], image[3]];
    if let Some(flash_mode) = settings.mode {
        mode = flash_mode.header_code();
    }
    if let Some(size) = settings.size {
        size_freq = (size.header_code(chip)? << 4) | (size_freq & 0x0F);
    }
    if let Some(freq) = settings.freq {
        size_freq = (size_freq & 0xF0) | freq.header_code();
    }
    Ok([mode, size_freq])
}

/// Fail if `settings` cannot be written into this image's header.
///
/// Same rules as [`patch_image_header`], without touching the image.
pub fn check_image_header(
    chip: Chip,
    address: u32,
    image: &[u8],
    settings: &FlashSettings,
) -> Result<()> {
    if !settings.is_empty() && is_bootloader_image(chip, address, image) && !has_digest(chip, image)
    {
        header_bytes(chip, image, settings)?;
    }
    Ok(())
}

/// Rewrite the flash parameters of the bootloader image header in place.
///
/// Only images written to the chip's bootloader offset are touched. Images
/// with an appended SHA-256 digest are left alone, since patching would
/// invalidate the digest. Returns whether the header was changed.
pub fn patch_image_header(
    chip: Chip,
    address: u32,
    image: &mut [u8],
    settings: &FlashSettings,
) -> Result<bool> {
    if settings.is_empty() || !is_bootloader_image(chip, address, image) {
        return Ok(false);
    }
    if has_digest(chip, image) {
        warn!(
            "Image at 0x{address:08X} has an appended SHA-256 digest; flash parameters left unchanged"
        );
        return Ok(false);
    }

    let [mode, size_freq] = header_bytes(chip, image, settings)?;
    image[2] = mode;
    image[3] = size_freq;

    debug!(
        "Patched image header at 0x{address:08X}: mode=0x{mode:02X} size/freq=0x{size_freq:02X}"
    );
    Ok(true)
}
