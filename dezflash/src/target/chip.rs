//! Chip identification and per-chip constants.
//!
//! The ROM loader does not announce which chip it runs on; the host reads a
//! magic value from [`CHIP_DETECT_MAGIC_REG_ADDR`] after syncing and maps it
//! to a [`Chip`]. Everything that differs between chips in the flashing path
//! (SPI controller registers, bootloader offset, status trailer length,
//! FLASH_BEGIN layout) hangs off that enum.

use std::fmt;

/// Register holding the chip-detect magic value.
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x40001000;

/// Supported chips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Chip {
    /// ESP8266.
    Esp8266,
    /// ESP32.
    Esp32,
    /// ESP32-S2.
    Esp32s2,
    /// ESP32-S3.
    Esp32s3,
    /// ESP32-C2 / ESP8684.
    Esp32c2,
    /// ESP32-C3.
    Esp32c3,
    /// ESP32-C6.
    Esp32c6,
    /// ESP32-H2.
    Esp32h2,
}

const MAGIC_VALUES: &[(Chip, &[u32])] = &[
    (Chip::Esp8266, &[0xfff0c101]),
    (Chip::Esp32, &[0x00f01d83]),
    (Chip::Esp32s2, &[0x000007c6]),
    (Chip::Esp32s3, &[0x9]),
    (Chip::Esp32c2, &[0x6f51306f, 0x7c41a06f]),
    (
        Chip::Esp32c3,
        &[0x6921506f, 0x1b31506f, 0x4881606f, 0x4361606f],
    ),
    (Chip::Esp32c6, &[0x2ce0806f]),
    (Chip::Esp32h2, &[0xd7b73e80]),
];

impl Chip {
    /// All supported chips.
    pub const ALL: [Chip; 8] = [
        Chip::Esp8266,
        Chip::Esp32,
        Chip::Esp32s2,
        Chip::Esp32s3,
        Chip::Esp32c2,
        Chip::Esp32c3,
        Chip::Esp32c6,
        Chip::Esp32h2,
    ];

    /// Identify a chip from its detect-register magic value.
    pub fn from_magic(magic: u32) -> Option<Self> {
        MAGIC_VALUES
            .iter()
            .find(|(_, values)| values.contains(&magic))
            .map(|(chip, _)| *chip)
    }

    /// Magic values the detect register reports for this chip.
    pub fn magic_values(self) -> &'static [u32] {
        MAGIC_VALUES
            .iter()
            .find(|(chip, _)| *chip == self)
            .map_or(&[][..], |(_, values)| *values)
    }

    /// Get the chip from a string name (`esp32`, `esp32-s3`, `esp32s3`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "esp8266" => Some(Self::Esp8266),
            "esp32" => Some(Self::Esp32),
            "esp32s2" => Some(Self::Esp32s2),
            "esp32s3" => Some(Self::Esp32s3),
            "esp32c2" | "esp8684" => Some(Self::Esp32c2),
            "esp32c3" => Some(Self::Esp32c3),
            "esp32c6" => Some(Self::Esp32c6),
            "esp32h2" => Some(Self::Esp32h2),
            _ => None,
        }
    }

    /// Flash offset of the second-stage bootloader image.
    pub fn bootloader_offset(self) -> u32 {
        match self {
            Self::Esp32 | Self::Esp32s2 => 0x1000,
            _ => 0x0,
        }
    }

    /// Length of the status trailer in ROM responses.
    pub fn status_len(self) -> usize {
        match self {
            Self::Esp8266 => 2,
            _ => 4,
        }
    }

    /// Whether FLASH_BEGIN carries the trailing encryption flag.
    pub fn begin_has_encryption_flag(self) -> bool {
        !matches!(self, Self::Esp8266 | Self::Esp32)
    }

    /// Whether the flash must be attached with SPI_ATTACH before use.
    pub fn needs_spi_attach(self) -> bool {
        !matches!(self, Self::Esp8266)
    }

    /// Whether the image header carries the extended (24-byte) section.
    pub fn has_extended_header(self) -> bool {
        !matches!(self, Self::Esp8266)
    }

    /// SPI flash controller registers used for raw SPI commands.
    pub fn spi_registers(self) -> SpiRegisters {
        const S2_LAYOUT: (u32, u32, u32, u32) = (0x18, 0x1C, 0x20, 0x58);
        match self {
            Self::Esp8266 => SpiRegisters {
                base: 0x60000200,
                usr: 0x1c,
                usr1: 0x20,
                usr2: 0x24,
                w0: 0x40,
                mosi_dlen: None,
                miso_dlen: None,
            },
            Self::Esp32 => SpiRegisters {
                base: 0x3ff42000,
                usr: 0x1c,
                usr1: 0x20,
                usr2: 0x24,
                w0: 0x80,
                mosi_dlen: Some(0x28),
                miso_dlen: Some(0x2c),
            },
            Self::Esp32s2 => SpiRegisters::with_layout(0x3f402000, S2_LAYOUT),
            Self::Esp32s3 | Self::Esp32c2 | Self::Esp32c3 => {
                SpiRegisters::with_layout(0x60002000, S2_LAYOUT)
            },
            Self::Esp32c6 | Self::Esp32h2 => SpiRegisters::with_layout(0x60003000, S2_LAYOUT),
        }
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Esp8266 => "ESP8266",
            Self::Esp32 => "ESP32",
            Self::Esp32s2 => "ESP32-S2",
            Self::Esp32s3 => "ESP32-S3",
            Self::Esp32c2 => "ESP32-C2",
            Self::Esp32c3 => "ESP32-C3",
            Self::Esp32c6 => "ESP32-C6",
            Self::Esp32h2 => "ESP32-H2",
        })
    }
}

/// Addresses of the SPI flash controller registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiRegisters {
    base: u32,
    usr: u32,
    usr1: u32,
    usr2: u32,
    w0: u32,
    mosi_dlen: Option<u32>,
    miso_dlen: Option<u32>,
}

impl SpiRegisters {
    fn with_layout(base: u32, (usr, usr1, usr2, w0): (u32, u32, u32, u32)) -> Self {
        Self {
            base,
            usr,
            usr1,
            usr2,
            w0,
            mosi_dlen: Some(0x24),
            miso_dlen: Some(0x28),
        }
    }

    /// Command register (start bit `1 << 18`).
    pub fn cmd(&self) -> u32 {
        self.base
    }

    /// User register.
    pub fn usr(&self) -> u32 {
        self.base + self.usr
    }

    /// User register 1 (bit lengths on controllers without DLEN registers).
    pub fn usr1(&self) -> u32 {
        self.base + self.usr1
    }

    /// User register 2 (command value and length).
    pub fn usr2(&self) -> u32 {
        self.base + self.usr2
    }

    /// First data buffer word.
    pub fn w0(&self) -> u32 {
        self.base + self.w0
    }

    /// MOSI bit-length register, if present.
    pub fn mosi_dlen(&self) -> Option<u32> {
        self.mosi_dlen
            .map(|offset| self.base + offset)
    }

    /// MISO bit-length register, if present.
    pub fn miso_dlen(&self) -> Option<u32> {
        self.miso_dlen
            .map(|offset| self.base + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_magic() {
        assert_eq!(Chip::from_magic(0x00f01d83), Some(Chip::Esp32));
        assert_eq!(Chip::from_magic(0x1b31506f), Some(Chip::Esp32c3));
        assert_eq!(Chip::from_magic(0x9), Some(Chip::Esp32s3));
        assert_eq!(Chip::from_magic(0xdeadbeef), None);
    }

    #[test]
    fn test_magic_values_round_trip_every_chip() {
        for chip in Chip::ALL {
            let magic = chip.magic_values()[0];
            assert_eq!(Chip::from_magic(magic), Some(chip));
        }
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Chip::from_name("esp32"), Some(Chip::Esp32));
        assert_eq!(Chip::from_name("ESP32-S3"), Some(Chip::Esp32s3));
        assert_eq!(Chip::from_name("esp32_c6"), Some(Chip::Esp32c6));
        assert_eq!(Chip::from_name("rp2040"), None);
        assert_eq!(Chip::from_name(&Chip::Esp32h2.to_string()), Some(Chip::Esp32h2));
    }

    #[test]
    fn test_esp32_constants() {
        let chip = Chip::Esp32;
        assert_eq!(chip.bootloader_offset(), 0x1000);
        assert_eq!(chip.status_len(), 4);
        assert!(!chip.begin_has_encryption_flag());
        assert_eq!(Chip::Esp8266.status_len(), 2);
        assert!(Chip::Esp32c3.begin_has_encryption_flag());
        assert_eq!(Chip::Esp32c3.bootloader_offset(), 0);
    }

    #[test]
    fn test_spi_registers() {
        let regs = Chip::Esp32.spi_registers();
        assert_eq!(regs.cmd(), 0x3ff42000);
        assert_eq!(regs.w0(), 0x3ff42080);
        assert_eq!(regs.miso_dlen(), Some(0x3ff4202c));

        let regs = Chip::Esp32c3.spi_registers();
        assert_eq!(regs.usr(), 0x60002018);
        assert_eq!(regs.w0(), 0x60002058);
        assert_eq!(regs.mosi_dlen(), Some(0x60002024));

        assert_eq!(Chip::Esp8266.spi_registers().miso_dlen(), None);
    }
}
