//! Chip identification and flash geometry.

pub mod chip;
pub mod flash;

pub use {
    chip::{CHIP_DETECT_MAGIC_REG_ADDR, Chip, SpiRegisters},
    flash::{
        FlashFrequency, FlashMode, FlashSettings, FlashSize, check_image_header, patch_image_header,
    },
};
