//! ROM bootloader wire protocol.

pub mod command;
pub mod slip;

// Re-export common types
pub use {
    command::{CommandFrame, FLASH_WRITE_SIZE, Opcode, Response, checksum},
    slip::SlipDecoder,
};
