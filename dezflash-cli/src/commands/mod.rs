//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod chip_id;
pub(crate) mod completions;
pub(crate) mod erase;
pub(crate) mod list_ports;
pub(crate) mod write_flash;

use {
    crate::{CliError, was_interrupted},
    anyhow::Result,
};

/// Fail with a cancellation if Ctrl-C was pressed.
pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted by user".to_string()).into())
    } else {
        Ok(())
    }
}
