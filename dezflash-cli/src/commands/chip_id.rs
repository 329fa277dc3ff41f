//! `chip-id`: handshake and report the chip and its flash.

use {
    crate::{Cli, commands::ensure_not_interrupted, config::Config, connect_session, open_session},
    anyhow::Result,
    console::style,
    dezflash::{Chip, FlashSize},
};

/// Identity of the connected chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChipIdentity {
    pub chip: Chip,
    pub flash_id: u32,
}

impl ChipIdentity {
    /// JEDEC manufacturer byte.
    pub fn manufacturer(&self) -> u8 {
        self.flash_id
            .to_le_bytes()[0]
    }

    /// JEDEC memory type and capacity, in the order flash datasheets print them.
    pub fn device(&self) -> u16 {
        let [_, memory_type, capacity, _] = self
            .flash_id
            .to_le_bytes();
        u16::from_be_bytes([memory_type, capacity])
    }

    /// Capacity decoded from the id, when it is a known size.
    pub fn flash_size(&self) -> Option<FlashSize> {
        FlashSize::from_jedec_id(self.flash_id)
    }

    pub fn to_json(self) -> serde_json::Value {
        serde_json::json!({
            "chip": self.chip.to_string(),
            "flash_id": format!("0x{:06X}", self.flash_id),
            "manufacturer": format!("0x{:02X}", self.manufacturer()),
            "device": format!("0x{:04X}", self.device()),
            "flash_size": self.flash_size().map(|size| size.to_string()),
        })
    }
}

/// `chip-id` command implementation.
pub(crate) fn cmd_chip_id(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let mut session = open_session(cli, config)?;
    ensure_not_interrupted()?;
    let chip = connect_session(cli, &mut session)?;
    let flash_id = session.flash_id()?;
    session.hard_reset()?;

    let identity = ChipIdentity { chip, flash_id };
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&identity.to_json()).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("{}", style("Chip").bold().underlined());
    eprintln!("  Chip type:     {}", style(identity.chip).cyan().bold());
    eprintln!("  Manufacturer:  0x{:02X}", identity.manufacturer());
    eprintln!("  Device:        0x{:04X}", identity.device());
    eprintln!(
        "  Flash size:    {}",
        identity
            .flash_size()
            .map_or_else(|| "unknown".to_string(), |size| size.to_string())
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_splits_jedec_id() {
        let identity = ChipIdentity {
            chip: Chip::Esp32,
            flash_id: 0x16_40EF,
        };
        assert_eq!(identity.manufacturer(), 0xEF);
        assert_eq!(identity.device(), 0x4016);
        assert_eq!(identity.flash_size(), Some(FlashSize::_4Mb));
    }

    #[test]
    fn test_identity_unknown_capacity() {
        let identity = ChipIdentity {
            chip: Chip::Esp32c3,
            flash_id: 0x00_4020,
        };
        assert_eq!(identity.flash_size(), None);
        assert!(identity.to_json()["flash_size"].is_null());
    }

    #[test]
    fn test_identity_json_fields() {
        let json = ChipIdentity {
            chip: Chip::Esp32s3,
            flash_id: 0x18_4020,
        }
        .to_json();
        assert_eq!(json["chip"], "ESP32-S3");
        assert_eq!(json["flash_id"], "0x184020");
        assert_eq!(json["manufacturer"], "0x20");
        assert_eq!(json["device"], "0x4018");
        assert_eq!(json["flash_size"], "16MB");
    }
}
