//! Configuration file support for dezflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (DEZFLASH_*)
//! 3. Local config file (./dezflash.toml or ./dezflash_ports.toml)
//! 4. Global config file (~/.config/dezflash/config.toml)
//!
//! `--config PATH` replaces the file sources entirely.

use {
    crate::CliError,
    directories::ProjectDirs,
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

/// Local configuration file name.
pub const LOCAL_CONFIG_FILE: &str = "dezflash.toml";

/// Local file holding remembered ports.
const LOCAL_PORTS_FILE: &str = "dezflash_ports.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate used for the handshake.
    pub baud: Option<u32>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Known USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Defaults for `write-flash`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Flash size written into the bootloader header ("4MB", ...).
    pub flash_size: Option<String>,
    /// SPI clock written into the bootloader header ("40m", ...).
    pub flash_freq: Option<String>,
    /// SPI mode written into the bootloader header ("dio", ...).
    pub flash_mode: Option<String>,
    /// Bulk erase before writing.
    pub erase_all: Option<bool>,
    /// Deflate images before sending them.
    pub compress: Option<bool>,
}

/// Bootloader session tunables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoaderSettings {
    /// Handshake attempts before giving up.
    pub connect_attempts: Option<usize>,
    /// Per-block acknowledgement timeout in milliseconds.
    pub block_timeout_ms: Option<u64>,
    /// Baud rate to switch to after the handshake.
    pub target_baud: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Loader configuration.
    #[serde(default)]
    pub loader: LoaderSettings,
}

impl Config {
    /// Load configuration from all available sources.
    ///
    /// Unreadable or invalid files are reported and skipped.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        if let Some(ports_config) = Self::load_ports_config() {
            config
                .port
                .usb_device
                .extend(ports_config.usb_device);
            if ports_config
                .connection
                .serial
                .is_some()
            {
                config.port.connection = ports_config.connection;
            }
        }

        config
    }

    /// Load configuration from a file named with `--config`.
    ///
    /// Unlike the implicit sources, a file the user asked for must exist and
    /// parse.
    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        let content = fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        let config = toml::from_str(&content).map_err(|e| {
            CliError::Config(format!(
                "Failed to parse config file {}: {e}",
                path.display()
            ))
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    fn load_ports_config() -> Option<PortConfig> {
        let candidates = std::iter::once(PathBuf::from(LOCAL_PORTS_FILE))
            .chain(Self::global_config_dir().map(|dir| dir.join("ports.toml")));

        for path in candidates {
            if !path.exists() {
                continue;
            }
            match fs::read_to_string(&path)
                .ok()
                .map(|content| toml::from_str::<PortConfig>(&content))
            {
                Some(Ok(config)) => {
                    debug!("Loaded ports config from {}", path.display());
                    return Some(config);
                },
                Some(Err(e)) => warn!("Failed to parse config file {}: {}", path.display(), e),
                None => warn!("Failed to read config file {}", path.display()),
            }
        }

        None
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "dezflash").map(|dirs| {
            dirs.config_dir()
                .to_path_buf()
        })
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        let Self { port, flash, loader } = other;

        take_set(&mut self.port.connection.serial, port.connection.serial);
        take_set(&mut self.port.connection.baud, port.connection.baud);
        self.port
            .usb_device
            .extend(port.usb_device);

        take_set(&mut self.flash.flash_size, flash.flash_size);
        take_set(&mut self.flash.flash_freq, flash.flash_freq);
        take_set(&mut self.flash.flash_mode, flash.flash_mode);
        take_set(&mut self.flash.erase_all, flash.erase_all);
        take_set(&mut self.flash.compress, flash.compress);

        take_set(&mut self.loader.connect_attempts, loader.connect_attempts);
        take_set(&mut self.loader.block_timeout_ms, loader.block_timeout_ms);
        take_set(&mut self.loader.target_baud, loader.target_baud);
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };

        if self
            .port
            .usb_device
            .contains(&device)
        {
            return Ok(());
        }

        // Prefer the local file when the project already has local config
        let path = if Path::new(LOCAL_PORTS_FILE).exists() || Path::new(LOCAL_CONFIG_FILE).exists()
        {
            PathBuf::from(LOCAL_PORTS_FILE)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from(LOCAL_PORTS_FILE)
        };

        self.port
            .usb_device
            .push(device);

        let content = toml::to_string_pretty(&self.port)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}

fn take_set<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tempfile::tempdir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.port.connection.serial.is_none());
        assert!(config.port.usb_device.is_empty());
        assert!(config.flash.flash_size.is_none());
        assert!(config.flash.erase_all.is_none());
        assert!(config.loader.connect_attempts.is_none());
    }

    #[test]
    fn test_usb_device_matches() {
        let device = UsbDevice {
            vid: 0x10C4,
            pid: 0xEA60,
        };
        assert!(device.matches(0x10C4, 0xEA60));
        assert!(!device.matches(0x10C4, 0xEA70));
        assert!(!device.matches(0x1A86, 0xEA60));
    }

    #[test]
    fn test_config_merge_overrides_set_values() {
        let mut base = Config::default();
        base.port.connection.serial = Some("/dev/ttyUSB0".to_string());
        base.flash.flash_size = Some("2MB".to_string());
        base.loader.target_baud = Some(460_800);

        let mut other = Config::default();
        other.flash.flash_size = Some("4MB".to_string());
        other.flash.erase_all = Some(false);
        other.loader.connect_attempts = Some(8);

        base.merge(other);

        assert_eq!(base.port.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.flash.flash_size.as_deref(), Some("4MB"));
        assert_eq!(base.flash.erase_all, Some(false));
        assert_eq!(base.loader.connect_attempts, Some(8));
        assert_eq!(base.loader.target_baud, Some(460_800));
    }

    #[test]
    fn test_config_merge_usb_devices_extend() {
        let mut base = Config::default();
        base.port.usb_device.push(UsbDevice { vid: 0x1A86, pid: 0x7523 });

        let mut other = Config::default();
        other.port.usb_device.push(UsbDevice { vid: 0x10C4, pid: 0xEA60 });

        base.merge(other);
        assert_eq!(base.port.usb_device.len(), 2);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[port.connection]
serial = "/dev/ttyUSB0"
baud = 115200

[[port.usb_device]]
vid = 4292
pid = 60000

[flash]
flash_size = "4MB"
flash_freq = "80m"
flash_mode = "dio"
erase_all = false
compress = true

[loader]
connect_attempts = 7
block_timeout_ms = 5000
target_baud = 921600
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.port.connection.baud, Some(115_200));
        assert_eq!(config.port.usb_device[0], UsbDevice { vid: 0x10C4, pid: 0xEA60 });
        assert_eq!(config.flash.flash_size.as_deref(), Some("4MB"));
        assert_eq!(config.flash.flash_freq.as_deref(), Some("80m"));
        assert_eq!(config.flash.flash_mode.as_deref(), Some("dio"));
        assert_eq!(config.flash.erase_all, Some(false));
        assert_eq!(config.flash.compress, Some(true));
        assert_eq!(config.loader.connect_attempts, Some(7));
        assert_eq!(config.loader.block_timeout_ms, Some(5000));
        assert_eq!(config.loader.target_baud, Some(921_600));
    }

    #[test]
    fn test_config_from_partial_toml() {
        let config: Config = toml::from_str("[loader]\ntarget_baud = 460800\n").unwrap();
        assert!(config.port.connection.serial.is_none());
        assert!(config.flash.compress.is_none());
        assert_eq!(config.loader.target_baud, Some(460_800));
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[port.connection]\nserial = \"/dev/ttyUSB1\"\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyUSB1"));
    }

    #[test]
    fn test_load_from_path_missing_is_config_error() {
        let dir = tempdir().unwrap();
        let err = Config::load_from_path(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }

    #[test]
    fn test_load_from_path_invalid_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invalid toml [[[").unwrap();

        let err = Config::load_from_path(&path).unwrap_err();
        assert!(matches!(err, CliError::Config(ref msg) if msg.contains("Failed to parse")));
    }

    #[test]
    fn test_load_from_file_skips_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOCAL_CONFIG_FILE);
        fs::write(&path, "[flash\nflash_size = ").unwrap();
        assert!(Config::load_from_file(&path).is_none());
    }

    #[test]
    fn test_global_config_path_names_dezflash() {
        if let Some(p) = Config::global_config_path() {
            let p = p.to_string_lossy();
            assert!(p.contains("dezflash"));
            assert!(p.ends_with("config.toml"));
        }
    }
}
