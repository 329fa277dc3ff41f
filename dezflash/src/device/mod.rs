//! Serial device discovery and classification.
//!
//! ESP development boards show up either behind a USB-UART bridge (CP210x,
//! CH34x, FTDI) or, on the S2/S3/C3/C6/H2, as Espressif's own USB
//! Serial/JTAG or CDC device. Discovery classifies each port by VID/PID so
//! the front end can pick a likely board automatically.

#[cfg(feature = "native")]
use {
    crate::port::{NativePortEnumerator, PortEnumerator},
    log::{debug, info, trace},
};
use {
    crate::{
        error::{Error, Result},
        port::PortInfo,
    },
    std::fmt,
};

/// Known USB bridge/device kinds found on ESP boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceKind {
    /// Silicon Labs CP210x USB-to-UART bridge.
    Cp210x,
    /// WCH CH340/CH341/CH9102 USB-to-UART bridge.
    Ch34x,
    /// FTDI FT232/FT2232 USB-to-UART bridge.
    Ftdi,
    /// Espressif native USB (Serial/JTAG or CDC-ACM).
    Espressif,
    /// Unknown device.
    Unknown,
}

/// Espressif's USB vendor id.
pub const ESPRESSIF_VID: u16 = 0x303A;

/// Known USB VID/PID pairs; an empty PID list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], DeviceKind::Cp210x),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x55D4, 0x55D3],
        DeviceKind::Ch34x,
    ),
    (0x0403, &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015], DeviceKind::Ftdi),
    (ESPRESSIF_VID, &[], DeviceKind::Espressif),
];

impl DeviceKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cp210x => "CP210x",
            Self::Ch34x => "CH34x",
            Self::Ftdi => "FTDI",
            Self::Espressif => "Espressif USB",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the kind is one of the known ESP board interfaces.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Whether the kind should win during auto-selection.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::Espressif | Self::Cp210x | Self::Ch34x)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A discovered serial port with its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let device = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceKind::from_vid_pid(vid, pid),
            _ => DeviceKind::Unknown,
        };
        Self {
            name: info.name,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

/// Enumerate every serial port with its classification.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(DetectedPort::from)
            .inspect(|port| {
                trace!(
                    "Found port {} ({}, VID {:04X?}, PID {:04X?})",
                    port.name, port.device, port.vid, port.pid
                );
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Enumerate serial ports (no port backend compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the best candidate out of `ports`.
///
/// Espressif native USB wins, then the common bridges, then any known
/// device, then the first port.
pub fn select_best_port(ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    if let Some(port) = ports
        .iter()
        .find(|p| p.device == DeviceKind::Espressif)
    {
        info_selected("Espressif USB device", port);
        return Ok(port.clone());
    }

    if let Some(port) = ports
        .iter()
        .find(|p| {
            p.device
                .is_high_priority()
        })
        .or_else(|| {
            ports
                .iter()
                .find(|p| {
                    p.device
                        .is_known()
                })
        })
    {
        info_selected(&format!("{} USB-UART bridge", port.device), port);
        return Ok(port.clone());
    }

    ports
        .into_iter()
        .next()
        .inspect(|port| info_selected("first available port", port))
        .ok_or(Error::DeviceNotFound)
}

#[cfg(feature = "native")]
fn info_selected(what: &str, port: &DetectedPort) {
    info!("Auto-detected {what}: {}", port.name);
}

#[cfg(not(feature = "native"))]
fn info_selected(_what: &str, _port: &DetectedPort) {}

/// Auto-detect a single ESP board port.
pub fn auto_detect_port() -> Result<DetectedPort> {
    select_best_port(detect_ports())
}

/// Find a port whose name contains `pattern`.
pub fn find_port_by_pattern(pattern: &str) -> Result<DetectedPort> {
    detect_ports()
        .into_iter()
        .find(|p| {
            p.name
                .contains(pattern)
        })
        .ok_or(Error::DeviceNotFound)
}

/// Format a list of detected ports for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port
                .device
                .is_known()
            {
                format!(" [{}]", port.device)
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };

            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();

            format!("{}{device_info}{product_info}", port.name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, vid: Option<u16>, pid: Option<u16>) -> DetectedPort {
        DetectedPort::from(PortInfo {
            name: name.to_string(),
            vid,
            pid,
            manufacturer: None,
            product: None,
            serial_number: None,
        })
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x55D4), DeviceKind::Ch34x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6001), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x303A, 0x1001), DeviceKind::Espressif);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0x0001), DeviceKind::Unknown);
        assert_eq!(DeviceKind::from_vid_pid(0x1234, 0x5678), DeviceKind::Unknown);
    }

    #[test]
    fn test_port_info_classification() {
        assert_eq!(
            port("/dev/ttyUSB0", Some(0x10C4), Some(0xEA60)).device,
            DeviceKind::Cp210x
        );
        assert_eq!(port("/dev/ttyS0", None, None).device, DeviceKind::Unknown);
    }

    #[test]
    fn test_select_best_port_prefers_native_usb() {
        let ports = vec![
            port("/dev/ttyS0", None, None),
            port("/dev/ttyUSB0", Some(0x0403), Some(0x6001)),
            port("/dev/ttyUSB1", Some(0x1A86), Some(0x7523)),
            port("/dev/ttyACM0", Some(0x303A), Some(0x1001)),
        ];
        assert_eq!(
            select_best_port(ports.clone())
                .unwrap()
                .name,
            "/dev/ttyACM0"
        );
        assert_eq!(
            select_best_port(ports[..3].to_vec())
                .unwrap()
                .name,
            "/dev/ttyUSB1"
        );
        assert_eq!(
            select_best_port(ports[..2].to_vec())
                .unwrap()
                .name,
            "/dev/ttyUSB0"
        );
        assert_eq!(
            select_best_port(ports[..1].to_vec())
                .unwrap()
                .name,
            "/dev/ttyS0"
        );
        assert!(matches!(
            select_best_port(Vec::new()),
            Err(Error::DeviceNotFound)
        ));
    }

    #[test]
    fn test_format_port_list() {
        let mut bridge = port("/dev/ttyUSB0", Some(0x10C4), Some(0xEA60));
        bridge.product = Some("CP2102 USB to UART Bridge Controller".to_string());
        let ports = vec![
            bridge,
            port("/dev/ttyUSB1", Some(0x1234), Some(0x5678)),
            port("/dev/ttyS0", None, None),
        ];

        let formatted = format_port_list(&ports);
        assert_eq!(
            formatted[0],
            "/dev/ttyUSB0 [CP210x] - CP2102 USB to UART Bridge Controller"
        );
        assert_eq!(formatted[1], "/dev/ttyUSB1 [VID:1234 PID:5678]");
        assert_eq!(formatted[2], "/dev/ttyS0");
    }
}
