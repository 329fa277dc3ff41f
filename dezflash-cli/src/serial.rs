//! Interactive serial port selection.
//!
//! Ports are chosen in this order:
//! - the `--port` flag or `DEZFLASH_PORT`
//! - the port remembered in configuration
//! - the only recognised ESP board, or a `dialoguer` prompt when there are
//!   several candidates
//!
//! Non-interactive mode never prompts and fails with a usage error instead.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dezflash::{DetectedPort, DeviceKind, discover_ports},
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// List all ports (including unknown types).
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
    /// Force confirmation even for single recognized port.
    pub confirm_port: bool,
}

/// Result of port selection including whether it was a known device.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known/configured device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    // Selection failures are setup problems: exit 2, not 1.
    CliError::Usage(message.to_string()).into()
}

fn select_non_interactive_port(
    selection_ports: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    let mut ports = selection_ports.into_iter();
    match (ports.next(), ports.next()) {
        (Some(port), None) => Ok(SelectedPort {
            is_known: is_known_device(&port, config),
            port,
        }),
        (Some(_), Some(_)) => Err(usage_err(
            "Found multiple serial ports; pass --port to choose one in non-interactive mode",
        )),
        (None, _) => Err(usage_err("No usable serial port available")),
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    if let Some(port_name) = &config
        .port
        .connection
        .serial
    {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    let ports = discover_ports();
    if ports.is_empty() {
        return Err(usage_err(
            "No serial ports found; connect a board or pass --port",
        ));
    }

    let known_ports: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();

    // Known boards first unless the user asks for everything
    let selection_ports: Vec<DetectedPort> = if options.list_all_ports || known_ports.is_empty() {
        ports
    } else {
        known_ports
    };

    if options.non_interactive {
        return select_non_interactive_port(selection_ports, config);
    }

    match selection_ports
        .len()
        .cmp(&1)
    {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(selection_ports, config)
        },
        Ordering::Equal => {
            let mut selection_ports = selection_ports;
            let port = selection_ports.remove(0);
            let is_known = is_known_device(&port, config);

            if is_known && !options.confirm_port {
                info!("Auto-selected port: {} [{}]", port.name, port.device);
                Ok(SelectedPort { port, is_known })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Less => Err(usage_err("No usable serial port available")),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; pass --port instead",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            CliError::Cancelled("Port selection cancelled".to_string()).into()
        },
        DialoguerError::IO(io_err) => usage_err(&format!("Port prompt failed: {io_err}")),
    }
}

/// Find a port by name, falling back to an unclassified entry.
fn find_port_by_name(name: &str) -> SelectedPort {
    let ports = discover_ports();

    // Exact match first, then case-insensitive for Windows COM names
    let found = ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| {
            ports
                .iter()
                .find(|p| {
                    p.name
                        .eq_ignore_ascii_case(name)
                })
        });

    if let Some(port) = found {
        return SelectedPort {
            port: port.clone(),
            is_known: port
                .device
                .is_known(),
        };
    }

    SelectedPort {
        port: DetectedPort {
            name: name.to_string(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        },
        is_known: false,
    }
}

/// Check if a port matches a known device (from config or built-in list).
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port
        .device
        .is_known()
    {
        return true;
    }

    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .port
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid)),
        _ => false,
    }
}

fn port_label(port: &DetectedPort, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name)
            .bold()
            .to_string()
    } else {
        port.name
            .clone()
    };

    let device_info = if port
        .device
        .is_known()
    {
        format!(" [{}]", style(port.device).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{device_info}{product}")
}

fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!(
        "{}",
        style("Recognised ESP boards are shown in bold").dim()
    );

    ports.sort_by_key(|p| !is_known_device(p, config));

    // Keep labels on one line in narrow terminals
    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| {
            console::truncate_str(&port_label(port, config), max_item_width, "\u{2026}")
                .into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the serial port of your board")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            let is_known = is_known_device(&port, config);
            Ok(SelectedPort { port, is_known })
        },
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}

fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use serial port {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(CliError::Cancelled("Port selection cancelled".to_string()).into())
    }
}

/// Ask user if they want to remember this port.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config
        .port
        .usb_device
        .iter()
        .any(|device| device.matches(vid, pid))
    {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this device for automatic selection?")
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        console::{measure_text_width, truncate_str},
    };

    fn port(name: &str, device: DeviceKind, vid: Option<u16>, pid: Option<u16>) -> DetectedPort {
        DetectedPort {
            name: name.to_string(),
            device,
            vid,
            pid,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    fn assert_usage(result: Result<SelectedPort>) {
        let err = result
            .err()
            .expect("expected error");
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_serial_options_default() {
        let options = SerialOptions::default();
        assert!(options.port.is_none());
        assert!(!options.list_all_ports);
        assert!(!options.non_interactive);
        assert!(!options.confirm_port);
    }

    #[test]
    fn test_explicit_port_wins() {
        let options = SerialOptions {
            port: Some("NOT_A_REAL_PORT_XYZ".to_string()),
            non_interactive: true,
            ..Default::default()
        };
        let selected = select_serial_port(&options, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "NOT_A_REAL_PORT_XYZ");
        assert_eq!(selected.port.device, DeviceKind::Unknown);
        assert!(!selected.is_known);
    }

    #[test]
    fn test_config_port_used_when_no_flag() {
        let mut config = Config::default();
        config.port.connection.serial = Some("CONFIGURED_PORT_XYZ".to_string());
        let selected = select_serial_port(&SerialOptions::default(), &config).unwrap();
        assert_eq!(selected.port.name, "CONFIGURED_PORT_XYZ");
    }

    #[test]
    fn test_is_known_device_builtin() {
        let p = port("/dev/ttyUSB0", DeviceKind::Cp210x, Some(0x10C4), Some(0xEA60));
        assert!(is_known_device(&p, &Config::default()));
    }

    #[test]
    fn test_is_known_device_from_config() {
        let p = port("/dev/ttyUSB0", DeviceKind::Unknown, Some(0xABCD), Some(0x1234));
        assert!(!is_known_device(&p, &Config::default()));

        let mut config = Config::default();
        config
            .port
            .usb_device
            .push(crate::config::UsbDevice {
                vid: 0xABCD,
                pid: 0x1234,
            });
        assert!(is_known_device(&p, &config));
    }

    #[test]
    fn test_is_known_device_no_vid_pid() {
        let p = port("/dev/ttyS0", DeviceKind::Unknown, None, None);
        assert!(!is_known_device(&p, &Config::default()));
    }

    #[test]
    fn test_port_label_truncation_keeps_one_line() {
        let mut p = port("/dev/verylongttyusb0", DeviceKind::Espressif, Some(0x303A), Some(0x1001));
        p.product = Some("USB JTAG/serial debug unit".to_string());
        let label = port_label(&p, &Config::default());
        let truncated = truncate_str(&label, 26, "\u{2026}").into_owned();
        assert!(!truncated.contains('\n'));
        assert!(measure_text_width(&truncated) <= 26);
    }

    #[test]
    fn test_select_non_interactive_multiple_ports_returns_usage_error() {
        let ports = vec![
            port("/dev/ttyUSB0", DeviceKind::Unknown, None, None),
            port("/dev/ttyUSB1", DeviceKind::Unknown, None, None),
        ];
        assert_usage(select_non_interactive_port(ports, &Config::default()));
    }

    #[test]
    fn test_select_non_interactive_no_ports_returns_usage_error() {
        assert_usage(select_non_interactive_port(vec![], &Config::default()));
    }

    #[test]
    fn test_select_non_interactive_single_port_returns_selected_port() {
        let ports = vec![port("/dev/ttyACM0", DeviceKind::Espressif, Some(0x303A), Some(0x1001))];
        let selected = select_non_interactive_port(ports, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyACM0");
        assert!(selected.is_known);
    }
}
