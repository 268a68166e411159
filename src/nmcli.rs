//! Host radio backend on top of NetworkManager.
//!
//! The Wi-Fi radio is driven through `nmcli`; control lines are sysfs GPIO
//! pins when a pin number is configured and no-ops otherwise.

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use crate::radio::{Line, SocketPool};
use crate::settings::Settings;
use crate::traits::{ControlLine, Radio, RadioBackend};

pub const KEY_INTERFACE: &str = "RADIO_INTERFACE";
pub const KEY_PIN_CS: &str = "RADIO_PIN_CS";
pub const KEY_PIN_BUSY: &str = "RADIO_PIN_BUSY";
pub const KEY_PIN_RESET: &str = "RADIO_PIN_RESET";
pub const DEFAULT_INTERFACE: &str = "wlan0";

const GPIO_ROOT: &str = "/sys/class/gpio";
// NetworkManager device state for "connected"
const NM_STATE_ACTIVATED: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinePins {
    pub chip_select: Option<u32>,
    pub busy: Option<u32>,
    pub reset: Option<u32>,
}

impl LinePins {
    pub fn pin(&self, line: Line) -> Option<u32> {
        match line {
            Line::ChipSelect => self.chip_select,
            Line::Busy => self.busy,
            Line::Reset => self.reset,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkManagerBackend {
    interface: String,
    pins: LinePins,
    gpio_root: PathBuf,
}

impl NetworkManagerBackend {
    pub fn new(interface: impl Into<String>, pins: LinePins) -> Self {
        NetworkManagerBackend {
            interface: interface.into(),
            pins,
            gpio_root: PathBuf::from(GPIO_ROOT),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let pin = |key: &str| -> Option<u32> {
            settings.non_empty(key).and_then(|v| v.trim().parse().ok())
        };
        NetworkManagerBackend::new(
            settings
                .non_empty(KEY_INTERFACE)
                .unwrap_or_else(|| DEFAULT_INTERFACE.to_string()),
            LinePins {
                chip_select: pin(KEY_PIN_CS),
                busy: pin(KEY_PIN_BUSY),
                reset: pin(KEY_PIN_RESET),
            },
        )
    }

    pub fn with_gpio_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.gpio_root = root.into();
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl RadioBackend for NetworkManagerBackend {
    fn open_line(&mut self, line: Line) -> Result<Box<dyn ControlLine>> {
        match self.pins.pin(line) {
            Some(pin) => Ok(Box::new(SysfsGpioLine::export(&self.gpio_root, pin)?)),
            None => {
                debug!("{} line not wired", line);
                Ok(Box::new(UnwiredLine))
            }
        }
    }

    fn open_radio(&mut self) -> Result<Box<dyn Radio>> {
        Ok(Box::new(NmcliRadio {
            interface: self.interface.clone(),
        }))
    }
}

pub struct UnwiredLine;

impl ControlLine for UnwiredLine {
    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct SysfsGpioLine {
    root: PathBuf,
    pin: u32,
}

impl SysfsGpioLine {
    pub fn export(root: &Path, pin: u32) -> Result<Self> {
        if !root.join(format!("gpio{}", pin)).exists() {
            fs::write(root.join("export"), pin.to_string())
                .with_context(|| format!("failed to export GPIO {}", pin))?;
        }
        Ok(SysfsGpioLine {
            root: root.to_path_buf(),
            pin,
        })
    }
}

impl ControlLine for SysfsGpioLine {
    fn release(&mut self) -> Result<()> {
        match fs::write(self.root.join("unexport"), self.pin.to_string()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to unexport GPIO {}", self.pin)),
        }
    }
}

pub struct NmcliRadio {
    interface: String,
}

impl NmcliRadio {
    fn nmcli(&self, args: &[&str]) -> Result<Output> {
        let out = Command::new("nmcli")
            .args(args)
            .output()
            .context("failed to execute nmcli")?;
        check_status(args, out)
    }

    /// Runs nmcli with `input` on stdin, for secrets that must not show up
    /// in the process list.
    fn nmcli_with_input(&self, args: &[&str], input: &str) -> Result<Output> {
        let mut child = Command::new("nmcli")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to execute nmcli")?;
        if let Some(mut stdin) = child.stdin.take() {
            writeln!(stdin, "{}", input).context("failed to write to nmcli")?;
        }
        let out = child.wait_with_output().context("failed to wait for nmcli")?;
        check_status(args, out)
    }
}

fn check_status(args: &[&str], out: Output) -> Result<Output> {
    if !out.status.success() {
        let err = String::from_utf8_lossy(&out.stderr);
        return Err(anyhow!("nmcli {}: {}", args.first().unwrap_or(&""), err.trim()));
    }
    Ok(out)
}

/// Arguments for joining `ssid`. The passphrase is prompted for (`--ask`)
/// and fed on stdin, never passed as an argument.
pub fn connect_args<'a>(ssid: &'a str, interface: &'a str) -> [&'a str; 7] {
    ["--ask", "device", "wifi", "connect", ssid, "ifname", interface]
}

impl Radio for NmcliRadio {
    fn is_connected(&self) -> bool {
        match self.nmcli(&["-t", "-f", "GENERAL.STATE", "device", "show", self.interface.as_str()]) {
            Ok(out) => parse_device_state(&String::from_utf8_lossy(&out.stdout))
                .is_some_and(|state| state == NM_STATE_ACTIVATED),
            Err(e) => {
                debug!("Could not query {} state: {:#}", self.interface, e);
                false
            }
        }
    }

    fn connect(&mut self, ssid: &str, password: &str) -> Result<()> {
        info!("Joining '{}' on {}", ssid, self.interface);
        self.nmcli_with_input(&connect_args(ssid, &self.interface), password)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.nmcli(&["radio", "wifi", "off"])?;
        self.nmcli(&["radio", "wifi", "on"])?;
        Ok(())
    }

    fn socket_pool(&self) -> Result<SocketPool> {
        // The address is only known once associated; let the kernel route.
        Ok(SocketPool::unspecified().on_interface(self.interface.clone()))
    }
}

/// Parses `GENERAL.STATE:100 (connected)` into `100`.
pub fn parse_device_state(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let value = line.strip_prefix("GENERAL.STATE:")?;
        value.split_whitespace().next()?.parse().ok()
    })
}
