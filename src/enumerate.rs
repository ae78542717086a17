//! Device enumeration
//!
//! [`DeviceSource`] produces fresh device records per bus. [`SystemDevices`]
//! reads them from `pciconf -l` and `usbconfig`; [`DeviceList`] keeps the
//! records the daemon has seen and admits only new identities.

use async_trait::async_trait;
use driverd_types::{BusKind, DeviceIdentity, DeviceRecord, Interface};
use std::collections::HashSet;
use std::ops::Range;
use std::path::PathBuf;
use tracing::debug;

use crate::command::{capture, CommandError};

#[derive(Debug, thiserror::Error)]
pub enum EnumerationError {
    #[error("failed to enumerate {bus} devices: {source}")]
    Command {
        bus: BusKind,
        #[source]
        source: CommandError,
    },
}

#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn pci_devices(&self) -> Result<Vec<DeviceRecord>, EnumerationError>;

    async fn usb_devices(&self) -> Result<Vec<DeviceRecord>, EnumerationError>;
}

/// Enumeration through the base-system tools
pub struct SystemDevices {
    pciconf: PathBuf,
    usbconfig: PathBuf,
}

impl Default for SystemDevices {
    fn default() -> Self {
        Self::new("/usr/sbin/pciconf", "/usr/sbin/usbconfig")
    }
}

impl SystemDevices {
    pub fn new(pciconf: impl Into<PathBuf>, usbconfig: impl Into<PathBuf>) -> Self {
        Self {
            pciconf: pciconf.into(),
            usbconfig: usbconfig.into(),
        }
    }
}

#[async_trait]
impl DeviceSource for SystemDevices {
    async fn pci_devices(&self) -> Result<Vec<DeviceRecord>, EnumerationError> {
        let out = capture(&self.pciconf, &["-l"])
            .await
            .map_err(|source| EnumerationError::Command {
                bus: BusKind::Pci,
                source,
            })?;
        Ok(parse_pciconf(&out))
    }

    async fn usb_devices(&self) -> Result<Vec<DeviceRecord>, EnumerationError> {
        let out = capture(&self.usbconfig, &["dump_device_desc", "dump_all_config_desc"])
            .await
            .map_err(|source| EnumerationError::Command {
                bus: BusKind::Usb,
                source,
            })?;
        Ok(parse_usbconfig(&out))
    }
}

// ============================================================================
// pciconf
// ============================================================================

/// Parse `pciconf -l` output.
///
/// Understands both the `vendor= device= subvendor= subdevice=` layout and
/// the older `chip=0xDDDDVVVV card=0xSSSSVVVV` one.
pub fn parse_pciconf(output: &str) -> Vec<DeviceRecord> {
    output.lines().filter_map(parse_pciconf_line).collect()
}

fn parse_pciconf_line(line: &str) -> Option<DeviceRecord> {
    let (selector, fields) = line.split_once(char::is_whitespace)?;
    if !selector.contains("@pci") {
        return None;
    }

    let mut vendor = None;
    let mut device = None;
    let mut dev = DeviceRecord::pci(0, 0);

    for (key, value) in fields.split_whitespace().filter_map(|t| t.split_once('=')) {
        let Some(value) = parse_hex_u32(value) else {
            continue;
        };
        match key {
            "vendor" => vendor = Some(value as u16),
            "device" => device = Some(value as u16),
            "subvendor" => dev.subvendor = value as u16,
            "subdevice" => dev.subdevice = value as u16,
            "rev" => dev.revision = value as u16,
            "class" => {
                dev.class = ((value >> 16) & 0xff) as u16;
                dev.subclass = ((value >> 8) & 0xff) as u16;
            }
            "chip" => {
                vendor = Some((value & 0xffff) as u16);
                device = Some((value >> 16) as u16);
            }
            "card" => {
                dev.subvendor = (value & 0xffff) as u16;
                dev.subdevice = (value >> 16) as u16;
            }
            _ => {}
        }
    }

    dev.vendor = vendor?;
    dev.device = device?;
    Some(dev)
}

// ============================================================================
// usbconfig
// ============================================================================

/// Parse `usbconfig dump_device_desc dump_all_config_desc` output.
///
/// Alternate interface settings are skipped; every primary interface of every
/// configuration is attached to its device.
pub fn parse_usbconfig(output: &str) -> Vec<DeviceRecord> {
    let mut devices = Vec::new();
    let mut current: Option<UsbDeviceBuilder> = None;
    let mut in_alt_setting = false;

    for line in output.lines() {
        if line.starts_with("ugen") {
            if let Some(done) = current.take().and_then(UsbDeviceBuilder::build) {
                devices.push(done);
            }
            current = Some(UsbDeviceBuilder::default());
            in_alt_setting = false;
            continue;
        }
        let Some(builder) = current.as_mut() else {
            continue;
        };

        let trimmed = line.trim();
        if let Some(header) = trimmed.strip_prefix("Interface ") {
            in_alt_setting = header.contains("Alt");
            builder.pending = PendingInterface::default();
            continue;
        }

        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        let Some(value) = value.split_whitespace().next().and_then(parse_hex_u32) else {
            continue;
        };
        let value = value as u16;

        match key.trim() {
            "idVendor" => builder.vendor = Some(value),
            "idProduct" => builder.device = Some(value),
            "bDeviceClass" => builder.class = value,
            "bDeviceSubClass" => builder.subclass = value,
            "bcdDevice" => builder.revision = value,
            "bInterfaceClass" if !in_alt_setting => builder.pending.class = Some(value),
            "bInterfaceSubClass" if !in_alt_setting => builder.pending.subclass = Some(value),
            "bInterfaceProtocol" if !in_alt_setting => {
                builder.pending.protocol = Some(value);
                builder.flush_interface();
            }
            _ => {}
        }
    }

    if let Some(done) = current.and_then(UsbDeviceBuilder::build) {
        devices.push(done);
    }
    devices
}

#[derive(Default)]
struct PendingInterface {
    class: Option<u16>,
    subclass: Option<u16>,
    protocol: Option<u16>,
}

#[derive(Default)]
struct UsbDeviceBuilder {
    vendor: Option<u16>,
    device: Option<u16>,
    class: u16,
    subclass: u16,
    revision: u16,
    interfaces: Vec<Interface>,
    pending: PendingInterface,
}

impl UsbDeviceBuilder {
    fn flush_interface(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        if let (Some(class), Some(subclass), Some(protocol)) =
            (pending.class, pending.subclass, pending.protocol)
        {
            self.interfaces.push(Interface::new(class, subclass, protocol));
        }
    }

    fn build(self) -> Option<DeviceRecord> {
        let mut dev = DeviceRecord::usb(self.vendor?, self.device?)
            .with_class(self.class, self.subclass)
            .with_revision(self.revision);
        dev.interfaces = self.interfaces;
        Some(dev)
    }
}

fn parse_hex_u32(s: &str) -> Option<u32> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    u32::from_str_radix(digits, 16).ok()
}

// ============================================================================
// Device list
// ============================================================================

/// Devices known to the daemon, unique by identity
#[derive(Debug, Default)]
pub struct DeviceList {
    devices: Vec<DeviceRecord>,
    seen: HashSet<DeviceIdentity>,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Append the records whose identity is new; returns the index range of
    /// the appended records.
    pub fn admit(&mut self, records: impl IntoIterator<Item = DeviceRecord>) -> Range<usize> {
        let start = self.devices.len();
        for record in records {
            let identity = record.identity();
            if self.seen.insert(identity) {
                self.devices.push(record);
            } else {
                debug!(device = %record, "Device already known");
            }
        }
        start..self.devices.len()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.iter()
    }
}

/// Fixed device tables (for testing)
#[cfg(test)]
pub struct StaticDevices {
    pub pci: Vec<DeviceRecord>,
    pub usb: std::sync::Mutex<Vec<DeviceRecord>>,
}

#[cfg(test)]
#[async_trait]
impl DeviceSource for StaticDevices {
    async fn pci_devices(&self) -> Result<Vec<DeviceRecord>, EnumerationError> {
        Ok(self.pci.clone())
    }

    async fn usb_devices(&self) -> Result<Vec<DeviceRecord>, EnumerationError> {
        Ok(self.usb.lock().unwrap().clone())
    }
}
