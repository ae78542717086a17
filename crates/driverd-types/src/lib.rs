//! Shared device types for driverd
//!
//! A [`DeviceRecord`] is produced by device enumeration and consumed by both
//! resolvers (the driver database matcher and the PNP hints resolver). The
//! orchestrator is the only component that mutates a record after creation,
//! and only by appending driver names.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// BUS
// ============================================================================

/// Bus a device was enumerated on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Pci,
    Usb,
}

impl BusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pci => "PCI",
            Self::Usb => "USB",
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// INTERFACES
// ============================================================================

/// USB interface descriptor (class, subclass, protocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interface {
    pub class: u16,
    pub subclass: u16,
    pub protocol: u16,
}

impl Interface {
    pub fn new(class: u16, subclass: u16, protocol: u16) -> Self {
        Self {
            class,
            subclass,
            protocol,
        }
    }
}

// ============================================================================
// DEVICE RECORD
// ============================================================================

/// Identity used to tell newly attached devices from known ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity {
    pub bus: BusKind,
    pub vendor: u16,
    pub device: u16,
    pub class: u16,
    pub subclass: u16,
}

/// A single enumerated PCI or USB device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub bus: BusKind,
    pub vendor: u16,
    pub device: u16,
    #[serde(default)]
    pub subvendor: u16,
    #[serde(default)]
    pub subdevice: u16,
    #[serde(default)]
    pub class: u16,
    #[serde(default)]
    pub subclass: u16,
    #[serde(default)]
    pub revision: u16,
    /// Interface descriptors, only populated for USB devices
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    /// Human-readable description from the PCI/USB ID database
    #[serde(default)]
    pub description: Option<String>,
    /// Driver names attributed so far. Append-only, no duplicates.
    #[serde(default)]
    drivers: Vec<String>,
}

impl DeviceRecord {
    pub fn new(bus: BusKind, vendor: u16, device: u16) -> Self {
        Self {
            bus,
            vendor,
            device,
            subvendor: 0,
            subdevice: 0,
            class: 0,
            subclass: 0,
            revision: 0,
            interfaces: Vec::new(),
            description: None,
            drivers: Vec::new(),
        }
    }

    pub fn pci(vendor: u16, device: u16) -> Self {
        Self::new(BusKind::Pci, vendor, device)
    }

    pub fn usb(vendor: u16, device: u16) -> Self {
        Self::new(BusKind::Usb, vendor, device)
    }

    pub fn with_subsystem(mut self, subvendor: u16, subdevice: u16) -> Self {
        self.subvendor = subvendor;
        self.subdevice = subdevice;
        self
    }

    pub fn with_class(mut self, class: u16, subclass: u16) -> Self {
        self.class = class;
        self.subclass = subclass;
        self
    }

    pub fn with_revision(mut self, revision: u16) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_interface(mut self, interface: Interface) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            bus: self.bus,
            vendor: self.vendor,
            device: self.device,
            class: self.class,
            subclass: self.subclass,
        }
    }

    /// Description or an empty string, for log lines
    pub fn description_or_empty(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }

    pub fn drivers(&self) -> &[String] {
        &self.drivers
    }

    pub fn has_driver(&self, name: &str) -> bool {
        self.drivers.iter().any(|d| d == name)
    }

    /// Attribute a driver to this device.
    ///
    /// Returns `false` if the name was already recorded.
    pub fn add_driver(&mut self, name: &str) -> bool {
        if self.has_driver(name) {
            return false;
        }
        self.drivers.push(name.to_string());
        true
    }

    pub fn any_interface(&self, pred: impl Fn(&Interface) -> bool) -> bool {
        self.interfaces.iter().any(pred)
    }

    pub fn matches_ifclass(&self, class: u16) -> bool {
        self.any_interface(|i| i.class == class)
    }

    pub fn matches_ifsubclass(&self, subclass: u16) -> bool {
        self.any_interface(|i| i.subclass == subclass)
    }

    pub fn matches_protocol(&self, protocol: u16) -> bool {
        self.any_interface(|i| i.protocol == protocol)
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vendor={:04x} product={:04x}", self.vendor, self.device)?;
        if let Some(descr) = &self.description {
            write!(f, " {}", descr)?;
        }
        Ok(())
    }
}
