//! Human-readable device descriptions from pci.ids / usb.ids style files
//!
//! Column 0 holds vendors, column 1 (one tab) devices, column 2 (two tabs)
//! subvendor/subdevice pairs. The texts of every matching column are joined
//! with single spaces.

use driverd_types::{BusKind, DeviceRecord};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::IdDatabaseConfig;

const VENDOR_COLUMN: usize = 0;
const DEVICE_COLUMN: usize = 1;
const SUB_COLUMN: usize = 2;

/// Resolved description databases, one optional file per bus
#[derive(Debug, Clone, Default)]
pub struct IdDatabase {
    pci: Option<PathBuf>,
    usb: Option<PathBuf>,
}

impl IdDatabase {
    pub fn new(pci: Option<PathBuf>, usb: Option<PathBuf>) -> Self {
        Self { pci, usb }
    }

    /// Pick the first readable candidate for each bus.
    pub fn from_config(config: &IdDatabaseConfig) -> Self {
        Self {
            pci: first_readable(BusKind::Pci, &config.pci),
            usb: first_readable(BusKind::Usb, &config.usb),
        }
    }

    pub fn path(&self, bus: BusKind) -> Option<&Path> {
        match bus {
            BusKind::Pci => self.pci.as_deref(),
            BusKind::Usb => self.usb.as_deref(),
        }
    }

    pub fn describe(&self, device: &DeviceRecord) -> Option<String> {
        let path = self.path(device.bus)?;
        match File::open(path) {
            Ok(file) => describe_from(BufReader::new(file), device),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Couldn't open ID database");
                None
            }
        }
    }

    /// Fill in the record's description if one is known.
    pub fn annotate(&self, device: &mut DeviceRecord) {
        if device.description.is_none() {
            device.description = self.describe(device);
        }
    }
}

fn first_readable(bus: BusKind, candidates: &[PathBuf]) -> Option<PathBuf> {
    let found = candidates.iter().find(|p| File::open(p).is_ok()).cloned();
    match &found {
        Some(path) => debug!(bus = %bus, path = %path.display(), "Using ID database"),
        None => warn!(bus = %bus, "Couldn't open {} ID database", bus),
    }
    found
}

/// Scan an ID database for `device`.
pub fn describe_from<R: BufRead>(mut reader: R, device: &DeviceRecord) -> Option<String> {
    let mut matched = 0usize;
    let mut parts: Vec<String> = Vec::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to read ID database");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.split('#').next().unwrap_or("").trim_end();
        if line.trim_start().is_empty() {
            continue;
        }

        let column = line.chars().take_while(|&c| c == '\t').count();
        if column > matched {
            continue;
        }
        if column < matched {
            break;
        }

        if let Some(text) = match_column(device, line.trim_start(), column) {
            if !text.is_empty() {
                parts.push(text.to_string());
                matched += 1;
            }
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// Match one entry against the device; returns the entry's text on success.
fn match_column<'a>(device: &DeviceRecord, entry: &'a str, column: usize) -> Option<&'a str> {
    let (id, rest) = split_word(entry);
    let value = parse_id(id)?;

    match column {
        VENDOR_COLUMN if value == device.vendor => Some(rest),
        DEVICE_COLUMN if value == device.device => Some(rest),
        SUB_COLUMN if value == device.subvendor => {
            let (id, rest) = split_word(rest);
            (parse_id(id)? == device.subdevice).then_some(rest)
        }
        _ => None,
    }
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(end) => (&s[..end], s[end..].trim_start()),
        None => (s, ""),
    }
}

fn parse_id(s: &str) -> Option<u16> {
    u16::from_str_radix(s, 16).ok()
}
