//! PNP field format strings
//!
//! A format string describes the layout of every tuple in a PNP record. It is
//! a `;`-separated list of `K:name` descriptors where `K` is the field kind.

use crate::reader::HintsReader;
use crate::HintsError;

/// Storage kind of one tuple field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// `G`, `I`, `J`, `L`, `M`: one aligned integer
    Int,
    /// `D`, `Z`: one length-prefixed string
    Str,
    /// `T`: table-wide constant, occupies no space in the tuple
    Table,
    /// Anything else, occupies no space in the tuple
    Unknown(char),
}

impl FieldKind {
    pub fn from_char(c: char) -> Self {
        match c {
            'G' | 'I' | 'J' | 'L' | 'M' => Self::Int,
            'D' | 'Z' => Self::Str,
            'T' => Self::Table,
            other => Self::Unknown(other),
        }
    }
}

/// Parsed format string of a PNP record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldFormat {
    kinds: Vec<FieldKind>,
    vendor_index: Option<usize>,
    device_index: Option<usize>,
    vendor_default: Option<i32>,
}

impl FieldFormat {
    pub fn parse(format: &str) -> Self {
        let mut parsed = Self::default();

        for (index, desc) in format.split(';').filter(|d| !d.is_empty()).enumerate() {
            let mut chars = desc.chars();
            let kind = chars.next().map(FieldKind::from_char).unwrap_or(FieldKind::Unknown(' '));
            chars.next();
            let name = chars.as_str();

            if kind == FieldKind::Table {
                if let Some(value) = name.strip_prefix("vendor=") {
                    parsed.vendor_default = parse_hex(value);
                }
            } else if name.starts_with("vendor") {
                parsed.vendor_index = Some(index);
            } else if name.starts_with("device") {
                parsed.device_index = Some(index);
            }

            parsed.kinds.push(kind);
        }

        parsed
    }

    pub fn kinds(&self) -> &[FieldKind] {
        &self.kinds
    }

    pub fn vendor_index(&self) -> Option<usize> {
        self.vendor_index
    }

    pub fn device_index(&self) -> Option<usize> {
        self.device_index
    }

    pub fn vendor_default(&self) -> Option<i32> {
        self.vendor_default
    }

    /// A record can only be matched if it locates a device and either
    /// locates or fixes a vendor.
    pub fn is_resolvable(&self) -> bool {
        self.device_index.is_some()
            && (self.vendor_index.is_some() || self.vendor_default.is_some())
    }

    /// Kind characters this reader does not know how to size.
    pub fn unknown_kinds(&self) -> impl Iterator<Item = char> + '_ {
        self.kinds.iter().filter_map(|k| match k {
            FieldKind::Unknown(c) => Some(*c),
            _ => None,
        })
    }

    /// Consume one tuple and return its (vendor, device) values.
    pub fn read_tuple(
        &self,
        reader: &mut HintsReader<'_>,
    ) -> Result<(Option<i32>, Option<i32>), HintsError> {
        let mut vendor = self.vendor_default;
        let mut device = None;

        for (index, kind) in self.kinds.iter().enumerate() {
            match kind {
                FieldKind::Int => {
                    let value = reader.read_int()?;
                    if Some(index) == self.device_index {
                        device = Some(value);
                    } else if Some(index) == self.vendor_index {
                        vendor = Some(value);
                    }
                }
                FieldKind::Str => {
                    reader.read_str()?;
                }
                FieldKind::Table | FieldKind::Unknown(_) => {}
            }
        }

        Ok((vendor, device))
    }
}

/// Leading hexadecimal digits, with an optional `0x` prefix.
fn parse_hex(s: &str) -> Option<i32> {
    let s = s.trim_start();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let end = s
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(s.len());
    i64::from_str_radix(&s[..end], 16)
        .ok()
        .map(|v| v as i32)
}
