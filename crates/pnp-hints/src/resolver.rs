//! Vendor/device resolution across one or more hints files

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::format::FieldFormat;
use crate::reader::HintsReader;
use crate::{
    HintsError, KERNEL_MODULE, LINKER_HINTS_VERSION, MAX_BUS_NAME_LEN, MAX_FORMAT_LEN,
    MAX_MODULE_NAME_LEN, MDT_MODULE, MDT_PNP_INFO,
};

/// Buses whose PNP tables carry vendor/device pairs
const SUPPORTED_BUSES: [&[u8]; 2] = [b"pci", b"usb"];

/// Ordered set of hints files to search.
#[derive(Debug, Clone)]
pub struct HintsResolver {
    paths: Vec<PathBuf>,
}

impl Default for HintsResolver {
    fn default() -> Self {
        Self::new(crate::DEFAULT_HINTS_PATHS)
    }
}

impl HintsResolver {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Start a lazy search for modules claiming `vendor`/`device`.
    ///
    /// Files are loaded one at a time as the cursor reaches them; a missing
    /// file is skipped.
    pub fn start_resolution(&self, vendor: u16, device: u16) -> PnpMatches<'_> {
        PnpMatches {
            paths: self.paths.iter(),
            current: None,
            vendor: i32::from(vendor),
            device: i32::from(device),
        }
    }

    pub fn resolve_all(&self, vendor: u16, device: u16) -> Vec<String> {
        self.start_resolution(vendor, device).collect()
    }
}

/// Cursor returned by [`HintsResolver::start_resolution`].
///
/// Each file's buffer is dropped once the cursor moves past it.
pub struct PnpMatches<'r> {
    paths: std::slice::Iter<'r, PathBuf>,
    current: Option<HintsFile>,
    vendor: i32,
    device: i32,
}

impl Iterator for PnpMatches<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if self.current.is_none() {
                let path = self.paths.next()?;
                match HintsFile::load(path) {
                    Ok(Some(file)) => self.current = Some(file),
                    Ok(None) => {
                        debug!(path = %path.display(), "Hints file not present, skipping");
                        continue;
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping hints file");
                        continue;
                    }
                }
            }

            if let Some(file) = self.current.as_mut() {
                if let Some(module) = file.next_match(self.vendor, self.device) {
                    return Some(module);
                }
            }
            self.current = None;
        }
    }
}

/// One hints file held in memory, with a record cursor.
#[derive(Debug)]
pub struct HintsFile {
    path: PathBuf,
    buf: Vec<u8>,
    next_record: Option<usize>,
    module: Option<String>,
}

impl HintsFile {
    /// Read a hints file. `Ok(None)` means the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, HintsError> {
        match std::fs::read(path) {
            Ok(buf) => Self::from_bytes(path, buf).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(HintsError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_bytes(path: impl Into<PathBuf>, buf: Vec<u8>) -> Result<Self, HintsError> {
        let path = path.into();
        let mut reader = HintsReader::new(&buf);
        let version = reader.read_int()?;
        if version != LINKER_HINTS_VERSION {
            return Err(HintsError::VersionMismatch {
                path,
                found: version,
                expected: LINKER_HINTS_VERSION,
            });
        }
        let first = reader.position();
        let next_record = (first < buf.len()).then_some(first);

        Ok(Self {
            path,
            buf,
            next_record,
            module: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Advance to the next module whose PNP table lists the pair.
    ///
    /// The remainder of a matching record is not searched. Corrupt data ends
    /// the file with a warning.
    pub fn next_match(&mut self, vendor: i32, device: i32) -> Option<String> {
        match self.scan(vendor, device) {
            Ok(found) => found,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Corrupt hints data");
                self.next_record = None;
                None
            }
        }
    }

    /// Step to the next record, returning its type and payload offset.
    fn advance(&mut self) -> Result<Option<(i32, usize)>, HintsError> {
        let Some(start) = self.next_record else {
            return Ok(None);
        };
        let mut reader = HintsReader::at(&self.buf, start);
        let len = reader.read_int()?;
        if len < 0 {
            return Err(HintsError::InvalidRecordLength { offset: start, len });
        }
        let next = start + len as usize + 4;
        self.next_record = (next < self.buf.len()).then_some(next);
        let rectype = reader.read_int()?;
        Ok(Some((rectype, reader.position())))
    }

    fn scan(&mut self, vendor: i32, device: i32) -> Result<Option<String>, HintsError> {
        while let Some((rectype, payload)) = self.advance()? {
            let mut reader = HintsReader::at(&self.buf, payload);

            if rectype == MDT_MODULE {
                reader.read_str()?;
                let name = reader.read_str()?;
                self.module = module_name(&self.path, name);
                continue;
            }

            let Some(module) = self.module.as_deref() else {
                continue;
            };
            if module == KERNEL_MODULE || rectype != MDT_PNP_INFO {
                continue;
            }

            let bus = reader.read_str()?;
            if bus.len() >= MAX_BUS_NAME_LEN {
                warn!(path = %self.path.display(), module, "Bus name too long");
                continue;
            }
            if !SUPPORTED_BUSES.iter().any(|b| *b == bus) {
                continue;
            }

            let format = reader.read_str()?;
            if format.len() >= MAX_FORMAT_LEN {
                warn!(path = %self.path.display(), module, "PNP format too long");
                continue;
            }
            let count = reader.read_int()?;
            let format = FieldFormat::parse(&String::from_utf8_lossy(format));

            if !format.is_resolvable() {
                debug!(module, "PNP record has no vendor/device fields");
                continue;
            }
            for kind in format.unknown_kinds() {
                debug!(module, kind = %kind, "Unknown PNP field kind");
            }

            for _ in 0..count.max(0) {
                let (v, d) = format.read_tuple(&mut reader)?;
                if v == Some(vendor) && d == Some(device) {
                    debug!(module, vendor, device, "PNP entry matched");
                    return Ok(Some(module.to_string()));
                }
            }
        }
        Ok(None)
    }
}

/// Module name from a module record, without a trailing `.ko`.
fn module_name(path: &Path, raw: &[u8]) -> Option<String> {
    if raw.len() >= MAX_MODULE_NAME_LEN {
        warn!(path = %path.display(), len = raw.len(), "Module name too long");
        return None;
    }
    let name = String::from_utf8_lossy(raw);
    let name = match name.strip_suffix(".ko") {
        Some(stem) if name.len() > 3 => stem.to_string(),
        _ => name.into_owned(),
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_name_strips_ko() {
        let p = Path::new("test");
        assert_eq!(module_name(p, b"if_em.ko").as_deref(), Some("if_em"));
        assert_eq!(module_name(p, b"if_em").as_deref(), Some("if_em"));
        assert_eq!(module_name(p, b".ko").as_deref(), Some(".ko"));
        assert_eq!(module_name(p, &[b'a'; 64]), None);
    }

    #[test]
    fn test_version_mismatch() {
        let buf = 1i32.to_ne_bytes().to_vec();
        let err = HintsFile::from_bytes("old.hints", buf).unwrap_err();
        assert!(matches!(
            err,
            HintsError::VersionMismatch { found: 1, expected: 2, .. }
        ));
    }

    #[test]
    fn test_header_only_file_has_no_records() {
        let buf = LINKER_HINTS_VERSION.to_ne_bytes().to_vec();
        let mut file = HintsFile::from_bytes("empty.hints", buf).unwrap();
        assert_eq!(file.next_match(1, 2), None);
    }

    #[test]
    fn test_negative_record_length_ends_file() {
        let mut buf = LINKER_HINTS_VERSION.to_ne_bytes().to_vec();
        buf.extend_from_slice(&(-8i32).to_ne_bytes());
        buf.extend_from_slice(&MDT_MODULE.to_ne_bytes());
        let mut file = HintsFile::from_bytes("bad.hints", buf).unwrap();
        assert_eq!(file.next_match(1, 2), None);
        assert_eq!(file.next_record, None);
    }

    #[test]
    fn test_missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HintsFile::load(&dir.path().join("linker.hints"))
            .unwrap()
            .is_none());
    }
}
