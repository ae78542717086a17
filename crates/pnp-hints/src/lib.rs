//! pnp-hints: module lookup through the kernel's linker.hints files
//!
//! `linker.hints` is a binary index written by kldxref(8). Besides module
//! names it carries the PNP info each module declares: a self-describing
//! field format followed by a table of (vendor, device, ...) tuples. This
//! crate walks those tables and yields the modules that claim a given
//! vendor/device pair.
//!
//! Layout (native byte order, integers aligned to 4 bytes from the start of
//! the file):
//!
//! ```text
//! int version
//! repeat:
//!     int reclen            next record starts reclen + 4 bytes later
//!     int rectype           MDT_MODULE | MDT_PNP_INFO | ...
//!     payload
//! string = u8 length + raw bytes
//! ```

pub mod format;
pub mod reader;
pub mod resolver;

pub use format::{FieldFormat, FieldKind};
pub use reader::HintsReader;
pub use resolver::{HintsFile, HintsResolver, PnpMatches};

use std::path::PathBuf;
use thiserror::Error;

/// Only this hints format version is understood
pub const LINKER_HINTS_VERSION: i32 = 2;

/// Record type of a module name record
pub const MDT_MODULE: i32 = 2;

/// Record type of a PNP info record
pub const MDT_PNP_INFO: i32 = 4;

/// Hints files consulted by default, in order
pub const DEFAULT_HINTS_PATHS: [&str; 2] =
    ["/boot/kernel/linker.hints", "/boot/modules/linker.hints"];

/// Module names at least this long are rejected
pub const MAX_MODULE_NAME_LEN: usize = 64;

/// Bus names at least this long are rejected
pub const MAX_BUS_NAME_LEN: usize = 16;

/// Format strings at least this long are rejected
pub const MAX_FORMAT_LEN: usize = 256;

/// Placeholder module that carries the kernel's own PNP info
pub const KERNEL_MODULE: &str = "kernel";

#[derive(Error, Debug)]
pub enum HintsError {
    #[error("failed to read hints file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("version mismatch ({found} != {expected}) of file {path}")]
    VersionMismatch {
        path: PathBuf,
        found: i32,
        expected: i32,
    },

    #[error("hints data truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("invalid record length {len} at offset {offset}")]
    InvalidRecordLength { offset: usize, len: i32 },
}
