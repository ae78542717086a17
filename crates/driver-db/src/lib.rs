//! driver-db: matcher for the driverd driver database
//!
//! The database is a plain text file of driver records. Nesting is encoded by
//! leading tabs:
//!
//! ```text
//! if_bwn bwn_v4_ucode          depth 0: driver name(s)
//! 	14e4                    depth 1: vendor
//! 		4306                depth 2: device [keyword=value ...]
//! 			103c            depth 3: subvendor
//! 				3102        depth 4: subdevice
//! ```
//!
//! Predicates are hexadecimal literals or `*`. Device lines may carry keyword
//! predicates (`revision=`, `class=`, `subclass=`, `ifclass=`, `ifsubclass=`,
//! `protocol=`) that must all hold.
//!
//! Resolution is lazy: [`DriverDatabase::start_resolution`] rewinds the file
//! and returns a [`Matches`] cursor which yields driver names in file order.

pub mod line;
pub mod matcher;
pub mod predicate;

pub use line::{classify, Line};
pub use matcher::{Action, DriverDatabase, Matches, ScanState};
pub use predicate::{parse_hex, Keyword, Predicate};

use std::path::PathBuf;
use thiserror::Error;

/// Deepest predicate level (subdevice)
pub const MAX_DEPTH: usize = 4;

/// Driver names at least this long are rejected
pub const MAX_NAME_LEN: usize = 64;

/// Errors raised while opening or scanning the database
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("failed to open driver database {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to rewind driver database: {0}")]
    Rewind(#[source] std::io::Error),

    #[error("failed to read driver database: {0}")]
    Read(#[source] std::io::Error),
}
