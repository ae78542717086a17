//! Resumable driver database scan
//!
//! The scan is a small pushdown automaton over the depth of each line.
//! [`ScanState`] holds the automaton state, [`Matches`] drives it over the
//! database file and turns emitted records into driver names.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use driverd_types::DeviceRecord;
use tracing::{debug, warn};

use crate::line::classify;
use crate::predicate::evaluate;
use crate::{DatabaseError, MAX_DEPTH, MAX_NAME_LEN};

// ============================================================================
// Scan automaton
// ============================================================================

/// State of the depth-first scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// No driver record seen yet
    Start,
    /// Inside a driver record.
    ///
    /// `matched` is the deepest predicate level satisfied contiguously from
    /// depth 1, `prev` the depth of the last evaluated predicate.
    Descend { matched: usize, prev: usize },
    /// Discarding lines until the next driver record
    Skip,
}

/// What to do with the line that caused a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do
    Ignore,
    /// Line has no driver record to belong to
    Stray,
    /// Line is deeper than any predicate level
    TooDeep,
    /// Line starts a new driver record
    NewRecord,
    /// Evaluate the predicate, then call [`ScanState::after_evaluate`]
    Evaluate,
    /// The current record matched. With `reread` the line must be scanned
    /// again once the record's names have been handed out.
    Emit { reread: bool },
}

impl ScanState {
    fn fully_matched(matched: usize, prev: usize) -> bool {
        prev > 0 && matched == prev
    }

    /// Transition on a line of the given depth.
    pub fn on_line(self, depth: usize) -> (ScanState, Action) {
        match self {
            Self::Descend { matched, prev } => {
                if depth <= prev && Self::fully_matched(matched, prev) {
                    // Dedent or sibling after a complete branch
                    (Self::Skip, Action::Emit { reread: depth == 0 })
                } else if depth == 0 {
                    (Self::Descend { matched: 0, prev: 0 }, Action::NewRecord)
                } else if depth < prev && depth <= matched {
                    // Nothing further in this record can extend the match
                    (Self::Skip, Action::Ignore)
                } else if depth >= matched + 2 {
                    // Parent predicate failed
                    (self, Action::Ignore)
                } else if depth > MAX_DEPTH {
                    (self, Action::TooDeep)
                } else {
                    (self, Action::Evaluate)
                }
            }
            _ if depth == 0 => (Self::Descend { matched: 0, prev: 0 }, Action::NewRecord),
            Self::Start => (self, Action::Stray),
            Self::Skip => (self, Action::Ignore),
        }
    }

    /// Record the outcome of a predicate evaluated at `depth`.
    pub fn after_evaluate(self, depth: usize, ok: bool) -> ScanState {
        match self {
            Self::Descend { matched, .. } => Self::Descend {
                matched: if ok { matched + 1 } else { matched },
                prev: depth,
            },
            other => other,
        }
    }

    /// Whether the pending record matched when the file ends.
    pub fn matched_at_eof(self) -> bool {
        matches!(self, Self::Descend { matched, prev } if Self::fully_matched(matched, prev))
    }
}

// ============================================================================
// Database handle
// ============================================================================

/// Long-lived handle on the driver database
pub struct DriverDatabase<R> {
    reader: R,
    source: String,
}

impl DriverDatabase<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| DatabaseError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            reader: BufReader::new(file),
            source: path.display().to_string(),
        })
    }
}

impl<R: BufRead + Seek> DriverDatabase<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            reader,
            source: "<memory>".to_string(),
        }
    }

    /// Where the database was read from, for log lines
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Rewind the database and start matching `device`.
    pub fn start_resolution(
        &mut self,
        device: &DeviceRecord,
    ) -> Result<Matches<'_, R>, DatabaseError> {
        self.reader
            .seek(SeekFrom::Start(0))
            .map_err(DatabaseError::Rewind)?;
        Ok(Matches {
            db: self,
            device: device.clone(),
            state: ScanState::Start,
            record: Vec::new(),
            pending: VecDeque::new(),
            pushback: None,
            finished: false,
        })
    }

    /// Collect every driver name for `device`.
    pub fn resolve_all(&mut self, device: &DeviceRecord) -> Result<Vec<String>, DatabaseError> {
        self.start_resolution(device)?.collect()
    }

    fn read_line(&mut self) -> Result<Option<String>, DatabaseError> {
        let mut buf = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut buf)
            .map_err(DatabaseError::Read)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }
}

// ============================================================================
// Match cursor
// ============================================================================

/// Lazy sequence of driver names for one device.
///
/// Names are yielded in file order. Once the end of the database is reached
/// the cursor stays exhausted; start a new resolution to scan again.
pub struct Matches<'db, R> {
    db: &'db mut DriverDatabase<R>,
    device: DeviceRecord,
    state: ScanState,
    /// Driver names of the current record
    record: Vec<String>,
    /// Names of a matched record not yet handed out
    pending: VecDeque<String>,
    /// Line to scan again before reading on
    pushback: Option<String>,
    finished: bool,
}

impl<R: BufRead + Seek> Matches<'_, R> {
    fn next_line(&mut self) -> Result<Option<String>, DatabaseError> {
        match self.pushback.take() {
            Some(line) => Ok(Some(line)),
            None => self.db.read_line(),
        }
    }

    fn begin_record(&mut self, body: &str) {
        self.record.clear();
        for name in body.split_whitespace() {
            if name.len() >= MAX_NAME_LEN {
                warn!(
                    source = %self.db.source,
                    "Length of driver name '{}' >= {}", name, MAX_NAME_LEN
                );
                continue;
            }
            self.record.push(name.to_string());
        }
    }

    fn emit(&mut self) -> Option<String> {
        debug!(device = %self.device, drivers = ?self.record, "Driver record matched");
        self.pending.extend(self.record.iter().cloned());
        self.pending.pop_front()
    }
}

impl<R: BufRead + Seek> Iterator for Matches<'_, R> {
    type Item = Result<String, DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(name) = self.pending.pop_front() {
            return Some(Ok(name));
        }
        if self.finished {
            return None;
        }

        loop {
            let raw = match self.next_line() {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    self.finished = true;
                    if self.state.matched_at_eof() {
                        self.state = ScanState::Skip;
                        return self.emit().map(Ok);
                    }
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };
            let Some(line) = classify(&raw) else {
                continue;
            };

            let (state, action) = self.state.on_line(line.depth);
            self.state = state;
            match action {
                Action::Ignore => {}
                Action::Stray => {
                    warn!(source = %self.db.source, line = line.body, "Line outside of a driver record");
                }
                Action::TooDeep => {
                    warn!(
                        source = %self.db.source,
                        depth = line.depth,
                        line = line.body,
                        "Driver database line nested too deeply"
                    );
                }
                Action::NewRecord => self.begin_record(line.body),
                Action::Evaluate => {
                    let ok = evaluate(line.depth, line.body, &self.device);
                    self.state = self.state.after_evaluate(line.depth, ok);
                }
                Action::Emit { reread } => {
                    if reread {
                        self.pushback = Some(raw);
                    }
                    if let Some(name) = self.emit() {
                        return Some(Ok(name));
                    }
                }
            }
        }
    }
}
