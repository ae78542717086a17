//! Event socket handling
//!
//! Connects to the devd socket, turns the byte stream into event strings and
//! hands them to the [`Daemon`]. A lost connection is re-established
//! indefinitely; only the first connect at startup is bounded.

use std::io::{self, BufRead, Seek};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_seqpacket::UnixSeqpacket;
use tracing::{debug, info, warn};

use crate::config::{DaemonConfig, SocketConfig, Transport};
use crate::daemon::Daemon;
use crate::error::DaemonError;

/// Bound on each wait during the startup grace window
pub const GRACE_TICK: Duration = Duration::from_secs(1);

const MAX_PACKET: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &SocketConfig) -> Self {
        Self {
            attempts: config.connect_attempts,
            delay: config.retry_delay(),
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Connected event socket yielding one event string per frame
pub enum EventSource {
    /// Newline-delimited frames. Partial lines survive a cancelled read.
    Stream {
        reader: BufReader<UnixStream>,
        pending: Vec<u8>,
    },
    /// One frame per packet. A zero-length read means the peer closed.
    Seqpacket {
        socket: UnixSeqpacket,
        buf: Vec<u8>,
    },
}

impl EventSource {
    pub fn from_stream(stream: UnixStream) -> Self {
        Self::Stream {
            reader: BufReader::new(stream),
            pending: Vec::new(),
        }
    }

    pub fn from_seqpacket(socket: UnixSeqpacket) -> Self {
        Self::Seqpacket {
            socket,
            buf: vec![0; MAX_PACKET],
        }
    }

    pub async fn open(path: &Path, transport: Transport) -> io::Result<Self> {
        match transport {
            Transport::Stream => Ok(Self::from_stream(UnixStream::connect(path).await?)),
            Transport::Seqpacket => Ok(Self::from_seqpacket(UnixSeqpacket::connect(path).await?)),
        }
    }

    /// Wait for the next frame. `Ok(None)` means the peer closed the stream.
    pub async fn next_frame(&mut self) -> io::Result<Option<String>> {
        match self {
            Self::Stream { reader, pending } => {
                let n = reader.read_until(b'\n', pending).await?;
                if n == 0 && pending.is_empty() {
                    return Ok(None);
                }
                let frame = String::from_utf8_lossy(pending)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                pending.clear();
                Ok(Some(frame))
            }
            Self::Seqpacket { socket, buf } => {
                let n = socket.recv(buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                let frame = String::from_utf8_lossy(&buf[..n])
                    .trim_end_matches(['\n', '\0'])
                    .to_string();
                Ok(Some(frame))
            }
        }
    }
}

/// Open the event socket, retrying per `policy`.
pub async fn connect(
    path: &Path,
    transport: Transport,
    policy: ReconnectPolicy,
) -> Result<EventSource, DaemonError> {
    connect_with(path, transport, policy, false).await
}

/// As [`connect`]; with `warn_each` every failed attempt is a warning.
async fn connect_with(
    path: &Path,
    transport: Transport,
    policy: ReconnectPolicy,
    warn_each: bool,
) -> Result<EventSource, DaemonError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match EventSource::open(path, transport).await {
            Ok(source) => {
                info!(path = %path.display(), attempt, "Connected to event socket");
                return Ok(source);
            }
            Err(source) if attempt >= attempts => {
                return Err(DaemonError::Connect {
                    path: path.to_path_buf(),
                    attempts,
                    source,
                })
            }
            Err(e) => {
                if warn_each {
                    warn!(path = %path.display(), attempt, error = %e, "Connect attempt failed");
                } else {
                    debug!(path = %path.display(), attempt, error = %e, "Connect attempt failed");
                }
                sleep(policy.delay).await;
            }
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct Dispatcher {
    path: PathBuf,
    transport: Transport,
    policy: ReconnectPolicy,
    grace_ticks: u32,
}

impl Dispatcher {
    pub fn new(socket: &SocketConfig, grace_ticks: u32) -> Self {
        Self {
            path: socket.path.clone(),
            transport: socket.transport,
            policy: ReconnectPolicy::from_config(socket),
            grace_ticks,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(&config.socket, config.startup_grace_ticks)
    }

    /// Connect and feed events to `daemon`. Returns only on a fatal error.
    pub async fn run<R: BufRead + Seek>(&self, daemon: &mut Daemon<R>) -> Result<(), DaemonError> {
        let mut source = connect(&self.path, self.transport, self.policy).await?;
        let mut ticks = 0u32;
        if self.grace_ticks == 0 {
            info!("Entered steady state");
        }

        loop {
            let next = if ticks < self.grace_ticks {
                ticks += 1;
                let waited = timeout(GRACE_TICK, source.next_frame()).await;
                if ticks == self.grace_ticks {
                    info!("Startup grace window over, entered steady state");
                }
                match waited {
                    Ok(next) => next,
                    Err(_) => continue,
                }
            } else {
                source.next_frame().await
            };

            match next {
                Ok(Some(frame)) => {
                    if frame.trim().is_empty() {
                        continue;
                    }
                    debug!(frame = %frame, "Event");
                    daemon.handle_frame(&frame).await;
                }
                Ok(None) => {
                    warn!(path = %self.path.display(), "Event socket closed, reconnecting");
                    source = self.reconnect().await;
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    warn!(path = %self.path.display(), error = %e, "Event socket reset, reconnecting");
                    source = self.reconnect().await;
                }
                Err(e) => return Err(DaemonError::Socket(e)),
            }
        }
    }

    async fn reconnect(&self) -> EventSource {
        loop {
            match connect_with(&self.path, self.transport, self.policy, true).await {
                Ok(source) => return source,
                Err(e) => warn!(error = %e, "Still unable to reach event socket"),
            }
        }
    }
}
