//! Reusable framed pipe protocol
//!
//! A pipe wraps a single reliable duplex transport (TLS in production) in a
//! command-framed wire layer so that one connection can carry many
//! successive end-user streams. Frame format:
//!
//! ```text
//! +--------+--------+--------+--------+
//! |            Magic (4B)             |
//! +--------+--------+--------+--------+
//! |  Cmd   |  Term  |   Length (2B)   |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```
//!
//! `Term` is an 8-bit generation counter. Every reuse of a pipe advances
//! it, and data or control frames stamped with a different generation are
//! silently drained by the receiver. That is what makes it safe to hand a
//! pipe to a new stream while late frames from the previous stream may
//! still be in flight. A pipe carries one stream at a time.

mod bind;
mod deadline;
#[allow(clippy::module_inception)]
mod pipe;
mod pool;

pub use pipe::Pipe;
pub use pool::{Dialer, Pool};

use std::io;
use thiserror::Error;

/// Size of each per-pipe scratch buffer.
pub const BUF_SIZE: usize = 16 * 1024;

/// Wire magic prefixed to every frame.
pub const MAGIC: [u8; 4] = [0xff, 0x86, 0x13, 0x85];

/// Frame header size: command, term, 16-bit big-endian payload length.
pub const HEADER_LEN: usize = 4;

/// Bytes of framing preceding the payload of a data frame.
pub const FRAME_OVERHEAD: usize = MAGIC.len() + HEADER_LEN;

/// Maximum payload carried by a single data frame.
pub const MAX_PAYLOAD: usize = BUF_SIZE - FRAME_OVERHEAD;

/// Length of the handshake authentication tag (SHA-256).
pub const TAG_LEN: usize = 32;

/// Frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    /// Interrupt the stream of the current term without closing the pipe
    Close = 0x00,
    /// Authenticated handshake carrying the target address
    Conn = 0x01,
    /// Stream payload
    Trans = 0x02,
    /// Liveness probe
    Ping = 0x03,
    /// Reserved; term-agnostic and never dropped by the stale-term rule
    Err = 0x04,
}

impl Cmd {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Cmd::Close),
            0x01 => Some(Cmd::Conn),
            0x02 => Some(Cmd::Trans),
            0x03 => Some(Cmd::Ping),
            0x04 => Some(Cmd::Err),
            _ => None,
        }
    }
}

/// Pipe lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum State {
    Idle = 0,
    InUse = 1,
    Interrupted = 2,
    Closed = 3,
}

/// Pipe layer errors
#[derive(Debug, Error)]
pub enum PipeError {
    #[error("invalid frame magic: {0:02x?}")]
    InvalidMagic([u8; 4]),

    #[error("unknown command: {0}")]
    UnknownCmd(u8),

    #[error("unexpected handshake command: {0}")]
    BadHandshake(u8),

    #[error("handshake authentication failed")]
    AuthFailed,

    #[error("frame payload too large: {0}")]
    FrameTooLarge(usize),

    #[error("interrupted by remote")]
    Interrupted,

    #[error("connection closed")]
    Eof,

    #[error("pipe transport failed: {0}")]
    Transport(#[source] io::Error),

    #[error("bad target address: {0}")]
    Address(#[from] crate::proxy::ProxyError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
