//! Control-socket wire protocol between the tenant manager and its worker
//! processes, plus the attach header spoken on remote tenant connections.
//!
//! All multi-byte integers on the wire are little-endian. Frames are fixed
//! 8-byte headers; file descriptors ride alongside as Unix ancillary data
//! (see [`fdpass`]).

mod attach;
mod frames;
mod status;

pub mod fdpass;
pub mod framing;

pub use attach::{AttachHeader, ATTACH_HEADER_LEN, ATTACH_MAGIC};
pub use frames::{
    encode_direct, err_frame, parse_control, parse_response, ControlFrame, Response, DETACH_FRAME,
    FRAME_LEN, PROXY_FRAME,
};
pub use framing::{FrameWriter, OutputFormat};
pub use status::{encode_error, encode_stats, parse_outcome, ExecStats, Outcome};

/// Largest DirectExec payload (serialized symbol table + plan) we accept.
pub const MAX_PAYLOAD_SIZE: usize = (1 << 24) - 1;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("bad attach magic")]
    BadMagic,
    #[error("zero tenant id with non-zero tenant key")]
    ZeroIdNonZeroKey,
    #[error("non-zero tenant id with zero tenant key")]
    ZeroKey,
    #[error("payload length {0} exceeds maximum {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),
    #[error("unexpected control bytes {0:02x?}")]
    UnexpectedFrame([u8; FRAME_LEN]),
    #[error("unknown output format code {0:#04x}")]
    BadOutputFormat(u8),
    #[error("missing ancillary file descriptor")]
    MissingFd,
}
