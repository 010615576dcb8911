//! Fixed 8-byte control frames.
//!
//! Manager → worker:
//! - `proxyme\n` + ancillary peer connection fd: hand the connection over.
//! - `dir` ‖ u32 LE payload length at offset 3 ‖ format code at offset 7,
//!   followed by the payload, with the output sink as the ancillary fd.
//!
//! Worker → manager:
//! - `detach!\n` + ancillary status-pipe fd: plan accepted, running.
//! - `err` ‖ u32 LE text length at offset 3 ‖ `\n` at offset 7, followed by
//!   that many bytes of UTF-8 error text: plan rejected.

use bytes::{BufMut, BytesMut};

use crate::{framing::OutputFormat, ProtoError, MAX_PAYLOAD_SIZE};

pub const FRAME_LEN: usize = 8;

pub const PROXY_FRAME: [u8; FRAME_LEN] = *b"proxyme\n";
pub const DETACH_FRAME: [u8; FRAME_LEN] = *b"detach!\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    Proxy,
    Direct { len: u32, ofmt: OutputFormat },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Detach,
    Err { len: u32 },
}

/// Serialize a DirectExec message into `buf`: the `dir00000` tag with the
/// length and format fields patched in, then the payload itself.
pub fn encode_direct(
    buf: &mut BytesMut,
    payload: &[u8],
    ofmt: OutputFormat,
) -> Result<(), ProtoError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtoError::PayloadTooLarge(payload.len()));
    }
    buf.clear();
    buf.reserve(FRAME_LEN + payload.len());
    buf.put_slice(b"dir00000");
    buf.put_slice(payload);
    let len = (payload.len() as u32).to_le_bytes();
    buf[3..7].copy_from_slice(&len);
    buf[7] = ofmt.code();
    Ok(())
}

pub fn parse_control(frame: &[u8; FRAME_LEN]) -> Result<ControlFrame, ProtoError> {
    if *frame == PROXY_FRAME {
        return Ok(ControlFrame::Proxy);
    }
    if &frame[..3] == b"dir" {
        let len = u32::from_le_bytes(frame[3..7].try_into().expect("4-byte slice"));
        if len as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtoError::PayloadTooLarge(len as usize));
        }
        let ofmt = OutputFormat::from_code(frame[7])?;
        return Ok(ControlFrame::Direct { len, ofmt });
    }
    Err(ProtoError::UnexpectedFrame(*frame))
}

/// Build the rejection frame preceding `msg_len` bytes of error text.
pub fn err_frame(msg_len: usize) -> [u8; FRAME_LEN] {
    let mut frame = *b"err0000\n";
    frame[3..7].copy_from_slice(&(msg_len as u32).to_le_bytes());
    frame
}

pub fn parse_response(frame: &[u8; FRAME_LEN]) -> Result<Response, ProtoError> {
    if *frame == DETACH_FRAME {
        return Ok(Response::Detach);
    }
    if &frame[..3] == b"err" && frame[7] == b'\n' {
        let len = u32::from_le_bytes(frame[3..7].try_into().expect("4-byte slice"));
        return Ok(Response::Err { len });
    }
    Err(ProtoError::UnexpectedFrame(*frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_roundtrip() {
        let mut buf = BytesMut::new();
        let plan = b"symtab+plan bytes";
        encode_direct(&mut buf, plan, OutputFormat::ChunkedJson).unwrap();
        assert_eq!(buf.len(), FRAME_LEN + plan.len());

        let frame: [u8; FRAME_LEN] = buf[..FRAME_LEN].try_into().unwrap();
        match parse_control(&frame).unwrap() {
            ControlFrame::Direct { len, ofmt } => {
                assert_eq!(len as usize, plan.len());
                assert_eq!(ofmt, OutputFormat::ChunkedJson);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(&buf[FRAME_LEN..], plan);
    }

    #[test]
    fn direct_reuses_buffer() {
        let mut buf = BytesMut::new();
        encode_direct(&mut buf, &[0xaa; 100], OutputFormat::Raw).unwrap();
        encode_direct(&mut buf, &[0xbb; 10], OutputFormat::Raw).unwrap();
        assert_eq!(buf.len(), FRAME_LEN + 10);
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut buf = BytesMut::new();
        let huge = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            encode_direct(&mut buf, &huge, OutputFormat::Raw),
            Err(ProtoError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn proxy_frame_parses() {
        assert_eq!(parse_control(&PROXY_FRAME).unwrap(), ControlFrame::Proxy);
    }

    #[test]
    fn garbage_control_rejected() {
        assert!(matches!(
            parse_control(b"detach!\n"),
            Err(ProtoError::UnexpectedFrame(_))
        ));
    }

    #[test]
    fn response_frames() {
        assert_eq!(parse_response(&DETACH_FRAME).unwrap(), Response::Detach);
        assert_eq!(
            parse_response(&err_frame(42)).unwrap(),
            Response::Err { len: 42 }
        );
        assert!(parse_response(b"nonsense").is_err());
    }
}
