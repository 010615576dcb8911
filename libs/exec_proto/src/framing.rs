//! Output framing for query results.
//!
//! The format code travels in byte 7 of the DirectExec header and selects
//! how the worker wraps whatever the engine produces:
//!
//! - `'0'` raw: bytes pass through untouched.
//! - `'1'` chunked-ion: each write becomes one HTTP chunk.
//! - `'2'` chunked-json: newline-delimited records, HTTP chunked.
//! - `'3'` chunked-json-array: one JSON array over the whole response,
//!   HTTP chunked.
//!
//! Content encoding is the engine's business; one `write` call is treated
//! as one record.

use std::io::{self, Write};

use crate::ProtoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Raw,
    ChunkedIon,
    ChunkedJson,
    ChunkedJsonArray,
}

impl OutputFormat {
    pub fn code(self) -> u8 {
        match self {
            OutputFormat::Raw => b'0',
            OutputFormat::ChunkedIon => b'1',
            OutputFormat::ChunkedJson => b'2',
            OutputFormat::ChunkedJsonArray => b'3',
        }
    }

    pub fn from_code(code: u8) -> Result<OutputFormat, ProtoError> {
        match code {
            b'0' => Ok(OutputFormat::Raw),
            b'1' => Ok(OutputFormat::ChunkedIon),
            b'2' => Ok(OutputFormat::ChunkedJson),
            b'3' => Ok(OutputFormat::ChunkedJsonArray),
            other => Err(ProtoError::BadOutputFormat(other)),
        }
    }
}

/// Format-aware wrapper around a result sink.
///
/// `finish` must be called on success paths so the chunked trailer (and the
/// closing `]` for the array format) reaches the peer.
pub struct FrameWriter<W: Write> {
    inner: W,
    format: OutputFormat,
    records_written: u64,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(format: OutputFormat, inner: W) -> FrameWriter<W> {
        FrameWriter {
            inner,
            format,
            records_written: 0,
        }
    }

    fn write_chunk(inner: &mut W, parts: &[&[u8]]) -> io::Result<()> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total == 0 {
            return Ok(());
        }
        write!(inner, "{total:x}\r\n")?;
        for part in parts {
            inner.write_all(part)?;
        }
        inner.write_all(b"\r\n")
    }

    pub fn write_record(&mut self, rec: &[u8]) -> io::Result<()> {
        match self.format {
            OutputFormat::Raw => self.inner.write_all(rec)?,
            OutputFormat::ChunkedIon => Self::write_chunk(&mut self.inner, &[rec])?,
            OutputFormat::ChunkedJson => Self::write_chunk(&mut self.inner, &[rec, b"\n"])?,
            OutputFormat::ChunkedJsonArray => {
                let lead: &[u8] = if self.records_written == 0 { b"[" } else { b"," };
                Self::write_chunk(&mut self.inner, &[lead, rec])?;
            }
        }
        self.records_written += 1;
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<W> {
        match self.format {
            OutputFormat::Raw => {}
            OutputFormat::ChunkedIon | OutputFormat::ChunkedJson => {
                self.inner.write_all(b"0\r\n\r\n")?;
            }
            OutputFormat::ChunkedJsonArray => {
                let body: &[u8] = if self.records_written == 0 { b"[]" } else { b"]" };
                Self::write_chunk(&mut self.inner, &[body])?;
                self.inner.write_all(b"0\r\n\r\n")?;
            }
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for FrameWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_record(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(format: OutputFormat, records: &[&[u8]]) -> Vec<u8> {
        let mut w = FrameWriter::new(format, Vec::new());
        for rec in records {
            w.write_record(rec).unwrap();
        }
        w.finish().unwrap()
    }

    #[test]
    fn code_roundtrip() {
        for fmt in [
            OutputFormat::Raw,
            OutputFormat::ChunkedIon,
            OutputFormat::ChunkedJson,
            OutputFormat::ChunkedJsonArray,
        ] {
            assert_eq!(OutputFormat::from_code(fmt.code()).unwrap(), fmt);
        }
        assert!(OutputFormat::from_code(b'9').is_err());
    }

    #[test]
    fn raw_passthrough() {
        assert_eq!(collect(OutputFormat::Raw, &[b"abc", b"def"]), b"abcdef");
    }

    #[test]
    fn chunked_json_is_newline_delimited() {
        let out = collect(OutputFormat::ChunkedJson, &[b"{\"a\":1}"]);
        assert_eq!(out, b"8\r\n{\"a\":1}\n\r\n0\r\n\r\n");
    }

    #[test]
    fn chunked_ion_has_terminal_chunk() {
        let out = collect(OutputFormat::ChunkedIon, &[b"\xde\xad"]);
        assert_eq!(out, b"2\r\n\xde\xad\r\n0\r\n\r\n");
    }

    #[test]
    fn array_commas_and_brackets() {
        let out = collect(OutputFormat::ChunkedJsonArray, &[b"1", b"2"]);
        assert_eq!(out, b"2\r\n[1\r\n2\r\n,2\r\n1\r\n]\r\n0\r\n\r\n");
    }

    #[test]
    fn empty_array() {
        let out = collect(OutputFormat::ChunkedJsonArray, &[]);
        assert_eq!(out, b"2\r\n[]\r\n0\r\n\r\n");
    }
}
