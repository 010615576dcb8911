//! The smallest useful [`Engine`]: a plan is a serialized list of inline
//! segments, and executing it streams their decoded bytes to the output in
//! the requested framing, through the data cache.
//!
//! Real deployments link their own engine behind the [`Engine`] trait; this
//! one exists so the supervisor, worker runtime, cache and wire protocol
//! can be exercised end-to-end without a planner.

use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use exec_proto::{ExecStats, FrameWriter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::{Flags, Segment};

use super::{Engine, ExecEnv, QueryPlan};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineSegment {
    etag: String,
    bytes: Vec<u8>,
}

impl InlineSegment {
    pub fn new(etag: impl Into<String>, bytes: Vec<u8>) -> InlineSegment {
        InlineSegment {
            etag: etag.into(),
            bytes,
        }
    }
}

impl Segment for InlineSegment {
    fn etag(&self) -> &str {
        &self.etag
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(io::Cursor::new(self.bytes.clone())))
    }

    fn decode(&self, dst: &mut dyn Write, src: &[u8]) -> io::Result<()> {
        // one segment, one record
        dst.write_all(src)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanPlan {
    pub segments: Vec<InlineSegment>,
}

pub struct ScanEngine;

impl Engine for ScanEngine {
    fn decode(&self, payload: &[u8]) -> anyhow::Result<Box<dyn QueryPlan>> {
        let plan: ScanPlan = bincode::deserialize(payload).context("decode scan plan")?;
        for segment in &plan.segments {
            if segment.etag.is_empty() || segment.etag.contains('/') {
                anyhow::bail!("invalid segment etag {:?}", segment.etag);
            }
        }
        Ok(Box::new(plan))
    }

    /// Transport for proxied peers: 4-byte LE length, a serialized
    /// [`ScanPlan`], raw segment bytes back; repeat until the peer hangs up.
    fn serve_peer(&self, conn: OwnedFd) {
        let mut stream = std::fs::File::from(conn);
        loop {
            let mut lenbuf = [0u8; 4];
            match stream.read_exact(&mut lenbuf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return,
                Err(e) => {
                    warn!("proxy peer read failed: {e}");
                    return;
                }
            }
            let len = u32::from_le_bytes(lenbuf) as usize;
            let mut payload = vec![0u8; len];
            if let Err(e) = stream.read_exact(&mut payload) {
                warn!("proxy peer truncated plan: {e}");
                return;
            }
            let plan: ScanPlan = match bincode::deserialize(&payload) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!("proxy peer sent undecodable plan: {e}");
                    return;
                }
            };
            for segment in &plan.segments {
                if stream.write_all(&segment.bytes).is_err() {
                    return;
                }
            }
            if stream.flush().is_err() {
                return;
            }
        }
    }
}

/// Shares the framed writer between the cache's per-segment sinks and the
/// final `finish` call.
struct RecordSink(Arc<Mutex<FrameWriter<std::fs::File>>>);

impl Write for RecordSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().flush()
    }
}

impl QueryPlan for ScanPlan {
    fn run(self: Box<Self>, env: ExecEnv) -> anyhow::Result<ExecStats> {
        let started = Instant::now();
        let bytes_scanned: u64 = self.segments.iter().map(|s| s.size()).sum();
        let segments: Vec<Arc<dyn Segment>> = self
            .segments
            .into_iter()
            .map(|s| Arc::new(s) as Arc<dyn Segment>)
            .collect();

        let writer = Arc::new(Mutex::new(FrameWriter::new(env.format, env.output)));
        let mut table = env.cache.multi_get(segments, env.cancel.clone(), Flags::NONE);
        table.write_chunks(vec![Box::new(RecordSink(Arc::clone(&writer)))])?;

        let stats = ExecStats {
            cache_hits: table.hits(),
            cache_misses: table.misses(),
            bytes_scanned,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        drop(table);

        let writer = Arc::try_unwrap(writer)
            .map_err(|_| anyhow::anyhow!("output writer still shared after scan"))?
            .into_inner();
        writer.finish().context("finish output framing")?;
        Ok(stats)
    }
}
