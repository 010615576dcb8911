//! Child-side runtime: the state machine a worker process runs against its
//! control socket.
//!
//! The worker idles in a blocking receive. A ProxyExec hands it a peer
//! connection to serve on its own thread; a DirectExec carries a plan
//! payload and an output descriptor, is answered with `detach!\n` plus a
//! fresh status pipe, and runs on an execution thread. The status pipe
//! doubles as the cancel token: the worker watches it with a bounded read,
//! and the caller closing its end aborts the query.

pub mod scan;

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use exec_proto::{fdpass, ControlFrame, ExecStats, OutputFormat, DETACH_FRAME};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utils::event_counter::EventCounter;
use utils::id::TenantId;

use crate::cache::DataCache;

/// How long the pipe watcher waits before deciding the caller is gone.
pub const DEFAULT_CANCEL_WATCH: Duration = Duration::from_secs(15 * 60);

pub struct WorkerArgs {
    pub tenant: TenantId,
    pub ctl_fd: RawFd,
    pub event_fd: RawFd,
    pub cancel_watch: Duration,
}

/// Everything one query execution owns.
pub struct ExecEnv {
    pub cache: Arc<DataCache>,
    /// The caller's output sink, exactly as received. The engine wraps it
    /// in the [`OutputFormat`] framing and closes it by dropping.
    pub output: std::fs::File,
    pub format: OutputFormat,
    pub cancel: CancellationToken,
}

pub trait QueryPlan: Send {
    fn run(self: Box<Self>, env: ExecEnv) -> anyhow::Result<ExecStats>;
}

/// The seam to the query engine. Plan decoding and execution live behind
/// it; the runtime only moves frames and descriptors.
pub trait Engine: Send + Sync + 'static {
    fn decode(&self, payload: &[u8]) -> anyhow::Result<Box<dyn QueryPlan>>;
    /// Take ownership of a proxied peer connection and speak the planner's
    /// transport over it.
    fn serve_peer(&self, conn: OwnedFd);
}

/// Worker process entry point: build the cache from `CACHEDIR`, then serve
/// the control socket until the supervisor closes it.
pub fn run(args: WorkerArgs, engine: Arc<dyn Engine>) -> anyhow::Result<()> {
    // SAFETY: the supervisor installed these descriptors for us at exec.
    let ctl: UnixStream = unsafe { OwnedFd::from_raw_fd(args.ctl_fd) }.into();
    let events = unsafe { EventCounter::from_inherited_fd(args.event_fd) }
        .context("adopt event counter fd")?;

    let cachedir: Utf8PathBuf = std::env::var("CACHEDIR")
        .context("CACHEDIR not set in worker environment")?
        .into();
    let cache = Arc::new(
        DataCache::new(cachedir, Some(Arc::new(events))).context("open data cache")?,
    );

    info!(tenant = %args.tenant, "worker ready");
    while serve_one(&ctl, &engine, &cache, args.cancel_watch)? {}
    info!(tenant = %args.tenant, "control socket closed, worker exiting");
    Ok(())
}

/// Serve one control message. `Ok(false)` means the supervisor hung up.
fn serve_one(
    ctl: &UnixStream,
    engine: &Arc<dyn Engine>,
    cache: &Arc<DataCache>,
    cancel_watch: Duration,
) -> anyhow::Result<bool> {
    let Some((frame, fd)) = recv_frame(ctl).context("receive control frame")? else {
        return Ok(false);
    };
    match exec_proto::parse_control(&frame).context("unexpected control bytes")? {
        ControlFrame::Proxy => {
            let conn = fd.context("proxy control message without connection descriptor")?;
            let engine = Arc::clone(engine);
            thread::Builder::new()
                .name("proxy-peer".to_string())
                .spawn(move || engine.serve_peer(conn))
                .context("spawn proxy thread")?;
        }
        ControlFrame::Direct { len, ofmt } => {
            handle_direct(ctl, len as usize, ofmt, fd, engine, cache, cancel_watch)?;
        }
    }
    Ok(true)
}

fn recv_frame(ctl: &UnixStream) -> io::Result<Option<([u8; 8], Option<OwnedFd>)>> {
    let mut frame = [0u8; 8];
    let (n, mut fd) = fdpass::recv_with_fd(ctl, &mut frame)?;
    if n == 0 {
        return Ok(None);
    }
    let mut got = n;
    while got < frame.len() {
        let (n, extra) = fdpass::recv_with_fd(ctl, &mut frame[got..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "supervisor closed mid-frame",
            ));
        }
        if fd.is_none() {
            fd = extra;
        }
        got += n;
    }
    Ok(Some((frame, fd)))
}

fn reply_err(ctl: &UnixStream, msg: &str) -> anyhow::Result<()> {
    let text = msg.as_bytes();
    fdpass::send_with_fd(ctl, &exec_proto::err_frame(text.len()), None)
        .context("send rejection frame")?;
    Write::write_all(&mut &*ctl, text).context("send rejection text")?;
    Ok(())
}

fn handle_direct(
    ctl: &UnixStream,
    len: usize,
    ofmt: OutputFormat,
    output: Option<OwnedFd>,
    engine: &Arc<dyn Engine>,
    cache: &Arc<DataCache>,
    cancel_watch: Duration,
) -> anyhow::Result<()> {
    ctl.set_read_timeout(Some(Duration::from_secs(1)))
        .context("set payload deadline")?;
    let mut payload = vec![0u8; len];
    let read_res = Read::read_exact(&mut &*ctl, &mut payload);
    ctl.set_read_timeout(None).context("clear payload deadline")?;
    read_res.context("read plan payload")?;

    let Some(output) = output else {
        reply_err(ctl, "missing output descriptor")?;
        return Ok(());
    };

    match engine.decode(&payload) {
        Err(e) => reply_err(ctl, &format!("{e:#}")),
        Ok(plan) => {
            let (ours, theirs) = UnixStream::pair().context("create status pipe")?;
            fdpass::send_with_fd(ctl, &DETACH_FRAME, Some(theirs.as_fd()))
                .context("send detach")?;
            drop(theirs);
            let cache = Arc::clone(cache);
            thread::Builder::new()
                .name("exec".to_string())
                .spawn(move || exec_request(plan, cache, output, ofmt, ours, cancel_watch))
                .context("spawn execution thread")?;
            Ok(())
        }
    }
}

/// Run one detached query: watch the status pipe for cancellation, execute
/// the plan, then report the outcome and close everything.
fn exec_request(
    plan: Box<dyn QueryPlan>,
    cache: Arc<DataCache>,
    output: OwnedFd,
    format: OutputFormat,
    status: UnixStream,
    cancel_watch: Duration,
) {
    let status = Arc::new(status);
    let cancel = CancellationToken::new();

    let watcher = {
        let status = Arc::clone(&status);
        let cancel = cancel.clone();
        thread::Builder::new()
            .name("pipe-watch".to_string())
            .spawn(move || {
                let _ = status.set_read_timeout(Some(cancel_watch));
                let mut byte = [0u8; 1];
                // the caller never writes here: EOF, an error, or the
                // deadline all mean it stopped caring
                let _ = Read::read(&mut &*status, &mut byte);
                cancel.cancel();
            })
    };

    let env = ExecEnv {
        cache,
        output: std::fs::File::from(output),
        format,
        cancel: cancel.clone(),
    };
    let result = panic::catch_unwind(AssertUnwindSafe(|| plan.run(env)));

    let payload = match &result {
        Ok(Ok(stats)) => exec_proto::encode_stats(stats),
        Ok(Err(e)) => {
            warn!("query failed: {e:#}");
            exec_proto::encode_error(&format!("{e:#}"))
        }
        // always leave a non-empty payload behind before re-raising, so
        // the caller cannot mistake a panic for success
        Err(_) => b"panic!".to_vec(),
    };
    let _ = Write::write_all(&mut &*status, &payload);
    let _ = status.shutdown(std::net::Shutdown::Both);
    if let Ok(watcher) = watcher {
        let _ = watcher.join();
    }
    if let Err(cause) = result {
        panic::resume_unwind(cause);
    }
}

#[cfg(test)]
mod tests {
    use super::scan::{InlineSegment, ScanEngine, ScanPlan};
    use super::*;
    use exec_proto::Response;
    use std::time::Instant;

    fn worker_fixture() -> (Arc<DataCache>, camino_tempfile::Utf8TempDir) {
        let dir = camino_tempfile::tempdir().unwrap();
        let cache = Arc::new(DataCache::new(dir.path().to_path_buf(), None).unwrap());
        (cache, dir)
    }

    fn roundtrip(
        engine: Arc<dyn Engine>,
        cache: &Arc<DataCache>,
        payload: &[u8],
        ofmt: OutputFormat,
    ) -> (Result<StatusReply, String>, UnixStream) {
        let (mgr, wrk) = UnixStream::pair().unwrap();
        let (out_read, out_write) = UnixStream::pair().unwrap();

        let mut buf = bytes::BytesMut::new();
        exec_proto::encode_direct(&mut buf, payload, ofmt).unwrap();
        fdpass::send_with_fd(&mgr, &buf, Some(out_write.as_fd())).unwrap();
        drop(out_write);

        serve_one(&wrk, &engine, cache, Duration::from_secs(5)).unwrap();

        let mut frame = [0u8; 8];
        let fd = fdpass::recv_exact_with_fd(&mgr, &mut frame).unwrap();
        let reply = match exec_proto::parse_response(&frame).unwrap() {
            Response::Detach => Ok(StatusReply {
                status: UnixStream::from(fd.expect("status pipe fd")),
            }),
            Response::Err { len } => {
                let mut text = vec![0u8; len as usize];
                Read::read_exact(&mut &mgr, &mut text).unwrap();
                Err(String::from_utf8(text).unwrap())
            }
        };
        (reply, out_read)
    }

    #[derive(Debug)]
    struct StatusReply {
        status: UnixStream,
    }

    #[test]
    fn direct_exec_reports_stats_and_output() {
        let (cache, _dir) = worker_fixture();
        let plan = ScanPlan {
            segments: vec![
                InlineSegment::new("seg-one", b"hello ".to_vec()),
                InlineSegment::new("seg-two", b"world".to_vec()),
            ],
        };
        let payload = bincode::serialize(&plan).unwrap();

        let (reply, mut out_read) = roundtrip(
            Arc::new(ScanEngine),
            &cache,
            &payload,
            OutputFormat::Raw,
        );
        let reply = reply.expect("detach expected");

        let mut output = Vec::new();
        out_read.read_to_end(&mut output).unwrap();
        assert_eq!(output, b"hello world");

        let mut status_payload = Vec::new();
        let mut status = reply.status;
        status.read_to_end(&mut status_payload).unwrap();
        match exec_proto::parse_outcome(&status_payload) {
            exec_proto::Outcome::Stats(stats) => {
                assert_eq!(stats.cache_misses, 2);
                assert_eq!(stats.bytes_scanned, 11);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn bad_plan_is_rejected_with_err_frame() {
        let (cache, _dir) = worker_fixture();
        let (reply, _out) = roundtrip(
            Arc::new(ScanEngine),
            &cache,
            b"this is not bincode at all",
            OutputFormat::Raw,
        );
        let text = reply.expect_err("rejection expected");
        assert!(text.contains("decode scan plan"), "got: {text}");
    }

    struct BlockingEngine;

    struct BlockUntilCancelled;

    impl QueryPlan for BlockUntilCancelled {
        fn run(self: Box<Self>, env: ExecEnv) -> anyhow::Result<ExecStats> {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !env.cancel.is_cancelled() {
                if Instant::now() > deadline {
                    anyhow::bail!("never cancelled");
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            anyhow::bail!("aborted by caller")
        }
    }

    impl Engine for BlockingEngine {
        fn decode(&self, _payload: &[u8]) -> anyhow::Result<Box<dyn QueryPlan>> {
            Ok(Box::new(BlockUntilCancelled))
        }
        fn serve_peer(&self, _conn: OwnedFd) {}
    }

    #[test]
    fn closing_status_pipe_cancels_the_query() {
        let (cache, _dir) = worker_fixture();
        let (reply, mut out_read) =
            roundtrip(Arc::new(BlockingEngine), &cache, b"x", OutputFormat::Raw);
        let reply = reply.expect("detach expected");

        // caller walks away
        drop(reply.status);

        // the worker must abort and close the output connection cleanly
        let mut rest = Vec::new();
        out_read.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    struct PanickyEngine;

    struct PanickyPlan;

    impl QueryPlan for PanickyPlan {
        fn run(self: Box<Self>, _env: ExecEnv) -> anyhow::Result<ExecStats> {
            panic!("boom");
        }
    }

    impl Engine for PanickyEngine {
        fn decode(&self, _payload: &[u8]) -> anyhow::Result<Box<dyn QueryPlan>> {
            Ok(Box::new(PanickyPlan))
        }
        fn serve_peer(&self, _conn: OwnedFd) {}
    }

    #[test]
    fn panic_leaves_a_marker_on_the_status_pipe() {
        let (cache, _dir) = worker_fixture();
        let (reply, _out) =
            roundtrip(Arc::new(PanickyEngine), &cache, b"x", OutputFormat::Raw);
        let mut status = reply.expect("detach expected").status;

        let mut payload = Vec::new();
        status.read_to_end(&mut payload).unwrap();
        assert_eq!(
            exec_proto::parse_outcome(&payload),
            exec_proto::Outcome::Error("panic!".to_string())
        );
    }
}
