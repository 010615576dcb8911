//! The tenant manager: owns the live-child map, spawns isolated worker
//! processes on demand, dispatches query plans over per-child control
//! sockets, reaps exits, garbage-collects idle workers, and serves remote
//! proxy connections.
//!
//! Per-child request/response discipline: every child carries a one-permit
//! semaphore, so at most one control-socket exchange is in flight per
//! worker, with a bounded wait that surfaces as `Overloaded`. Everything
//! else a caller does (reading the status pipe, consuming query output)
//! happens on descriptors the child handed back and needs no further
//! coordination.

use std::collections::HashMap;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::BytesMut;
use exec_proto::{
    fdpass, AttachHeader, ExecStats, Outcome, OutputFormat, Response, ATTACH_HEADER_LEN,
    PROXY_FRAME,
};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utils::event_counter::EventCounter;
use utils::id::{TenantId, TenantKey};

use crate::cgroup::{Cgroup, CgroupFactory};
use crate::config::{TenantdConf, WorkerStderr};
use crate::eviction::Evictor;
use crate::sandbox;

/// Longest rejection text we are willing to read back from a worker.
const MAX_ERRTEXT: u32 = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The child's availability slot could not be acquired in time; the
    /// caller may retry.
    #[error("tenant overloaded")]
    Overloaded,
    /// Handshake violation; fatal to this request, never retried here.
    #[error("protocol: {0}")]
    Protocol(String),
    /// The child died before or while responding.
    #[error("tenant crashed")]
    TenantCrashed,
    /// The worker rejected or failed the query and said why.
    #[error("remote error: {0}")]
    Remote(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<exec_proto::ProtoError> for ExecError {
    fn from(e: exec_proto::ProtoError) -> ExecError {
        ExecError::Protocol(e.to_string())
    }
}

fn classify_io(e: io::Error, what: &str) -> ExecError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            ExecError::Protocol(format!("{what}: deadline exceeded"))
        }
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => ExecError::TenantCrashed,
        _ => ExecError::Other(anyhow::Error::new(e).context(what.to_string())),
    }
}

/// The worker's end-of-query signal channel, handed back on a successful
/// DirectExec. Dropping it is the cancellation signal.
#[derive(Debug)]
pub struct StatusPipe(UnixStream);

impl StatusPipe {
    pub fn into_inner(self) -> UnixStream {
        self.0
    }
}

impl From<OwnedFd> for StatusPipe {
    fn from(fd: OwnedFd) -> StatusPipe {
        StatusPipe(UnixStream::from(fd))
    }
}

/// Read the status pipe to EOF and fold the payload into the final query
/// outcome. `Ok(None)` is success without telemetry.
pub fn check_blocking(pipe: StatusPipe) -> Result<Option<ExecStats>, ExecError> {
    let mut stream = pipe.0;
    let _ = stream.set_read_timeout(None);
    let mut payload = Vec::new();
    if stream.read_to_end(&mut payload).is_err() {
        // the peer vanished rather than closing: nothing was delivered
        return Err(ExecError::TenantCrashed);
    }
    match exec_proto::parse_outcome(&payload) {
        Outcome::Success => Ok(None),
        Outcome::Stats(stats) => Ok(Some(stats)),
        Outcome::Error(msg) => Err(ExecError::Remote(msg)),
    }
}

pub async fn check(pipe: StatusPipe) -> Result<Option<ExecStats>, ExecError> {
    tokio::task::spawn_blocking(move || check_blocking(pipe))
        .await
        .map_err(|e| ExecError::Other(anyhow::anyhow!("status check task failed: {e}")))?
}

/// One live worker process.
struct Child {
    id: TenantId,
    pid: nix::unistd::Pid,
    /// Our end of the control socketpair. Exclusive use is enforced by
    /// `slot`, which also encodes the one-request-per-child invariant.
    ctl: UnixStream,
    slot: Arc<tokio::sync::Semaphore>,
    last_touched: Mutex<Instant>,
    /// Plan serialization buffer, reused across requests on this child.
    scratch: Mutex<BytesMut>,
    cgroup: Mutex<Option<Cgroup>>,
}

struct ManagerInner {
    conf: TenantdConf,
    children: Mutex<HashMap<TenantId, Arc<Child>>>,
    events: Arc<EventCounter>,
    cgroups: Option<CgroupFactory>,
    cancel: CancellationToken,
}

pub struct Manager {
    inner: Arc<ManagerInner>,
    evictor: Mutex<Option<Evictor>>,
    listen_addr: Option<std::net::SocketAddr>,
}

impl Manager {
    /// Create the cache root, start the evictor and the worker GC, and (if
    /// configured) begin accepting remote proxy connections. Must run
    /// inside a tokio runtime.
    pub async fn launch(conf: TenantdConf) -> anyhow::Result<Manager> {
        std::fs::create_dir_all(&conf.cache_root)
            .with_context(|| format!("create cache root {}", conf.cache_root))?;
        let events = Arc::new(EventCounter::new().context("create fill event counter")?);
        let evictor = Evictor::spawn(
            conf.cache_root.clone(),
            conf.eviction.clone(),
            Arc::clone(&events),
        )?;
        let cgroups = conf.cgroup_parent.clone().map(CgroupFactory::new);

        let inner = Arc::new(ManagerInner {
            conf,
            children: Mutex::new(HashMap::new()),
            events,
            cgroups,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(gc_loop(Arc::clone(&inner)));

        let mut listen_addr = None;
        if let Some(addr) = inner.conf.listen {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind remote listener on {addr}"))?;
            listen_addr = Some(listener.local_addr()?);
            info!(addr = %listen_addr.unwrap(), "remote tenant listener started");
            tokio::spawn(accept_loop(Arc::clone(&inner), listener));
        }

        Ok(Manager {
            inner,
            evictor: Mutex::new(Some(evictor)),
            listen_addr,
        })
    }

    /// Address the remote listener actually bound (port 0 resolves here).
    pub fn listen_addr(&self) -> Option<std::net::SocketAddr> {
        self.listen_addr
    }

    /// Dispatch one plan to `id`'s worker, spawning it if needed. On
    /// success the returned status pipe will eventually deliver the query
    /// outcome; dropping it cancels the query.
    pub async fn exec(
        &self,
        id: TenantId,
        key: TenantKey,
        plan: bytes::Bytes,
        ofmt: OutputFormat,
        output: OwnedFd,
    ) -> Result<StatusPipe, ExecError> {
        if id.is_zero() {
            return Err(ExecError::Protocol("zero tenant id".to_string()));
        }
        if key.is_zero() {
            return Err(ExecError::Protocol(
                "zero tenant key for non-zero tenant id".to_string(),
            ));
        }

        let child = {
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.get_or_spawn(id))
                .await
                .map_err(|e| ExecError::Other(anyhow::anyhow!("spawn task failed: {e}")))??
        };

        let permit = match tokio::time::timeout(
            self.inner.conf.slot_wait,
            Arc::clone(&child.slot).acquire_owned(),
        )
        .await
        {
            Err(_elapsed) => return Err(ExecError::Overloaded),
            Ok(Err(_closed)) => return Err(ExecError::TenantCrashed),
            Ok(Ok(permit)) => permit,
        };
        *child.last_touched.lock() = Instant::now();

        let handshake = self.inner.conf.handshake_timeout;
        let errtext = self.inner.conf.errtext_timeout;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut scratch = child.scratch.lock();
            let res = dispatch(
                &child.ctl,
                &mut scratch,
                &plan,
                ofmt,
                output.as_fd(),
                handshake,
                errtext,
            );
            drop(output); // the child holds its own copy now
            res
        })
        .await
        .map_err(|e| ExecError::Other(anyhow::anyhow!("dispatch task failed: {e}")))?
    }

    /// Cooperative shutdown signal to a named tenant. Returns whether the
    /// tenant was live and signalable.
    pub fn quit(&self, id: TenantId) -> bool {
        let child = {
            let children = self.inner.children.lock();
            children.get(&id).cloned()
        };
        match child {
            Some(child) => nix::sys::signal::kill(child.pid, nix::sys::signal::SIGTERM).is_ok(),
            None => false,
        }
    }

    /// Close the listener, kill all children, stop the evictor.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let children: Vec<Arc<Child>> = {
            let children = self.inner.children.lock();
            children.values().cloned().collect()
        };
        for child in children {
            debug!(tenant = %child.id, pid = %child.pid, "killing worker");
            let _ = nix::sys::signal::kill(child.pid, nix::sys::signal::SIGKILL);
        }
        let evictor = self.evictor.lock().take();
        if let Some(mut evictor) = evictor {
            let _ = tokio::task::spawn_blocking(move || evictor.stop()).await;
        }
    }
}

impl ManagerInner {
    fn get_or_spawn(self: &Arc<Self>, id: TenantId) -> anyhow::Result<Arc<Child>> {
        let mut children = self.children.lock();
        if let Some(child) = children.get(&id) {
            *child.last_touched.lock() = Instant::now();
            return Ok(Arc::clone(child));
        }
        let (child, proc) = self.spawn_child(id)?;
        children.insert(id, Arc::clone(&child));
        drop(children);
        spawn_reaper(Arc::clone(self), Arc::clone(&child), proc);
        Ok(child)
    }

    fn spawn_child(
        self: &Arc<Self>,
        id: TenantId,
    ) -> anyhow::Result<(Arc<Child>, std::process::Child)> {
        let tenant_dir = self.conf.cache_root.join(id.to_string());
        // clean slate; a leftover directory from a previous incarnation is
        // expected after crashes
        let _ = std::fs::remove_dir_all(&tenant_dir);
        std::fs::create_dir_all(&tenant_dir)
            .with_context(|| format!("create tenant cache dir {tenant_dir}"))?;

        let (local, remote) = UnixStream::pair().context("create control socketpair")?;

        let bin = match &self.conf.worker_bin {
            Some(bin) => bin.clone().into_std_path_buf(),
            None => std::env::current_exe().context("resolve worker binary")?,
        };
        let mut cmd = Command::new(bin);
        cmd.arg("worker")
            .arg("-t")
            .arg(id.to_string())
            .arg("-c")
            .arg("3")
            .arg("-e")
            .arg("4");

        let sandboxed = self.conf.sandbox && sandbox::is_supported();
        cmd.env_clear();
        cmd.env(
            "CACHEDIR",
            if sandboxed {
                sandbox::SANDBOX_CACHEDIR
            } else {
                tenant_dir.as_str()
            },
        );
        cmd.env("LANG", "C.UTF-8");
        for var in ["PATH", "SHELL", "HOME"] {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }
        for (k, v) in &self.conf.worker_env {
            cmd.env(k, v);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        match self.conf.worker_stderr {
            WorkerStderr::Inherit => {}
            WorkerStderr::Null => {
                cmd.stderr(Stdio::null());
            }
            WorkerStderr::LogFile => {
                let log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.conf.cache_root.join(format!("{id}.log")))
                    .context("open worker log file")?;
                cmd.stderr(Stdio::from(log));
            }
        }

        let ctl_fd = remote.as_raw_fd();
        let ev_fd = self.events.writer_fd().as_raw_fd();
        // SAFETY: only fd juggling between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                use nix::fcntl::{fcntl, FcntlArg};
                // stash both above the target range, then pin the
                // conventional numbers (dup2 clears CLOEXEC)
                let ctl = fcntl(ctl_fd, FcntlArg::F_DUPFD(32))?;
                let ev = fcntl(ev_fd, FcntlArg::F_DUPFD(32))?;
                nix::unistd::dup2(ctl, 3)?;
                nix::unistd::dup2(ev, 4)?;
                close_fds::set_fds_cloexec(5, &[]);
                Ok(())
            });
        }

        if sandboxed {
            sandbox::wrap(&mut cmd, &tenant_dir)
                .map_err(|e| anyhow::anyhow!("sandbox worker: {e}"))?;
        }

        let proc = cmd
            .spawn()
            .with_context(|| format!("spawn worker for tenant {id}"))?;
        drop(remote);

        let cgroup = match &self.cgroups {
            Some(factory) => match factory.create(&id.to_string()) {
                Ok(group) => {
                    if let Err(e) = group.enqueue(proc.id()) {
                        warn!(tenant = %id, "cgroup enqueue failed: {e}");
                    }
                    Some(group)
                }
                Err(e) => {
                    warn!(tenant = %id, "cgroup create failed: {e}");
                    None
                }
            },
            None => None,
        };

        info!(tenant = %id, pid = proc.id(), sandboxed, "launched worker");
        let child = Arc::new(Child {
            id,
            pid: nix::unistd::Pid::from_raw(proc.id() as i32),
            ctl: local,
            slot: Arc::new(tokio::sync::Semaphore::new(1)),
            last_touched: Mutex::new(Instant::now()),
            scratch: Mutex::new(BytesMut::new()),
            cgroup: Mutex::new(cgroup),
        });
        Ok((child, proc))
    }
}

/// Per-child wait task: reaps the exit, then removes the map entry, but
/// only if the map still points at this exact child, so a relaunch racing
/// the reaper is never evicted by its predecessor's death.
fn spawn_reaper(inner: Arc<ManagerInner>, child: Arc<Child>, mut proc: std::process::Child) {
    let _ = std::thread::Builder::new()
        .name(format!("reap-{}", child.id))
        .spawn(move || {
            match proc.wait() {
                Ok(status) => info!(tenant = %child.id, %status, "worker exited"),
                Err(e) => warn!(tenant = %child.id, "worker wait failed: {e}"),
            }
            {
                let mut children = inner.children.lock();
                if let Some(current) = children.get(&child.id) {
                    if Arc::ptr_eq(current, &child) {
                        children.remove(&child.id);
                    }
                }
            }
            if let Some(group) = child.cgroup.lock().take() {
                group.teardown();
            }
            let tenant_dir = inner.conf.cache_root.join(child.id.to_string());
            let _ = std::fs::remove_dir_all(tenant_dir);
        });
}

/// Serialize and send one DirectExec, then interpret the 8-byte reply.
fn dispatch(
    ctl: &UnixStream,
    scratch: &mut BytesMut,
    plan: &[u8],
    ofmt: OutputFormat,
    output: BorrowedFd<'_>,
    handshake: Duration,
    errtext: Duration,
) -> Result<StatusPipe, ExecError> {
    exec_proto::encode_direct(scratch, plan, ofmt)?;

    ctl.set_write_timeout(Some(handshake))
        .map_err(|e| classify_io(e, "set send deadline"))?;
    fdpass::send_with_fd(ctl, scratch, Some(output))
        .map_err(|e| classify_io(e, "send plan"))?;

    ctl.set_read_timeout(Some(handshake))
        .map_err(|e| classify_io(e, "set reply deadline"))?;
    let mut frame = [0u8; 8];
    let fd = fdpass::recv_exact_with_fd(ctl, &mut frame)
        .map_err(|e| classify_io(e, "read reply"))?;

    match exec_proto::parse_response(&frame)? {
        Response::Detach => {
            let fd = fd.ok_or(exec_proto::ProtoError::MissingFd)?;
            Ok(StatusPipe::from(fd))
        }
        Response::Err { len } => {
            if len > MAX_ERRTEXT {
                return Err(ExecError::Protocol(format!(
                    "oversized rejection text ({len} bytes)"
                )));
            }
            ctl.set_read_timeout(Some(errtext))
                .map_err(|e| classify_io(e, "set error deadline"))?;
            let mut text = vec![0u8; len as usize];
            Read::read_exact(&mut &*ctl, &mut text)
                .map_err(|e| classify_io(e, "read error text"))?;
            Err(ExecError::Remote(
                String::from_utf8_lossy(&text).into_owned(),
            ))
        }
    }
}

/// Idle-worker collection: every interval, SIGTERM children whose last
/// request is older than the interval. The reaper does the map cleanup.
async fn gc_loop(inner: Arc<ManagerInner>) {
    let period = inner.conf.gc_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let stale: Vec<Arc<Child>> = {
            let children = inner.children.lock();
            children
                .values()
                .filter(|c| c.last_touched.lock().elapsed() >= period)
                .cloned()
                .collect()
        };
        for child in stale {
            info!(tenant = %child.id, pid = %child.pid, "terminating idle worker");
            let _ = nix::sys::signal::kill(child.pid, nix::sys::signal::SIGTERM);
        }
    }
}

/// Remote proxy server: read an attach header, then hand the connection to
/// the tenant's worker with a ProxyExec.
async fn accept_loop(inner: Arc<ManagerInner>, listener: tokio::net::TcpListener) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            },
        };
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            if let Err(e) = handle_attach(&inner, stream).await {
                debug!(%peer, "attach rejected: {e:#}");
            }
        });
    }
}

async fn handle_attach(
    inner: &Arc<ManagerInner>,
    mut stream: tokio::net::TcpStream,
) -> anyhow::Result<()> {
    let mut buf = [0u8; ATTACH_HEADER_LEN];
    tokio::time::timeout(inner.conf.handshake_timeout, stream.read_exact(&mut buf))
        .await
        .context("attach header deadline")?
        .context("read attach header")?;

    // the magic gate: nothing else is read from an unproven peer
    let header = AttachHeader::decode(&buf)?;
    if header.is_ping() {
        // dropping the connection gives the pinger its EOF; no worker is
        // spawned for the zero tenant
        return Ok(());
    }

    let child = {
        let inner = Arc::clone(inner);
        let id = header.id;
        tokio::task::spawn_blocking(move || inner.get_or_spawn(id))
            .await
            .context("spawn task failed")??
    };

    let permit = tokio::time::timeout(
        inner.conf.slot_wait,
        Arc::clone(&child.slot).acquire_owned(),
    )
    .await
    .context("child busy, dropping remote connection")?
    .context("child gone")?;
    *child.last_touched.lock() = Instant::now();

    let handshake = inner.conf.handshake_timeout;
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let _permit = permit;
        let std_stream = stream.into_std().context("detach stream")?;
        // the worker expects a plain blocking socket
        std_stream.set_nonblocking(false).context("clear nonblocking")?;
        child
            .ctl
            .set_write_timeout(Some(handshake))
            .context("set proxy deadline")?;
        fdpass::send_with_fd(&child.ctl, &PROXY_FRAME, Some(std_stream.as_fd()))
            .context("forward proxy connection")?;
        // our copy closes here; the worker owns the peer now
        Ok(())
    })
    .await
    .context("proxy task failed")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use exec_proto::{ControlFrame, DETACH_FRAME};
    use std::io::Write;

    fn fake_dispatch(
        plan: &[u8],
        ofmt: OutputFormat,
        worker: impl FnOnce(UnixStream, Vec<u8>, Option<OwnedFd>) + Send + 'static,
    ) -> Result<StatusPipe, ExecError> {
        let (mgr_end, worker_end) = UnixStream::pair().unwrap();
        let (output_ours, _output_theirs) = UnixStream::pair().unwrap();
        let plan_len = plan.len();

        let handle = std::thread::spawn(move || {
            let mut frame = [0u8; 8];
            let fd = fdpass::recv_exact_with_fd(&worker_end, &mut frame).unwrap();
            let parsed = exec_proto::parse_control(&frame).unwrap();
            let ControlFrame::Direct { len, .. } = parsed else {
                panic!("expected direct frame, got {parsed:?}");
            };
            assert_eq!(len as usize, plan_len);
            let mut payload = vec![0u8; len as usize];
            Read::read_exact(&mut &worker_end, &mut payload).unwrap();
            worker(worker_end, payload, fd);
        });

        let mut scratch = BytesMut::new();
        let res = dispatch(
            &mgr_end,
            &mut scratch,
            plan,
            ofmt,
            output_ours.as_fd(),
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        handle.join().unwrap();
        res
    }

    #[test]
    fn dispatch_detach_returns_status_pipe() {
        let pipe = fake_dispatch(b"the plan", OutputFormat::Raw, |ctl, payload, out_fd| {
            assert_eq!(payload, b"the plan");
            assert!(out_fd.is_some(), "output fd must arrive with the plan");
            let (ours, theirs) = UnixStream::pair().unwrap();
            fdpass::send_with_fd(&ctl, &DETACH_FRAME, Some(theirs.as_fd())).unwrap();
            drop(theirs);
            // worker finishes with an empty status payload
            drop(ours);
        })
        .unwrap();
        assert!(matches!(check_blocking(pipe), Ok(None)));
    }

    #[test]
    fn dispatch_err_reply_is_remote_error() {
        let err = fake_dispatch(b"p", OutputFormat::Raw, |ctl, _payload, _out| {
            let text = b"no such table";
            fdpass::send_with_fd(&ctl, &exec_proto::err_frame(text.len()), None).unwrap();
            (&ctl).write_all(text).unwrap();
        })
        .unwrap_err();
        match err {
            ExecError::Remote(msg) => assert_eq!(msg, "no such table"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dispatch_garbage_reply_is_protocol_error() {
        let err = fake_dispatch(b"p", OutputFormat::Raw, |ctl, _payload, _out| {
            fdpass::send_with_fd(&ctl, b"??!!??!!", None).unwrap();
        })
        .unwrap_err();
        assert!(matches!(err, ExecError::Protocol(_)));
    }

    #[test]
    fn dispatch_detach_without_fd_is_protocol_error() {
        let err = fake_dispatch(b"p", OutputFormat::Raw, |ctl, _payload, _out| {
            fdpass::send_with_fd(&ctl, &DETACH_FRAME, None).unwrap();
        })
        .unwrap_err();
        assert!(matches!(err, ExecError::Protocol(_)));
    }

    #[test]
    fn dispatch_peer_death_is_crash() {
        let err = fake_dispatch(b"p", OutputFormat::Raw, |ctl, _payload, _out| {
            drop(ctl);
        })
        .unwrap_err();
        assert!(matches!(err, ExecError::TenantCrashed));
    }

    #[test]
    fn check_interprets_payloads() {
        // stats record
        let (a, b) = UnixStream::pair().unwrap();
        let stats = ExecStats {
            cache_hits: 2,
            ..Default::default()
        };
        (&a).write_all(&exec_proto::encode_stats(&stats)).unwrap();
        drop(a);
        assert_eq!(check_blocking(StatusPipe(b)).unwrap(), Some(stats));

        // error string
        let (a, b) = UnixStream::pair().unwrap();
        (&a).write_all(br#""boom""#).unwrap();
        drop(a);
        match check_blocking(StatusPipe(b)) {
            Err(ExecError::Remote(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected {other:?}"),
        }

        // panic marker
        let (a, b) = UnixStream::pair().unwrap();
        (&a).write_all(b"panic!").unwrap();
        drop(a);
        assert!(matches!(
            check_blocking(StatusPipe(b)),
            Err(ExecError::Remote(_))
        ));
    }
}
