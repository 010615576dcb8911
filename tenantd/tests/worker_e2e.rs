//! End-to-end exercises against a real worker process: the manager spawns
//! the actual `tenantd` binary in worker mode, dispatches plans over the
//! control socket, and reads results back through the passed descriptors.

use std::io::Read;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use camino::Utf8PathBuf;
use exec_proto::{AttachHeader, OutputFormat};
use tenantd::config::TenantdConf;
use tenantd::manager::{self, Manager};
use tenantd::worker::scan::{InlineSegment, ScanPlan};
use utils::id::{TenantId, TenantKey};

fn worker_bin() -> Utf8PathBuf {
    Utf8PathBuf::from(env!("CARGO_BIN_EXE_tenantd"))
}

fn test_conf(cache_root: Utf8PathBuf) -> TenantdConf {
    let mut conf = TenantdConf::dummy(cache_root);
    conf.worker_bin = Some(worker_bin());
    // the host filesystem may be arbitrarily full; keep the evictor out of
    // these runs
    conf.eviction.usage_target_pct = 100;
    conf
}

fn scan_plan_bytes(etag: &str, payload: &[u8]) -> bytes::Bytes {
    let plan = ScanPlan {
        segments: vec![InlineSegment::new(etag, payload.to_vec())],
    };
    bincode::serialize(&plan).unwrap().into()
}

async fn read_all(stream: UnixStream) -> Vec<u8> {
    tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        let mut stream = stream;
        stream.read_to_end(&mut out).unwrap();
        out
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_exec_hits_cache_on_second_run() {
    utils::logging::init_for_tests();
    let dir = camino_tempfile::tempdir().unwrap();
    let conf = test_conf(dir.path().to_path_buf());
    let manager = Manager::launch(conf).await.unwrap();

    let id = TenantId::generate();
    let key = TenantKey::generate();
    let payload = vec![0x5au8; 10 * 1024];
    let plan = scan_plan_bytes("abc123-e2e", &payload);

    // first run: a miss that populates the tenant's cache
    let (out_local, out_remote) = UnixStream::pair().unwrap();
    let pipe = manager
        .exec(id, key, plan.clone(), OutputFormat::Raw, OwnedFd::from(out_remote))
        .await
        .unwrap();
    assert_eq!(read_all(out_local).await, payload);
    let stats = manager::check(pipe).await.unwrap().expect("stats record");
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 0);

    // second run: served from the mapping
    let (out_local, out_remote) = UnixStream::pair().unwrap();
    let pipe = manager
        .exec(id, key, plan, OutputFormat::Raw, OwnedFd::from(out_remote))
        .await
        .unwrap();
    assert_eq!(read_all(out_local).await, payload);
    let stats = manager::check(pipe).await.unwrap().expect("stats record");
    assert_eq!(stats.cache_misses, 0);
    assert_eq!(stats.cache_hits, 1);

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_plan_surfaces_as_remote_error() {
    utils::logging::init_for_tests();
    let dir = camino_tempfile::tempdir().unwrap();
    let conf = test_conf(dir.path().to_path_buf());
    let manager = Manager::launch(conf).await.unwrap();

    let (_out_local, out_remote) = UnixStream::pair().unwrap();
    let err = manager
        .exec(
            TenantId::generate(),
            TenantKey::generate(),
            bytes::Bytes::from_static(b"not a plan"),
            OutputFormat::Raw,
            OwnedFd::from(out_remote),
        )
        .await
        .unwrap_err();
    match err {
        manager::ExecError::Remote(msg) => assert!(msg.contains("decode"), "got: {msg}"),
        other => panic!("unexpected {other:?}"),
    }

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn quit_terminates_a_live_tenant() {
    utils::logging::init_for_tests();
    let dir = camino_tempfile::tempdir().unwrap();
    let conf = test_conf(dir.path().to_path_buf());
    let manager = Manager::launch(conf).await.unwrap();

    let id = TenantId::generate();
    assert!(!manager.quit(id), "no worker yet");

    let (out_local, out_remote) = UnixStream::pair().unwrap();
    let pipe = manager
        .exec(
            id,
            TenantKey::generate(),
            scan_plan_bytes("q", b"x"),
            OutputFormat::Raw,
            OwnedFd::from(out_remote),
        )
        .await
        .unwrap();
    let _ = read_all(out_local).await;
    manager::check(pipe).await.unwrap();

    assert!(manager.quit(id), "worker is live and signalable");
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn attach_ping_gets_eof_without_spawning() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    utils::logging::init_for_tests();
    let dir = camino_tempfile::tempdir().unwrap();
    let mut conf = test_conf(dir.path().to_path_buf());
    conf.listen = Some("127.0.0.1:0".parse().unwrap());
    let manager = Manager::launch(conf).await.unwrap();
    let addr = manager.listen_addr().unwrap();

    // liveness ping: zero id, zero key, expect clean EOF
    let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
    conn.write_all(&AttachHeader::ping().encode()).await.unwrap();
    let mut byte = [0u8; 1];
    assert_eq!(conn.read(&mut byte).await.unwrap(), 0, "expected EOF");

    // bad magic: rejected the same way, nothing further read
    let mut bogus = AttachHeader::ping().encode();
    bogus[0] ^= 0xff;
    let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
    conn.write_all(&bogus).await.unwrap();
    assert_eq!(conn.read(&mut byte).await.unwrap(), 0, "expected EOF");

    // neither connection may have spawned a worker
    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(entries.is_empty(), "cache root must stay empty: {entries:?}");

    manager.stop().await;
}
