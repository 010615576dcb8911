//! Supervisor configuration.
//!
//! A `TenantdConf` is parsed once at startup (TOML file plus CLI overrides)
//! and then treated as immutable for the life of the process.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

/// Where a worker's stderr goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStderr {
    /// Share the supervisor's stderr.
    #[default]
    Inherit,
    /// Discard.
    Null,
    /// Append to `<cache_root>/<tenant-id>.log`.
    LogFile,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvictionConf {
    /// Eviction keeps used bytes under this share of the filesystem.
    pub usage_target_pct: u8,
    /// Files whose atime is older than this are removed on sight.
    #[serde(with = "humantime_serde")]
    pub min_age: Duration,
    /// Lifetime of `eph:`-prefixed entries.
    #[serde(with = "humantime_serde")]
    pub ephemeral_ttl: Duration,
    /// Per-tenant and global candidate buffer cap.
    pub max_buffer: usize,
    /// Minimum interval between eviction summary log lines.
    #[serde(with = "humantime_serde")]
    pub summary_period: Duration,
}

impl Default for EvictionConf {
    fn default() -> Self {
        EvictionConf {
            usage_target_pct: 90,
            min_age: Duration::from_secs(3600),
            ephemeral_ttl: Duration::from_secs(6),
            max_buffer: 50,
            summary_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TenantdConf {
    /// Root of the on-disk cache; one subdirectory per tenant.
    pub cache_root: Utf8PathBuf,
    /// Binary to exec as `<worker_bin> worker ...`; defaults to the current
    /// executable.
    pub worker_bin: Option<Utf8PathBuf>,
    /// Wrap workers in the OS sandbox when the platform supports it.
    pub sandbox: bool,
    /// Parent cgroup directory to create per-tenant groups under.
    pub cgroup_parent: Option<Utf8PathBuf>,
    /// Extra environment handed to every worker.
    pub worker_env: Vec<(String, String)>,
    pub worker_stderr: WorkerStderr,
    /// Idle workers older than this are terminated by the GC ticker.
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,
    /// Bounded wait for a child's availability slot.
    #[serde(with = "humantime_serde")]
    pub slot_wait: Duration,
    /// Control-socket handshake deadline (send plan / read reply).
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Deadline for the trailing error text of a rejection.
    #[serde(with = "humantime_serde")]
    pub errtext_timeout: Duration,
    /// How long a worker waits on the status pipe before concluding the
    /// caller is gone.
    #[serde(with = "humantime_serde")]
    pub cancel_watch_timeout: Duration,
    /// Remote proxy listener; `None` disables the remote server.
    pub listen: Option<SocketAddr>,
    pub eviction: EvictionConf,
}

impl Default for TenantdConf {
    fn default() -> Self {
        TenantdConf {
            cache_root: Utf8PathBuf::from("/var/cache/tenantd"),
            worker_bin: None,
            sandbox: false,
            cgroup_parent: None,
            worker_env: Vec::new(),
            worker_stderr: WorkerStderr::default(),
            gc_interval: Duration::from_secs(3600),
            slot_wait: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
            errtext_timeout: Duration::from_secs(1),
            cancel_watch_timeout: Duration::from_secs(15 * 60),
            listen: None,
            eviction: EvictionConf::default(),
        }
    }
}

impl TenantdConf {
    pub fn from_toml(text: &str) -> anyhow::Result<TenantdConf> {
        toml::from_str(text).context("parse tenantd config")
    }

    pub fn load(path: &Utf8Path) -> anyhow::Result<TenantdConf> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {path}"))?;
        Self::from_toml(&text)
    }

    /// Minimal config rooted at a scratch directory, for tests.
    pub fn dummy(cache_root: Utf8PathBuf) -> TenantdConf {
        TenantdConf {
            cache_root,
            ..Default::default()
        }
    }
}
