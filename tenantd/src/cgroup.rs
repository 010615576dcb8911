//! Per-tenant resource-control directories (cgroup v2).
//!
//! The factory is an optional capability: when the config names a parent
//! directory, every spawned worker gets its own group under it and is
//! enqueued by pid. Teardown is best-effort; a non-empty group simply
//! stays behind until its processes exit.

use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("cgroups are not supported on this platform")]
    Unsupported,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct CgroupFactory {
    parent: Utf8PathBuf,
}

impl CgroupFactory {
    pub fn new(parent: Utf8PathBuf) -> CgroupFactory {
        CgroupFactory { parent }
    }

    pub fn create(&self, name: &str) -> Result<Cgroup, CgroupError> {
        if !cfg!(target_os = "linux") {
            return Err(CgroupError::Unsupported);
        }
        let path = self.parent.join(name);
        std::fs::create_dir_all(&path)?;
        Ok(Cgroup { path })
    }
}

pub struct Cgroup {
    path: Utf8PathBuf,
}

impl Cgroup {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Move `pid` into this group.
    pub fn enqueue(&self, pid: u32) -> Result<(), CgroupError> {
        let mut procs = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.path.join("cgroup.procs"))?;
        writeln!(procs, "{pid}")?;
        Ok(())
    }

    pub fn teardown(self) {
        if let Err(e) = std::fs::remove_dir(&self.path) {
            warn!(path = %self.path, "cgroup teardown failed: {e}");
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn create_enqueue_teardown() {
        let dir = camino_tempfile::tempdir().unwrap();
        let factory = CgroupFactory::new(dir.path().to_path_buf());
        let group = factory.create("tenant-x").unwrap();
        group.enqueue(std::process::id()).unwrap();
        let listed =
            std::fs::read_to_string(dir.path().join("tenant-x/cgroup.procs")).unwrap();
        assert!(listed.contains(&std::process::id().to_string()));
        // not a real cgroupfs: the procs file blocks the rmdir, which the
        // teardown treats as best-effort
        std::fs::remove_file(dir.path().join("tenant-x/cgroup.procs")).unwrap();
        group.teardown();
        assert!(!dir.path().join("tenant-x").exists());
    }
}
