//! OS-native worker sandboxing.
//!
//! On Linux the worker is re-homed into fresh user and mount namespaces
//! with the tenant's cache directory bind-mounted over `/tmp`, so the only
//! writable storage a worker can see is its own cache. Platforms without
//! an equivalent report `Unsupported`, and the manager falls back to the
//! unsandboxed spawn path (which is also what tests exercise).

use std::process::Command;

use camino::Utf8Path;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandboxing is not supported on this platform")]
    Unsupported,
}

pub fn is_supported() -> bool {
    cfg!(target_os = "linux")
}

/// Where the worker will find its cache directory once wrapped.
pub const SANDBOX_CACHEDIR: &str = "/tmp";

#[cfg(target_os = "linux")]
pub fn wrap(cmd: &mut Command, cache_dir: &Utf8Path) -> Result<(), SandboxError> {
    use std::os::unix::process::CommandExt;

    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    let cache_dir = cache_dir.to_path_buf();

    // SAFETY: the closure only performs syscalls and small /proc writes,
    // which is what pre_exec exists for.
    unsafe {
        cmd.pre_exec(move || {
            use nix::mount::{mount, MsFlags};
            use nix::sched::{unshare, CloneFlags};

            unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS)?;
            // single-uid mapping; setgroups must be denied before gid_map
            std::fs::write("/proc/self/setgroups", "deny")?;
            std::fs::write("/proc/self/uid_map", format!("{uid} {uid} 1"))?;
            std::fs::write("/proc/self/gid_map", format!("{gid} {gid} 1"))?;
            // keep our mount changes out of the parent namespace
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None::<&str>,
            )?;
            mount(
                Some(cache_dir.as_std_path()),
                "/tmp",
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )?;
            Ok(())
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn wrap(_cmd: &mut Command, _cache_dir: &Utf8Path) -> Result<(), SandboxError> {
    Err(SandboxError::Unsupported)
}
