//! File-level primitives for cache entries: the read-only mapping served on
//! hits and the read-write mapping a fill writes through.
//!
//! Entries are written as `<path>.tmp` and renamed into place, so a file
//! without the suffix always carries its complete bytes. The on-disk length
//! equals the segment's logical size; an extra 16 bytes of slack are
//! preallocated past EOF so oversized vector loads stay on owned blocks.

use std::fs::{File, OpenOptions};
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use memmap2::{Mmap, MmapMut};

pub(crate) const SLACK: u64 = 16;

/// A populated, read-only entry. Shared between concurrent hits via the
/// cache's refcounted mapping table.
pub struct Mapping {
    // the mapping borrows the descriptor; keep the file alive alongside it
    _file: File,
    map: Option<Mmap>,
    len: usize,
}

impl Mapping {
    pub fn open_readonly(path: &Utf8Path) -> io::Result<Mapping> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        let map = if len > 0 {
            // SAFETY: the file is renamed-in-place and never rewritten; the
            // evictor may unlink it, which keeps the pages valid until unmap.
            Some(unsafe { Mmap::map(&file)? })
        } else {
            None
        };
        Ok(Mapping {
            _file: file,
            map,
            len,
        })
    }

    pub fn data(&self) -> &[u8] {
        match &self.map {
            Some(m) => &m[..self.len],
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// An entry being populated: tempfile plus a writable mapping of exactly the
/// logical size.
pub(crate) struct FillFile {
    file: File,
    map: Option<MmapMut>,
    tmp_path: Utf8PathBuf,
    final_path: Utf8PathBuf,
    len: usize,
}

impl FillFile {
    pub fn create(final_path: &Utf8Path, size: u64) -> io::Result<FillFile> {
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = Utf8PathBuf::from(format!("{final_path}.tmp"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.set_len(size)?;

        // slack past EOF; allocation-only, so failure is not load-bearing
        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;
            let _ = nix::fcntl::fallocate(
                file.as_raw_fd(),
                nix::fcntl::FallocateFlags::FALLOC_FL_KEEP_SIZE,
                size as i64,
                SLACK as i64,
            );
        }

        let map = if size > 0 {
            // SAFETY: we own the tempfile exclusively until rename.
            Some(unsafe { MmapMut::map_mut(&file)? })
        } else {
            None
        };
        Ok(FillFile {
            file,
            map,
            tmp_path,
            final_path: final_path.into(),
            len: size as usize,
        })
    }

    pub fn data(&self) -> &[u8] {
        match &self.map {
            Some(m) => &m[..self.len],
            None => &[],
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.map {
            Some(m) => &mut m[..self.len],
            None => &mut [],
        }
    }

    /// Flush and atomically rename into place.
    pub fn publish(mut self) -> io::Result<()> {
        if let Some(map) = self.map.take() {
            map.flush()?;
        }
        self.file.sync_data()?;
        std::fs::rename(&self.tmp_path, &self.final_path)
    }

    /// Drop the tempfile; the entry never existed.
    pub fn abort(mut self) {
        drop(self.map.take());
        let _ = std::fs::remove_file(&self.tmp_path);
    }
}

/// `<root>/<etag[0..1]>/<etag[1..]>` for ETags of at least two bytes, else
/// `<root>/<etag>`, capping the per-tenant directory fan-out.
pub(crate) fn entry_path(root: &Utf8Path, etag: &str) -> Utf8PathBuf {
    debug_assert!(!etag.contains('/'), "etag must not contain path separators");
    if etag.len() >= 2 {
        root.join(&etag[..1]).join(&etag[1..])
    } else {
        root.join(etag)
    }
}
