//! Content-addressed, memory-mapped data cache with single-filler
//! coalescing and asynchronous read-through.
//!
//! Callers hand the cache a [`Segment`] (identity, size, byte producer,
//! decoder) and a sink. A populated entry is served from a refcounted
//! read-only mapping; a miss triggers a fill that writes the bytes to disk
//! and demuxes the decoded output to every caller currently waiting on the
//! same ETag. Resource-level failures never reach callers: the cache
//! degrades to plain read-through and counts the event.

mod fill;
mod mapping;

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use camino::Utf8PathBuf;
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use utils::event_counter::EventCounter;

use fill::{FillPool, Reservation};
pub use mapping::Mapping;
use mapping::{entry_path, FillFile};

/// Abstract source of one cacheable byte range.
///
/// The ETag uniquely identifies the content and must not contain `/`;
/// `open` must yield exactly `size` bytes; `decode` transforms the cached
/// bytes into whatever the sink expects.
pub trait Segment: Send + Sync {
    fn etag(&self) -> &str;
    fn size(&self) -> u64;
    /// Coalescing hook; only invoked with a segment of the same ETag.
    fn merge(&self, _other: &dyn Segment) {}
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
    fn decode(&self, dst: &mut dyn Write, src: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Probe only: serve a hit if present, otherwise stream uncached
    /// without creating a backing file.
    pub const NO_FILL: Flags = Flags(1 << 0);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("unexpected end of segment source")]
    UnexpectedEof,
    #[error("segment source: {0}")]
    Source(String),
    #[error("sink write: {0}")]
    Sink(String),
    #[error("segment decode: {0}")]
    Decode(String),
    #[error("cancelled between segments")]
    Cancelled,
    #[error("fill abandoned")]
    Aborted,
}

impl CacheError {
    fn source_err(e: &io::Error) -> CacheError {
        CacheError::Source(e.to_string())
    }
    pub(crate) fn sink(e: &io::Error) -> CacheError {
        CacheError::Sink(e.to_string())
    }
    fn decode_err(e: &io::Error) -> CacheError {
        CacheError::Decode(e.to_string())
    }
}

#[derive(Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
    live_mappings: AtomicU64,
}

impl CacheMetrics {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
    pub fn live_mappings(&self) -> u64 {
        self.live_mappings.load(Ordering::Relaxed)
    }
}

struct MappingEntry {
    mapping: Arc<Mapping>,
    refs: u64,
}

struct CacheState {
    inflight: HashMap<String, Arc<Reservation>>,
    mappings: HashMap<String, MappingEntry>,
}

struct CacheShared {
    root: Utf8PathBuf,
    state: Mutex<CacheState>,
    /// Signalled whenever an in-flight entry clears, for callers that
    /// arrived after the fill sealed its waiter list.
    fill_done: Condvar,
    metrics: CacheMetrics,
    events: Option<Arc<EventCounter>>,
}

/// Refcounted view of a populated entry. Dropping the handle releases the
/// reference under the cache lock; the mapping and file close when the last
/// reference goes.
pub struct MappingHandle {
    shared: Arc<CacheShared>,
    etag: String,
    mapping: Arc<Mapping>,
}

impl MappingHandle {
    pub fn data(&self) -> &[u8] {
        self.mapping.data()
    }
}

impl Drop for MappingHandle {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(entry) = state.mappings.get_mut(&self.etag) {
            entry.refs -= 1;
            if entry.refs == 0 {
                state.mappings.remove(&self.etag);
                self.shared
                    .metrics
                    .live_mappings
                    .fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

pub struct DataCache {
    shared: Arc<CacheShared>,
    pool: FillPool,
}

impl DataCache {
    pub fn new(root: Utf8PathBuf, events: Option<Arc<EventCounter>>) -> io::Result<DataCache> {
        std::fs::create_dir_all(&root)?;
        Ok(DataCache {
            shared: Arc::new(CacheShared {
                root,
                state: Mutex::new(CacheState {
                    inflight: HashMap::new(),
                    mappings: HashMap::new(),
                }),
                fill_done: Condvar::new(),
                metrics: CacheMetrics::default(),
                events,
            }),
            pool: FillPool::new(num_cpus::get()),
        })
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.shared.metrics
    }

    pub fn get(&self, segment: Arc<dyn Segment>, flags: Flags) -> Table<'_> {
        Table {
            cache: self,
            segment,
            flags,
            hits: 0,
            misses: 0,
        }
    }

    pub fn multi_get(
        &self,
        segments: Vec<Arc<dyn Segment>>,
        cancel: CancellationToken,
        flags: Flags,
    ) -> MultiTable<'_> {
        MultiTable {
            cache: self,
            segments,
            cancel,
            flags,
            hits: 0,
            misses: 0,
        }
    }
}

impl Drop for DataCache {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

/// Handle for serving one segment.
pub struct Table<'a> {
    cache: &'a DataCache,
    segment: Arc<dyn Segment>,
    flags: Flags,
    hits: u64,
    misses: u64,
}

impl Table<'_> {
    pub fn hits(&self) -> u64 {
        self.hits
    }
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Serve the segment into `sink`: a read-only hit, a joined or freshly
    /// started fill, or uncached read-through.
    pub fn write_chunks(&mut self, mut sink: Box<dyn Write + Send>) -> Result<(), CacheError> {
        let shared = &self.cache.shared;
        let etag = self.segment.etag().to_string();
        debug_assert!(!etag.contains('/'), "etag must not contain path separators");

        loop {
            let mut state = shared.state.lock();

            // live read-only mapping
            if let Some(entry) = state.mappings.get_mut(&etag) {
                entry.refs += 1;
                let handle = MappingHandle {
                    shared: Arc::clone(shared),
                    etag: etag.clone(),
                    mapping: Arc::clone(&entry.mapping),
                };
                drop(state);
                return self.finish_hit(&handle, &mut sink);
            }

            // in-flight fill to coalesce onto
            if let Some(res) = state.inflight.get(&etag) {
                let res = Arc::clone(res);
                drop(state);
                match res.try_join(&self.segment, sink) {
                    Ok(rx) => {
                        // a coalesced access is a hit for the late waiter
                        self.hits += 1;
                        shared.metrics.hits.fetch_add(1, Ordering::Relaxed);
                        return rx.blocking_recv().unwrap_or(Err(CacheError::Aborted));
                    }
                    Err(returned) => {
                        // output already streaming; wait out the fill, then
                        // the renamed file serves us as a plain hit
                        sink = returned;
                        let mut state = shared.state.lock();
                        while state.inflight.contains_key(&etag) {
                            shared.fill_done.wait(&mut state);
                        }
                        continue;
                    }
                }
            }
            drop(state);

            // populated file on disk?
            let path = entry_path(&shared.root, &etag);
            match Mapping::open_readonly(&path) {
                Ok(fresh) => {
                    let handle = install_mapping(shared, &etag, fresh);
                    return self.finish_hit(&handle, &mut sink);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(%etag, "cache mapping failed, falling back to read-through: {e}");
                    shared.metrics.failures.fetch_add(1, Ordering::Relaxed);
                    self.misses += 1;
                    shared.metrics.misses.fetch_add(1, Ordering::Relaxed);
                    return uncached_read_through(self.segment.as_ref(), &mut sink);
                }
            }

            // genuine miss
            if self.flags.contains(Flags::NO_FILL) {
                self.misses += 1;
                shared.metrics.misses.fetch_add(1, Ordering::Relaxed);
                return uncached_read_through(self.segment.as_ref(), &mut sink);
            }

            let mut state = shared.state.lock();
            if state.mappings.contains_key(&etag) || state.inflight.contains_key(&etag) {
                // lost a race while probing the filesystem
                drop(state);
                continue;
            }
            let (res, rx) = Reservation::new(etag.clone(), Arc::clone(&self.segment), sink);
            state.inflight.insert(etag.clone(), Arc::clone(&res));
            drop(state);
            self.misses += 1;
            shared.metrics.misses.fetch_add(1, Ordering::Relaxed);

            match self.cache.pool.try_background() {
                Some(permit) => {
                    let shared = Arc::clone(shared);
                    self.cache.pool.submit(Box::new(move || {
                        let _permit = permit;
                        run_fill(&shared, &res);
                    }));
                }
                None => run_fill(shared, &res),
            }
            return rx.blocking_recv().unwrap_or(Err(CacheError::Aborted));
        }
    }

    fn finish_hit(
        &mut self,
        handle: &MappingHandle,
        sink: &mut Box<dyn Write + Send>,
    ) -> Result<(), CacheError> {
        self.hits += 1;
        self.cache
            .shared
            .metrics
            .hits
            .fetch_add(1, Ordering::Relaxed);
        self.segment
            .decode(sink.as_mut(), handle.data())
            .map_err(|e| CacheError::decode_err(&e))
    }
}

/// Handle for serving a batch of segments to a set of parallel sinks.
///
/// Segments are dealt to the sinks round-robin. Cancellation is honored
/// between segments only; an active fill always runs to completion so its
/// coalesced peers are not punished for this caller's cancellation.
pub struct MultiTable<'a> {
    cache: &'a DataCache,
    segments: Vec<Arc<dyn Segment>>,
    cancel: CancellationToken,
    flags: Flags,
    hits: u64,
    misses: u64,
}

impl MultiTable<'_> {
    pub fn hits(&self) -> u64 {
        self.hits
    }
    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn write_chunks(&mut self, sinks: Vec<Box<dyn Write + Send>>) -> Result<(), CacheError> {
        if sinks.is_empty() {
            return Ok(());
        }
        let sinks: Vec<SharedSink> = sinks.into_iter().map(SharedSink::new).collect();
        for (i, segment) in self.segments.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            let mut table = self.cache.get(Arc::clone(segment), self.flags);
            let sink = Box::new(sinks[i % sinks.len()].clone());
            let res = table.write_chunks(sink);
            self.hits += table.hits();
            self.misses += table.misses();
            res?;
        }
        Ok(())
    }
}

/// Sink shim that lets one writer be targeted by many sequential segment
/// serves (and survive being moved into a fill's waiter list).
#[derive(Clone)]
struct SharedSink(Arc<Mutex<Box<dyn Write + Send>>>);

impl SharedSink {
    fn new(inner: Box<dyn Write + Send>) -> SharedSink {
        SharedSink(Arc::new(Mutex::new(inner)))
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().flush()
    }
}

fn install_mapping(shared: &Arc<CacheShared>, etag: &str, fresh: Mapping) -> MappingHandle {
    let mut state = shared.state.lock();
    let entry = state
        .mappings
        .entry(etag.to_string())
        .and_modify(|e| e.refs += 1)
        .or_insert_with(|| {
            shared.metrics.live_mappings.fetch_add(1, Ordering::Relaxed);
            MappingEntry {
                mapping: Arc::new(fresh),
                refs: 1,
            }
        });
    MappingHandle {
        shared: Arc::clone(shared),
        etag: etag.to_string(),
        mapping: Arc::clone(&entry.mapping),
    }
}

fn copy_source(segment: &dyn Segment, dst: &mut [u8]) -> Result<(), CacheError> {
    let mut src = segment.open().map_err(|e| CacheError::source_err(&e))?;
    let mut off = 0;
    while off < dst.len() {
        match src.read(&mut dst[off..]) {
            Ok(0) => return Err(CacheError::UnexpectedEof),
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(CacheError::UnexpectedEof)
            }
            Err(e) => return Err(CacheError::source_err(&e)),
        }
    }
    Ok(())
}

fn uncached_read_through(
    segment: &dyn Segment,
    sink: &mut Box<dyn Write + Send>,
) -> Result<(), CacheError> {
    let mut buf = vec![0u8; segment.size() as usize];
    copy_source(segment, &mut buf)?;
    segment
        .decode(sink.as_mut(), &buf)
        .map_err(|e| CacheError::decode_err(&e))
}

/// Execute one fill: produce the bytes into the backing file, stream the
/// decoded output to every waiter, publish the entry.
fn run_fill(shared: &Arc<CacheShared>, res: &Arc<Reservation>) {
    // the in-flight entry must clear no matter how the fill ends
    let guard = scopeguard::guard((Arc::clone(shared), res.etag.clone()), |(shared, etag)| {
        let mut state = shared.state.lock();
        state.inflight.remove(&etag);
        drop(state);
        shared.fill_done.notify_all();
    });

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| fill_once(shared, res)));
    if outcome.is_err() {
        warn!(etag = %res.etag, "cache fill panicked; waiters were dropped");
    }
    drop(guard);
}

fn fill_once(shared: &Arc<CacheShared>, res: &Arc<Reservation>) {
    let size = res.segment.size();
    let path = entry_path(&shared.root, &res.etag);

    let fill_file = match FillFile::create(&path, size) {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(etag = %res.etag, "cache fill setup failed, serving uncached: {e}");
            shared.metrics.failures.fetch_add(1, Ordering::Relaxed);
            None
        }
    };

    match fill_file {
        Some(mut file) => {
            if let Err(e) = copy_source(res.segment.as_ref(), file.data_mut()) {
                file.abort();
                res.fail_all(e);
                return;
            }
            let mut tee = res.seal();
            let decoded = res.segment.decode(&mut tee, file.data());
            match decoded {
                Ok(()) => {
                    match file.publish() {
                        Ok(()) => {
                            if let Some(events) = &shared.events {
                                let _ = events.bump();
                            }
                        }
                        Err(e) => {
                            // the waiters got their bytes; only caching failed
                            warn!(etag = %res.etag, "cache publish failed: {e}");
                            shared.metrics.failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    tee.finish(Ok(()));
                }
                Err(e) => {
                    file.abort();
                    tee.finish(Err(CacheError::decode_err(&e)));
                }
            }
        }
        None => {
            // uncached read-through for the whole waiter set
            let mut buf = vec![0u8; size as usize];
            if let Err(e) = copy_source(res.segment.as_ref(), &mut buf) {
                res.fail_all(e);
                return;
            }
            let mut tee = res.seal();
            match res.segment.decode(&mut tee, &buf) {
                Ok(()) => tee.finish(Ok(())),
                Err(e) => tee.finish(Err(CacheError::decode_err(&e))),
            }
        }
    }
}
