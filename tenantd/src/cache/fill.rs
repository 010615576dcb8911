//! Fill coalescing machinery: the per-ETag reservation that queues waiters,
//! the tee that demuxes one produced byte stream to all of their sinks, and
//! the bounded background pool fills may be handed to.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;
use tracing::error;

use super::{CacheError, Segment};

/// One caller blocked on an in-progress fill. The sink is written by the
/// filler; the channel delivers this caller's individual outcome.
pub(crate) struct Waiter {
    pub sink: Box<dyn Write + Send>,
    pub tx: oneshot::Sender<Result<(), CacheError>>,
}

struct ReservationState {
    /// Once sealed, the byte stream has started and late arrivals must wait
    /// for the fill to finish and re-probe instead of joining.
    sealed: bool,
    waiters: Vec<Waiter>,
}

/// A pending fill for one ETag plus everyone waiting on it.
pub(crate) struct Reservation {
    pub etag: String,
    pub segment: Arc<dyn Segment>,
    state: Mutex<ReservationState>,
}

impl Reservation {
    pub fn new(
        etag: String,
        segment: Arc<dyn Segment>,
        sink: Box<dyn Write + Send>,
    ) -> (Arc<Reservation>, oneshot::Receiver<Result<(), CacheError>>) {
        let (tx, rx) = oneshot::channel();
        let res = Arc::new(Reservation {
            etag,
            segment,
            state: Mutex::new(ReservationState {
                sealed: false,
                waiters: vec![Waiter { sink, tx }],
            }),
        });
        (res, rx)
    }

    /// Attach a late caller. Fails (returning the sink) once the output
    /// stream has begun; the caller then waits for completion and re-probes.
    pub fn try_join(
        &self,
        segment: &Arc<dyn Segment>,
        sink: Box<dyn Write + Send>,
    ) -> Result<oneshot::Receiver<Result<(), CacheError>>, Box<dyn Write + Send>> {
        let mut state = self.state.lock();
        if state.sealed {
            return Err(sink);
        }
        // coalescing hook: identical identity, possibly richer hints
        self.segment.merge(segment.as_ref());
        let (tx, rx) = oneshot::channel();
        state.waiters.push(Waiter { sink, tx });
        Ok(rx)
    }

    /// Stop accepting joiners and take the waiter set for streaming.
    pub fn seal(&self) -> TeeWriter {
        let mut state = self.state.lock();
        state.sealed = true;
        TeeWriter {
            active: std::mem::take(&mut state.waiters),
        }
    }

    /// Abort before any bytes were streamed: every waiter gets `err`.
    pub fn fail_all(&self, err: CacheError) {
        self.seal().finish(Err(err));
    }
}

/// Demuxes the decoded byte stream to every waiter sink.
///
/// A sink that fails to accept a write is detached right there with its own
/// error; the stream continues for the remaining sinks (and for the backing
/// file), so one slow-dying caller cannot poison its coalesced peers.
pub(crate) struct TeeWriter {
    active: Vec<Waiter>,
}

impl TeeWriter {
    pub fn finish(self, result: Result<(), CacheError>) {
        for waiter in self.active {
            let _ = waiter.tx.send(result.clone());
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut idx = 0;
        while idx < self.active.len() {
            match self.active[idx].sink.write_all(buf) {
                Ok(()) => idx += 1,
                Err(e) => {
                    let Waiter { sink, tx } = self.active.remove(idx);
                    drop(sink);
                    let _ = tx.send(Err(CacheError::sink(&e)));
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut idx = 0;
        while idx < self.active.len() {
            match self.active[idx].sink.flush() {
                Ok(()) => idx += 1,
                Err(e) => {
                    let Waiter { sink, tx } = self.active.remove(idx);
                    drop(sink);
                    let _ = tx.send(Err(CacheError::sink(&e)));
                }
            }
        }
        Ok(())
    }
}

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Shutdown,
}

struct JobQueue {
    jobs: Mutex<VecDeque<Job>>,
    available: Condvar,
}

/// Counted permits for running fills off the dispatching thread.
pub(crate) struct Slots {
    avail: Mutex<usize>,
}

pub(crate) struct SlotPermit {
    slots: Arc<Slots>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        *self.slots.avail.lock() += 1;
    }
}

/// Worker threads consuming the (unbounded) fill queue. Whether a given
/// fill goes to the pool at all is gated by [`Slots`], sized well below the
/// worker count so dispatchers degrade to inline fills under pressure
/// instead of queueing without bound.
pub(crate) struct FillPool {
    queue: Arc<JobQueue>,
    slots: Arc<Slots>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl FillPool {
    pub fn new(parallelism: usize) -> FillPool {
        let parallelism = parallelism.max(1);
        let queue = Arc::new(JobQueue {
            jobs: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        });
        let workers = (0..parallelism)
            .map(|i| {
                let queue = Arc::clone(&queue);
                thread::Builder::new()
                    .name(format!("cache-fill-{i}"))
                    .spawn(move || worker_main(&queue))
                    .expect("spawn cache fill worker")
            })
            .collect();
        FillPool {
            queue,
            slots: Arc::new(Slots {
                avail: Mutex::new(parallelism / 2 + 1),
            }),
            workers,
        }
    }

    /// A permit to run in the background, if any is free right now.
    pub fn try_background(&self) -> Option<SlotPermit> {
        let mut avail = self.slots.avail.lock();
        if *avail > 0 {
            *avail -= 1;
            Some(SlotPermit {
                slots: Arc::clone(&self.slots),
            })
        } else {
            None
        }
    }

    pub fn submit(&self, job: Box<dyn FnOnce() + Send>) {
        let mut jobs = self.queue.jobs.lock();
        jobs.push_back(Job::Run(job));
        drop(jobs);
        self.queue.available.notify_one();
    }

    /// Send one shutdown sentinel per worker and join them all.
    pub fn shutdown(&mut self) {
        {
            let mut jobs = self.queue.jobs.lock();
            for _ in &self.workers {
                jobs.push_back(Job::Shutdown);
            }
        }
        self.queue.available.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("cache fill worker panicked during shutdown");
            }
        }
    }
}

fn worker_main(queue: &JobQueue) {
    loop {
        let job = {
            let mut jobs = queue.jobs.lock();
            loop {
                if let Some(job) = jobs.pop_front() {
                    break job;
                }
                queue.available.wait(&mut jobs);
            }
        };
        match job {
            Job::Run(f) => f(),
            Job::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn pool_runs_jobs_and_shuts_down() {
        let mut pool = FillPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn slots_are_bounded() {
        let pool = FillPool::new(4);
        // 4/2 + 1 = 3 permits
        let a = pool.try_background().unwrap();
        let _b = pool.try_background().unwrap();
        let c = pool.try_background().unwrap();
        assert!(pool.try_background().is_none());
        drop(a);
        drop(c);
        assert!(pool.try_background().is_some());
    }
}
