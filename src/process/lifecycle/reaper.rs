/*!
 * Thread Reaper
 *
 * A terminated thread cannot free the kernel stack it is still running on.
 * The exit path pushes it onto a lock-free list and the single reaper
 * worker frees it once the host thread is observed to have stopped.
 *
 * The `active` flag makes the worker the sole drainer: only the enqueuer
 * that raises it sends a kick, and the worker re-arms itself when entries
 * arrive between finishing a drain and lowering the flag.
 */

use crate::core::errors::{KernelError, KernelResult};
use crate::kernel::CidTable;
use crate::monitoring::LifecycleStats;
use crate::process::collaborators::KernelStackAllocator;
use crate::process::thread::ThreadState;
use crate::process::Thread;
use crossbeam_queue::SegQueue;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

enum ReaperCommand {
    Drain,
    Shutdown,
}

struct ReaperShared {
    queue: SegQueue<Arc<Thread>>,
    active: AtomicBool,
    /// Enqueued and not yet reaped
    outstanding: AtomicUsize,
    reaped: AtomicU64,
    idle_lock: Mutex<()>,
    idle: Condvar,
    cids: Arc<CidTable>,
    stacks: Arc<dyn KernelStackAllocator>,
    stats: Arc<LifecycleStats>,
}

pub struct Reaper {
    shared: Arc<ReaperShared>,
    tx: flume::Sender<ReaperCommand>,
    worker: ThreadId,
}

impl Reaper {
    pub(crate) fn start(
        cids: Arc<CidTable>,
        stacks: Arc<dyn KernelStackAllocator>,
        stats: Arc<LifecycleStats>,
    ) -> KernelResult<Self> {
        let shared = Arc::new(ReaperShared {
            queue: SegQueue::new(),
            active: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            reaped: AtomicU64::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            cids,
            stacks,
            stats,
        });
        let (tx, rx) = flume::unbounded();

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || worker_shared.run(rx))
            .map_err(|e| KernelError::Unsuccessful(format!("reaper worker: {}", e)))?;

        info!("Reaper worker started");
        Ok(Self {
            shared,
            tx,
            worker: handle.thread().id(),
        })
    }

    /// Hand a terminated thread over for stack release
    pub(crate) fn enqueue(&self, thread: Arc<Thread>) {
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        self.shared.queue.push(thread);
        if !self.shared.active.swap(true, Ordering::AcqRel)
            && self.tx.send(ReaperCommand::Drain).is_err()
        {
            warn!("Reaper worker gone; terminated threads will not be reaped");
        }
    }

    /// Threads waiting to be reaped
    pub fn pending(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn reaped(&self) -> u64 {
        self.shared.reaped.load(Ordering::Relaxed)
    }

    /// Host thread the worker runs on
    #[inline]
    pub fn worker_thread(&self) -> ThreadId {
        self.worker
    }

    /// Block until nothing is waiting to be reaped; false on timeout
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.idle_lock.lock();
        while self.pending() > 0 {
            if self.shared.idle.wait_until(&mut guard, deadline).timed_out() {
                return self.pending() == 0;
            }
        }
        true
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        let _ = self.tx.send(ReaperCommand::Shutdown);
    }
}

impl std::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("pending", &self.pending())
            .field("reaped", &self.reaped())
            .finish()
    }
}

impl ReaperShared {
    fn run(&self, rx: flume::Receiver<ReaperCommand>) {
        while let Ok(command) = rx.recv() {
            match command {
                ReaperCommand::Shutdown => break,
                ReaperCommand::Drain => loop {
                    self.drain();
                    self.active.store(false, Ordering::Release);
                    // Raced with an enqueue that saw the flag still up
                    if self.queue.is_empty() || self.active.swap(true, Ordering::AcqRel) {
                        break;
                    }
                },
            }
        }
        debug!("Reaper worker stopped");
    }

    fn drain(&self) {
        let mut batch = 0usize;
        while let Some(thread) = self.queue.pop() {
            self.reap(&thread);
            batch += 1;
            if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                let _guard = self.idle_lock.lock();
                self.idle.notify_all();
            }
        }
        if batch > 0 {
            self.stats.inc_reaper_batches();
            debug!("Reaped {} threads", batch);
        }
    }

    fn reap(&self, thread: &Arc<Thread>) {
        if let Some(host) = thread.take_host() {
            if host.thread().id() != std::thread::current().id() && host.join().is_err() {
                warn!("Host of TID {} ended abnormally", thread.tid());
            }
        }

        if let Some(stack) = thread.take_kernel_stack() {
            self.stacks.free(stack);
            self.stats.inc_stacks_reaped();
        }
        thread.advance(ThreadState::Reaped);
        self.cids.remove_thread(thread.tid());

        if let Some(process) = thread.process() {
            process.remove_thread(thread);
            if process.exited().is_set() && process.thread_count() == 0 {
                self.cids.remove_process(process.pid());
            }
        }
        self.reaped.fetch_add(1, Ordering::Relaxed);
    }
}
