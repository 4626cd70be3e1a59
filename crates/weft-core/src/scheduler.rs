//! Parallel execution of a compiled plan.
//!
//! One driver thread (the driver boundary's caller) plus N-1 workers jointly
//! sweep the compiled node list each cycle. A node is executed by whichever
//! thread wins its claim; the claim only succeeds once every provider has
//! signaled, so a won claim is immediately runnable and no thread ever waits
//! while holding a node. There is no central work queue, only per-node
//! atomics and the per-cycle whip/finish handshake.

use crate::context::{CycleClock, NotificationRx, RtContext};
use crate::graph::CompiledGraph;
use crate::lockfree::Semaphore;
use arc_swap::ArcSwapOption;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

struct WorkerSync {
    /// Driver -> worker: a cycle's plan is staged, start sweeping.
    whip: Semaphore,
    /// Worker -> driver: this worker's sweep is over for the cycle.
    done: Semaphore,
}

struct SchedShared {
    /// Plan for the cycle in flight. Staged by the driver before the whip,
    /// cleared after the finish handshake.
    current: ArcSwapOption<CompiledGraph>,
    /// Nodes executed so far this cycle.
    executed: AtomicUsize,
    running: AtomicBool,
    workers: Vec<WorkerSync>,
    /// Total participating threads, workers plus driver.
    threads: usize,
}

/// One claim sweep over the list from a staggered start point. Returns true
/// if anything was claimed.
fn sweep(
    plan: &CompiledGraph,
    start: usize,
    rt: &mut RtContext,
    executed: &AtomicUsize,
) -> bool {
    let n = plan.len();
    let mut claimed_any = false;
    for k in 0..n {
        let entry = &plan.entries()[(start + k) % n];
        if entry.try_claim() {
            claimed_any = true;
            entry.block().process(rt);
            for &s in entry.successors() {
                plan.entries()[s as usize].signal_ready();
            }
            executed.fetch_add(1, Ordering::AcqRel);
        }
    }
    claimed_any
}

fn worker_loop(shared: Arc<SchedShared>, mut rt: RtContext) {
    let id = rt.worker_id();
    if let Err(e) = thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max)
    {
        warn!(worker = id, "could not raise worker priority: {e:?}");
    }
    loop {
        shared.workers[id - 1].whip.wait();
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        if let Some(plan) = shared.current.load_full() {
            let n = plan.len();
            if n > 0 {
                let start = id * n / shared.threads;
                // Keep sweeping while progress is possible; a claim-free
                // full pass means everything left is claimed or finished.
                while sweep(&plan, start, &mut rt, &shared.executed) {}
            }
        }
        shared.workers[id - 1].done.post();
    }
    debug!(worker = id, "scheduler worker exiting");
}

/// The cycle-execution thread team.
pub(crate) struct Scheduler {
    shared: Arc<SchedShared>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn `threads - 1` workers (the driver is the remaining thread).
    /// Returns the consumer ends of every worker's notification ring, the
    /// driver's included, indexed by thread id.
    pub(crate) fn new(
        threads: usize,
        clock: Arc<CycleClock>,
        ring_size: usize,
    ) -> std::io::Result<(Self, RtContext, Vec<NotificationRx>)> {
        let threads = threads.max(1);
        let (driver_rt, driver_rx) = RtContext::new(0, clock.clone(), ring_size);
        let mut receivers = vec![driver_rx];

        let shared = Arc::new(SchedShared {
            current: ArcSwapOption::empty(),
            executed: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            workers: (1..threads)
                .map(|_| WorkerSync {
                    whip: Semaphore::new(0),
                    done: Semaphore::new(0),
                })
                .collect(),
            threads,
        });

        let mut handles = Vec::with_capacity(threads - 1);
        for id in 1..threads {
            let (rt, rx) = RtContext::new(id, clock.clone(), ring_size);
            receivers.push(rx);
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("weft-worker-{id}"))
                .spawn(move || worker_loop(shared, rt))?;
            handles.push(handle);
        }
        Ok((Self { shared, handles }, driver_rt, receivers))
    }

    /// Execute one cycle of the plan. Called from the driver boundary; the
    /// driver thread itself participates in the sweep and does not return
    /// until every node has executed and every worker has quiesced.
    pub(crate) fn run_cycle(&self, plan: &Arc<CompiledGraph>, rt: &mut RtContext) {
        let n = plan.len();
        if n == 0 {
            return;
        }
        plan.reset();
        self.shared.executed.store(0, Ordering::Release);
        self.shared.current.store(Some(plan.clone()));
        for w in &self.shared.workers {
            w.whip.post();
        }
        while self.shared.executed.load(Ordering::Acquire) < n {
            if !sweep(plan, 0, rt, &self.shared.executed) {
                std::hint::spin_loop();
            }
        }
        for w in &self.shared.workers {
            w.done.wait();
        }
        self.shared.current.store(None);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        for w in &self.shared.workers {
            w.whip.post();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
