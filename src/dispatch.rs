//! The compiler dispatcher: routes an elaborated module to a backend engine
//! and schedules JIT recompile-and-swap (§4.5).
//!
//! The software backend is always available and is installed synchronously;
//! a slower or specialized backend compiles asynchronously on a worker pool
//! while simulation continues on the software engine, then hands its
//! candidate engine to the scheduler through the state-safe swap protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::engine::{Engine, EngineId};
use crate::error::CompileError;
use crate::interrupt::InterruptQueue;
use crate::sim::Scheduler;

/// A source of engines for a module's text. Implementations are external
/// collaborators (the software interpreter, an FPGA toolchain driver, a
/// proxy compiler); `compile` runs on a dispatcher worker thread and must
/// poll `cancel` cooperatively.
pub trait Backend: Send + Sync {
    /// Compile `text` for module `eid` into a ready-to-swap engine.
    fn compile(&self, eid: EngineId, text: &str, cancel: &AtomicBool) -> Result<Box<dyn Engine>, CompileError>;
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of worker threads consuming compile jobs from a shared queue.
struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(worker_threads: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..worker_threads.max(1))
            .map(|_| {
                let receiver = Arc::clone(&receiver);
                thread::spawn(move || loop {
                    let job = {
                        let guard = receiver.lock().expect("worker queue mutex poisoned");
                        guard.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
            })
            .collect();
        Self {
            sender: Some(sender),
            handles,
        }
    }

    fn execute(&self, job: Job) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(job);
        }
    }

    fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Routes modules to backends and schedules JIT swaps.
pub struct Dispatcher {
    interrupts: Arc<InterruptQueue>,
    pool: WorkerPool,
    /// eid -> cancellation flag for its outstanding compile. Presence of a
    /// key is the per-eid compile lock; a second `dispatch` for the same
    /// eid while one is outstanding is rejected.
    compiling: Arc<Mutex<HashMap<EngineId, Arc<AtomicBool>>>>,
}

impl Dispatcher {
    /// Build a dispatcher with `worker_threads` background workers, sharing
    /// `interrupts` with the scheduler the swaps will be enqueued against.
    pub fn new(worker_threads: usize, interrupts: Arc<InterruptQueue>) -> Self {
        Self {
            interrupts,
            pool: WorkerPool::new(worker_threads),
            compiling: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Install `engine` synchronously under `eid` (the always-available software fallback).
    pub fn install_sync(&self, scheduler: &Arc<Mutex<Scheduler>>, eid: EngineId, engine: Box<dyn Engine>, interface: crate::sim::BoxedInterface) {
        scheduler.lock().expect("scheduler mutex poisoned").install(eid, engine, interface);
    }

    /// Asynchronously compile `text` for `eid` against `backend`, swapping the
    /// installed engine in on success. Rejects a second outstanding compile
    /// for the same `eid`.
    pub fn dispatch_compile(
        &self,
        eid: EngineId,
        backend: Arc<dyn Backend>,
        text: String,
        scheduler: Arc<Mutex<Scheduler>>,
    ) -> Result<(), CompileError> {
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut compiling = self.compiling.lock().expect("compiling table mutex poisoned");
            if compiling.contains_key(&eid) {
                return Err(CompileError::Rejected(format!(
                    "a compile for engine {eid} is already outstanding"
                )));
            }
            compiling.insert(eid, Arc::clone(&cancel));
        }

        let interrupts = Arc::clone(&self.interrupts);
        let compiling_table = Arc::clone(&self.compiling);
        self.pool.execute(Box::new(move || {
            let result = backend.compile(eid, &text, &cancel);

            // The swap is enqueued (if any) before the per-eid compile lock is
            // released, so a caller that observes `is_compiling(eid) == false`
            // is guaranteed the interrupt is already sitting in the queue.
            match result {
                Ok(_candidate) if cancel.load(Ordering::Relaxed) => {
                    debug!(eid, "compile finished after cancellation; discarding candidate");
                }
                Ok(candidate) => {
                    interrupts.schedule(move || {
                        let mut sched = scheduler.lock().expect("scheduler mutex poisoned");
                        if sched.swap_engine(eid, candidate) {
                            debug!(eid, "engine swap completed");
                        } else {
                            warn!(eid, "engine removed before swap could run; candidate discarded");
                        }
                    });
                }
                Err(CompileError::Cancelled) => {
                    debug!(eid, "compile cancelled");
                }
                Err(err) => {
                    warn!(eid, %err, "compile failed; continuing on installed engine");
                }
            }

            compiling_table.lock().expect("compiling table mutex poisoned").remove(&eid);
        }));
        Ok(())
    }

    /// Cancel the outstanding compile for `eid`, if any. Produces no swap.
    pub fn stop_compile(&self, eid: EngineId) {
        if let Some(cancel) = self.compiling.lock().expect("compiling table mutex poisoned").get(&eid) {
            cancel.store(true, Ordering::Relaxed);
        }
    }

    /// Cancel every outstanding compile.
    pub fn stop_compile_all(&self) {
        for cancel in self.compiling.lock().expect("compiling table mutex poisoned").values() {
            cancel.store(true, Ordering::Relaxed);
        }
    }

    /// True iff a compile is currently outstanding for `eid`.
    pub fn is_compiling(&self, eid: EngineId) -> bool {
        self.compiling.lock().expect("compiling table mutex poisoned").contains_key(&eid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::Bits;
    use crate::engine::software::{Program, SoftwareEngine};
    use crate::engine::NullInterface;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;
    use std::time::Duration;

    struct SlowBackend {
        started: Arc<AtomicUsize>,
    }

    impl Backend for SlowBackend {
        fn compile(&self, _eid: EngineId, _text: &str, cancel: &AtomicBool) -> Result<Box<dyn Engine>, CompileError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            for _ in 0..50 {
                if cancel.load(Ordering::Relaxed) {
                    return Err(CompileError::Cancelled);
                }
                sleep(Duration::from_millis(5));
            }
            // var 0 is overwritten by the outgoing engine's state during the
            // swap (the preserved-state invariant); var 1 only exists on this
            // candidate, so its survival proves the swap actually installed it.
            Ok(Box::new(SoftwareEngine::new(Program {
                inputs: vec![],
                initial: vec![(0, Bits::from_u64(42, 8)), (1, Bits::from_u64(7, 8))],
                comb: vec![],
                clocked: vec![],
            })))
        }
    }

    fn scheduler_with_software_engine(interrupts: Arc<InterruptQueue>) -> Arc<Mutex<Scheduler>> {
        let mut scheduler = Scheduler::new(Arc::clone(&interrupts));
        scheduler.install(
            0,
            Box::new(SoftwareEngine::new(Program {
                inputs: vec![],
                initial: vec![(0, Bits::zero(8, false))],
                comb: vec![],
                clocked: vec![],
            })),
            Box::new(NullInterface),
        );
        Arc::new(Mutex::new(scheduler))
    }

    #[test]
    fn successful_compile_swaps_engine_via_interrupt() {
        let interrupts = Arc::new(InterruptQueue::new());
        let scheduler = scheduler_with_software_engine(Arc::clone(&interrupts));
        let dispatcher = Dispatcher::new(2, Arc::clone(&interrupts));
        let backend = Arc::new(SlowBackend {
            started: Arc::new(AtomicUsize::new(0)),
        });

        dispatcher
            .dispatch_compile(0, backend, "module text".to_string(), Arc::clone(&scheduler))
            .unwrap();

        // Give the worker time to finish and enqueue its interrupt.
        let mut waited = Duration::ZERO;
        while dispatcher.is_compiling(0) && waited < Duration::from_secs(2) {
            sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        interrupts.drain();

        let locked = scheduler.lock().unwrap();
        assert_eq!(locked.read(0, 0), Some(Bits::zero(8, false)));
        assert_eq!(locked.read(0, 1), Some(Bits::from_u64(7, 8)));
    }

    #[test]
    fn concurrent_compile_for_same_eid_is_rejected() {
        let interrupts = Arc::new(InterruptQueue::new());
        let scheduler = scheduler_with_software_engine(Arc::clone(&interrupts));
        let dispatcher = Dispatcher::new(2, Arc::clone(&interrupts));
        let backend = Arc::new(SlowBackend {
            started: Arc::new(AtomicUsize::new(0)),
        });

        dispatcher
            .dispatch_compile(
                0,
                Arc::clone(&backend) as Arc<dyn Backend>,
                "a".to_string(),
                Arc::clone(&scheduler),
            )
            .unwrap();
        let second = dispatcher.dispatch_compile(
            0,
            backend as Arc<dyn Backend>,
            "b".to_string(),
            scheduler,
        );
        assert!(second.is_err());
        dispatcher.stop_compile(0);
    }

    #[test]
    fn cancelled_compile_produces_no_swap() {
        let interrupts = Arc::new(InterruptQueue::new());
        let scheduler = scheduler_with_software_engine(Arc::clone(&interrupts));
        let dispatcher = Dispatcher::new(2, Arc::clone(&interrupts));
        let backend = Arc::new(SlowBackend {
            started: Arc::new(AtomicUsize::new(0)),
        });

        dispatcher
            .dispatch_compile(0, backend, "module text".to_string(), Arc::clone(&scheduler))
            .unwrap();
        dispatcher.stop_compile(0);

        let mut waited = Duration::ZERO;
        while dispatcher.is_compiling(0) && waited < Duration::from_secs(2) {
            sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        interrupts.drain();

        let read = scheduler.lock().unwrap().read(0, 0);
        assert_eq!(read, Some(Bits::zero(8, false)));
    }
}
