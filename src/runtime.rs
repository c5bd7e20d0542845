//! The top-level runtime: owns the scheduler, the compiler dispatcher, and
//! the shared interrupt queue, and drives simulation steps until asked to
//! stop. Modeled after the original driver's `main` (`tools/cascade.cc`),
//! stripped of CLI-flag parsing, the REPL, and terminal pretty-printing —
//! all external collaborators per §1.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::config::Config;
use crate::dispatch::{Backend, Dispatcher};
use crate::engine::{Engine, EngineId};
use crate::error::CompileError;
use crate::interrupt::InterruptQueue;
use crate::sim::{BoxedInterface, Scheduler};

/// Owns every runtime subsystem and the single shutdown flag that stops
/// them all: the scheduler thread's step loop, compile workers, and proxy
/// listener threads.
pub struct Runtime {
    scheduler: Arc<Mutex<Scheduler>>,
    dispatcher: Dispatcher,
    interrupts: Arc<InterruptQueue>,
    running: Arc<AtomicBool>,
    next_eid: AtomicU32,
    config: Config,
}

impl Runtime {
    /// Build a runtime from `config`, installing the logging subscriber per
    /// `config.enable_log`.
    pub fn new(config: Config) -> Self {
        crate::log::init(&config);
        let interrupts = Arc::new(InterruptQueue::new());
        let scheduler = Arc::new(Mutex::new(Scheduler::new(Arc::clone(&interrupts))));
        let dispatcher = Dispatcher::new(config.worker_threads, Arc::clone(&interrupts));
        Self {
            scheduler,
            dispatcher,
            interrupts,
            running: Arc::new(AtomicBool::new(true)),
            next_eid: AtomicU32::new(1),
            config,
        }
    }

    /// Allocate a fresh, stable engine id.
    pub fn next_engine_id(&self) -> EngineId {
        self.next_eid.fetch_add(1, Ordering::Relaxed)
    }

    /// Install `engine` synchronously under `eid` — the always-available software fallback.
    pub fn install(&self, eid: EngineId, engine: Box<dyn Engine>, interface: BoxedInterface) {
        self.scheduler.lock().expect("scheduler mutex poisoned").install(eid, engine, interface);
    }

    /// Dispatch an asynchronous recompile of `eid` against `backend`,
    /// swapping it in on success per the JIT protocol.
    pub fn dispatch_compile(&self, eid: EngineId, backend: Arc<dyn Backend>, text: String) -> Result<(), CompileError> {
        self.dispatcher.dispatch_compile(eid, backend, text, Arc::clone(&self.scheduler))
    }

    /// Cancel the outstanding compile for `eid`, if any.
    pub fn stop_compile(&self, eid: EngineId) {
        self.dispatcher.stop_compile(eid);
    }

    /// Cancel every outstanding compile.
    pub fn stop_compile_all(&self) {
        self.dispatcher.stop_compile_all();
    }

    /// The shared interrupt queue, for components (proxy listeners, compile
    /// workers) that need to schedule state-safe work from another thread.
    pub fn interrupts(&self) -> &Arc<InterruptQueue> {
        &self.interrupts
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// True once `request_stop` has been called or `done_simulation` fired
    /// on some engine.
    pub fn should_stop(&self) -> bool {
        !self.running.load(Ordering::Relaxed) || self.scheduler.lock().expect("scheduler mutex poisoned").finished()
    }

    /// Request that `run` return at its next step boundary. Safe to call
    /// from a signal handler's async-signal-safe successor (a flag set from
    /// any thread), mirroring the original's `request_stop`.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Run delta-cycle steps until `should_stop()`. Returns the number of steps executed.
    pub fn run(&self) -> u64 {
        let mut steps = 0;
        info!(march = %self.config.default_backend, "runtime starting");
        while !self.should_stop() {
            self.scheduler.lock().expect("scheduler mutex poisoned").step();
            steps += 1;
        }
        info!(steps, "runtime stopped");
        steps
    }

    /// Read a port value off the engine installed under `eid`.
    pub fn read(&self, eid: EngineId, vid: crate::engine::VarId) -> Option<crate::bits::Bits> {
        self.scheduler.lock().expect("scheduler mutex poisoned").read(eid, vid)
    }

    /// Borrow the scheduler's module graph for mutation (elaboration wiring port bindings).
    pub fn with_graph<R>(&self, f: impl FnOnce(&mut crate::sim::ModuleGraph) -> R) -> R {
        f(self.scheduler.lock().expect("scheduler mutex poisoned").graph_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::Bits;
    use crate::engine::software::{CombOp, Program, SoftwareEngine};
    use crate::engine::NullInterface;

    #[test]
    fn runtime_steps_an_installed_engine() {
        let runtime = Runtime::new(Config {
            enable_log: false,
            ..Config::default()
        });
        let eid = runtime.next_engine_id();
        runtime.install(
            eid,
            Box::new(SoftwareEngine::new(Program {
                inputs: vec![],
                initial: vec![(0, Bits::from_u64(0, 1))],
                comb: vec![CombOp::Assign {
                    out: 0,
                    inp: 0,
                    negate: true,
                }],
                clocked: vec![],
            })),
            Box::new(NullInterface),
        );

        for _ in 0..3 {
            runtime.scheduler.lock().unwrap().step();
        }
        assert_eq!(runtime.read(eid, 0), Some(Bits::from_u64(1, 1)));
    }

    #[test]
    fn request_stop_halts_run() {
        let runtime = Arc::new(Runtime::new(Config {
            enable_log: false,
            ..Config::default()
        }));
        let eid = runtime.next_engine_id();
        runtime.install(
            eid,
            Box::new(SoftwareEngine::new(Program::default())),
            Box::new(NullInterface),
        );
        runtime.request_stop();
        let steps = runtime.run();
        assert_eq!(steps, 0);
    }
}
