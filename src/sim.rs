//! The core simulator: a deterministic delta-cycle scheduler driving a graph
//! of engines (§4.4).
//!
//! Each [`Scheduler::step`] call runs the fixed five-phase pipeline spec.md
//! lays out: drain pending non-blocking updates to a fixpoint, finalize,
//! propagate along the module graph's edges, evaluate, then drain state-safe
//! interrupts and poll `done_step`. Engines are always visited in id order so
//! that, for a fixed graph and fixed step sequence, `get_state` after each
//! step is a pure function of the initial state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::bits::Bits;
use crate::engine::{Engine, EngineId, Interface, SeekFrom, VarId};
use crate::interrupt::InterruptQueue;

/// One port-binding edge translated from elaboration: the value of
/// `src_var` on `src_engine` is propagated to `dst_var` on `dst_engine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Source engine id.
    pub src_engine: EngineId,
    /// Source variable id.
    pub src_var: VarId,
    /// Destination engine id.
    pub dst_engine: EngineId,
    /// Destination variable id.
    pub dst_var: VarId,
}

/// Nodes are engines, edges are port bindings. Swaps replace nodes; edges
/// never cross a swap.
#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    edges: Vec<Edge>,
}

impl ModuleGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `src_engine.src_var` to `dst_engine.dst_var`, in insertion order.
    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.push(edge);
    }

    /// Iterate the edge list in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }
}

/// A boxed dynamic `Interface`, one per engine, owned by the scheduler
/// alongside its engine.
pub type BoxedInterface = Box<dyn Interface + Send>;

/// Wraps a caller-supplied `Interface`, observing `$finish` so the scheduler
/// can terminate the run at the next step boundary without needing the
/// engine itself to implement `done_simulation` (§8 scenario 6).
struct TerminatingInterface {
    inner: BoxedInterface,
    finish_requested: Arc<AtomicBool>,
}

impl Interface for TerminatingInterface {
    fn write_bits(&mut self, vid: VarId, value: Bits) {
        self.inner.write_bits(vid, value);
    }
    fn write_bool(&mut self, vid: VarId, value: bool) {
        self.inner.write_bool(vid, value);
    }
    fn debug(&mut self, level: u32, text: &str) {
        self.inner.debug(level, text);
    }
    fn finish(&mut self, arg: i32) {
        self.finish_requested.store(true, Ordering::Relaxed);
        self.inner.finish(arg);
    }
    fn restart(&mut self, path: &str) {
        self.inner.restart(path);
    }
    fn retarget(&mut self, march: &str) {
        self.inner.retarget(march);
    }
    fn save(&mut self, path: &str) {
        self.inner.save(path);
    }
    fn fopen(&mut self, path: &str, mode: &str) -> Option<u32> {
        self.inner.fopen(path, mode)
    }
    fn in_avail(&mut self, handle: u32) -> i64 {
        self.inner.in_avail(handle)
    }
    fn pubseekoff(&mut self, handle: u32, off: i64, dir: SeekFrom) -> i64 {
        self.inner.pubseekoff(handle, off, dir)
    }
    fn pubseekpos(&mut self, handle: u32, pos: u64) -> i64 {
        self.inner.pubseekpos(handle, pos)
    }
    fn pubsync(&mut self, handle: u32) -> i32 {
        self.inner.pubsync(handle)
    }
    fn sbumpc(&mut self, handle: u32) -> Option<u8> {
        self.inner.sbumpc(handle)
    }
    fn sgetc(&mut self, handle: u32) -> Option<u8> {
        self.inner.sgetc(handle)
    }
    fn sgetn(&mut self, handle: u32, n: usize) -> Vec<u8> {
        self.inner.sgetn(handle, n)
    }
    fn sputc(&mut self, handle: u32, c: u8) -> bool {
        self.inner.sputc(handle, c)
    }
    fn sputn(&mut self, handle: u32, data: &[u8]) -> usize {
        self.inner.sputn(handle, data)
    }
}

/// One slot in the engine table: an engine plus its dedicated `Interface`.
struct Slot {
    engine: Box<dyn Engine>,
    interface: BoxedInterface,
    finish_requested: Arc<AtomicBool>,
}

/// Drives a [`ModuleGraph`] of engines through delta cycles. Exclusive owner
/// of the engine table; the dispatcher mutates it only from within a drained
/// interrupt.
pub struct Scheduler {
    engines: BTreeMap<EngineId, Slot>,
    graph: ModuleGraph,
    interrupts: Arc<InterruptQueue>,
    finished: bool,
}

impl Scheduler {
    /// A scheduler over an empty graph, sharing `interrupts` with the rest of the runtime.
    pub fn new(interrupts: Arc<InterruptQueue>) -> Self {
        Self {
            engines: BTreeMap::new(),
            graph: ModuleGraph::new(),
            interrupts,
            finished: false,
        }
    }

    /// Install `engine` under `eid`, replacing whatever was there. Must only
    /// be called from within a drained interrupt (the swap protocol) or
    /// before the scheduler starts stepping.
    pub fn install(&mut self, eid: EngineId, engine: Box<dyn Engine>, interface: BoxedInterface) {
        let finish_requested = Arc::new(AtomicBool::new(false));
        let interface: BoxedInterface = Box::new(TerminatingInterface {
            inner: interface,
            finish_requested: Arc::clone(&finish_requested),
        });
        self.engines.insert(
            eid,
            Slot {
                engine,
                interface,
                finish_requested,
            },
        );
    }

    /// Remove the engine installed under `eid`, if any.
    pub fn remove(&mut self, eid: EngineId) -> Option<Box<dyn Engine>> {
        self.engines.remove(&eid).map(|slot| slot.engine)
    }

    /// The JIT swap protocol body (§4.5 step 3): transfer `eid`'s installed
    /// engine's input/state onto `new_engine`, finalize it, then atomically
    /// replace the installed pointer. The old engine is dropped. Returns
    /// `false` (discarding `new_engine`) if `eid` was torn down before the
    /// swap could run.
    pub fn swap_engine(&mut self, eid: EngineId, mut new_engine: Box<dyn Engine>) -> bool {
        let Some(slot) = self.engines.get_mut(&eid) else {
            return false;
        };
        let input = slot.engine.get_input();
        let state = slot.engine.get_state();
        new_engine.set_input(input);
        new_engine.set_state(state);
        new_engine.finalize();
        slot.engine = new_engine;
        true
    }

    /// Borrow the edge list, mutably, to add port bindings produced by elaboration.
    pub fn graph_mut(&mut self) -> &mut ModuleGraph {
        &mut self.graph
    }

    /// The shared interrupt queue, for callers that need to schedule a
    /// swap or teardown from outside the scheduler thread.
    pub fn interrupts(&self) -> &Arc<InterruptQueue> {
        &self.interrupts
    }

    /// Read a port value off the engine installed under `eid`, if any.
    pub fn read(&self, eid: EngineId, vid: VarId) -> Option<crate::bits::Bits> {
        self.engines.get(&eid).map(|slot| slot.engine.read(vid))
    }

    /// True once `done_simulation` has fired on some engine or a `finish` was
    /// observed and the scheduler has returned from its next interrupt point.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Run one full delta-cycle step: drain updates to a fixpoint, finalize,
    /// propagate, evaluate, drain interrupts, poll `done_step`/`done_simulation`.
    pub fn step(&mut self) {
        self.drain_updates_to_fixpoint();
        self.finalize_all();
        self.propagate();
        self.evaluate_all();
        self.interrupts.drain();
        self.poll_done();
    }

    fn drain_updates_to_fixpoint(&mut self) {
        loop {
            let mut any = false;
            let ids: Vec<EngineId> = self.engines.keys().copied().collect();
            for id in ids {
                if let Some(slot) = self.engines.get_mut(&id) {
                    if slot.engine.conditional_update(slot.interface.as_mut()) {
                        any = true;
                    }
                }
            }
            if !any {
                break;
            }
        }
    }

    fn finalize_all(&mut self) {
        for slot in self.engines.values_mut() {
            slot.engine.finalize();
        }
    }

    fn propagate(&mut self) {
        for edge in self.graph.edges() {
            let Some(value) = self.engines.get(&edge.src_engine).map(|s| s.engine.read(edge.src_var)) else {
                continue;
            };
            if let Some(dst) = self.engines.get_mut(&edge.dst_engine) {
                let mut input = crate::engine::Input::new();
                input.insert(edge.dst_var, vec![value]);
                dst.engine.set_input(input);
            }
        }
    }

    /// Every engine re-evaluates its combinational logic every step,
    /// regardless of whether propagation touched its inputs: a module with
    /// no input ports at all (e.g. a free-running comb loop) still needs to
    /// react to its own internal state each delta cycle.
    fn evaluate_all(&mut self) {
        for slot in self.engines.values_mut() {
            slot.engine.evaluate(slot.interface.as_mut());
        }
    }

    /// Polls each engine for the end-of-step/end-of-simulation signals, and
    /// tears down any engine that surfaced a fault (e.g. a proxy whose sync
    /// socket hit a `TransportError`). Runs after `interrupts.drain()`, the
    /// same exclusive-access point state-safe interrupts rely on, so removing
    /// a faulted engine here carries the same atomicity guarantee a queued
    /// interrupt would — without needing a self-referential handle back into
    /// the scheduler for the closure to call `remove` with.
    fn poll_done(&mut self) {
        let mut faulted = Vec::new();
        for (&id, slot) in self.engines.iter_mut() {
            if slot.engine.is_faulted() {
                faulted.push(id);
                continue;
            }
            if slot.finish_requested.load(Ordering::Relaxed) {
                self.finished = true;
            }
            if slot.engine.overrides_done_simulation() && slot.engine.done_simulation() {
                self.finished = true;
            }
            if slot.engine.overrides_done_step() {
                let _ = slot.engine.done_step();
            }
        }
        for id in faulted {
            warn!(eid = id, "engine faulted; tearing down at state-safe point");
            self.engines.remove(&id);
        }
    }

    /// Run steps until `finished()` or `max_steps` is reached, whichever
    /// comes first. Returns the number of steps actually executed.
    pub fn run_until_finished(&mut self, max_steps: u64) -> u64 {
        let mut steps = 0;
        while steps < max_steps && !self.finished {
            self.step();
            steps += 1;
            trace!(steps, "scheduler step completed");
        }
        debug!(steps, finished = self.finished, "run_until_finished exiting");
        steps
    }

    /// The open-loop optimisation (§4.4): when `eid` is clock-dominated, run
    /// it at full engine speed against a wall-clock budget rather than
    /// paying a full delta-cycle step per tick. Interrupts are still drained
    /// at the budget boundary.
    pub fn open_loop(
        &mut self,
        eid: EngineId,
        vid_clock: VarId,
        val_expected: bool,
        budget: Duration,
        cancel: &AtomicBool,
    ) -> u64 {
        let Some(slot) = self.engines.get_mut(&eid) else {
            return 0;
        };
        let deadline = Instant::now() + budget;
        let mut total = 0u64;
        loop {
            if cancel.load(Ordering::Relaxed) || Instant::now() >= deadline {
                break;
            }
            let remaining = u64::MAX;
            let executed = slot
                .engine
                .open_loop(vid_clock, val_expected, remaining.min(1024), cancel, slot.interface.as_mut());
            total += executed;
            if executed == 0 {
                break;
            }
        }
        self.interrupts.drain();
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::Bits;
    use crate::engine::software::{CombOp, Program, SoftwareEngine};
    use crate::engine::NullInterface;

    /// An engine that immediately reports a fault, standing in for a proxy
    /// whose sync socket failed a `TransportError`.
    struct FaultyEngine;

    impl Engine for FaultyEngine {
        fn get_state(&self) -> crate::engine::State {
            crate::engine::State::new()
        }
        fn set_state(&mut self, _state: crate::engine::State) {}
        fn get_input(&self) -> crate::engine::Input {
            crate::engine::Input::new()
        }
        fn set_input(&mut self, _input: crate::engine::Input) {}
        fn finalize(&mut self) {}
        fn read(&self, _vid: VarId) -> Bits {
            Bits::zero(1, false)
        }
        fn evaluate(&mut self, _iface: &mut dyn Interface) {}
        fn there_are_updates(&self) -> bool {
            false
        }
        fn update(&mut self, _iface: &mut dyn Interface) {}
        fn open_loop(
            &mut self,
            _vid_clock: VarId,
            _val_expected: bool,
            _bound: u64,
            _cancel: &AtomicBool,
            _iface: &mut dyn Interface,
        ) -> u64 {
            0
        }
        fn is_faulted(&self) -> bool {
            true
        }
    }

    #[test]
    fn faulted_engine_is_torn_down_at_the_next_step() {
        let mut scheduler = Scheduler::new(Arc::new(InterruptQueue::new()));
        scheduler.install(0, Box::new(FaultyEngine), Box::new(NullInterface));
        assert!(scheduler.engines.contains_key(&0));
        scheduler.step();
        assert!(!scheduler.engines.contains_key(&0));
    }

    fn counter_program() -> Program {
        Program {
            inputs: vec![],
            initial: vec![(0, Bits::from_u64(0, 1))],
            comb: vec![CombOp::Assign {
                out: 0,
                inp: 0,
                negate: true,
            }],
            clocked: vec![],
        }
    }

    #[test]
    fn step_is_deterministic_for_a_fixed_graph() {
        let mut s1 = Scheduler::new(Arc::new(InterruptQueue::new()));
        s1.install(0, Box::new(SoftwareEngine::new(counter_program())), Box::new(NullInterface));
        let mut s2 = Scheduler::new(Arc::new(InterruptQueue::new()));
        s2.install(0, Box::new(SoftwareEngine::new(counter_program())), Box::new(NullInterface));

        for _ in 0..5 {
            s1.step();
            s2.step();
        }
        assert_eq!(s1.engines[&0].engine.get_state(), s2.engines[&0].engine.get_state());
    }

    #[test]
    fn propagation_carries_src_read_to_dst_input() {
        let mut scheduler = Scheduler::new(Arc::new(InterruptQueue::new()));
        scheduler.install(
            0,
            Box::new(SoftwareEngine::new(Program {
                inputs: vec![],
                initial: vec![(10, Bits::from_u64(0x5, 4))],
                comb: vec![],
                clocked: vec![],
            })),
            Box::new(NullInterface),
        );
        scheduler.install(
            1,
            Box::new(SoftwareEngine::new(Program {
                inputs: vec![20],
                initial: vec![(20, Bits::zero(4, false)), (21, Bits::zero(4, false))],
                comb: vec![CombOp::Assign {
                    out: 21,
                    inp: 20,
                    negate: false,
                }],
                clocked: vec![],
            })),
            Box::new(NullInterface),
        );
        scheduler.graph_mut().add_edge(Edge {
            src_engine: 0,
            src_var: 10,
            dst_engine: 1,
            dst_var: 20,
        });

        scheduler.step();
        assert_eq!(scheduler.engines[&1].engine.read(21), Bits::from_u64(0x5, 4));
    }

    #[test]
    fn run_until_finished_respects_step_bound() {
        let mut scheduler = Scheduler::new(Arc::new(InterruptQueue::new()));
        scheduler.install(0, Box::new(SoftwareEngine::new(counter_program())), Box::new(NullInterface));
        let executed = scheduler.run_until_finished(10);
        assert_eq!(executed, 10);
        assert!(!scheduler.finished());
    }
}
