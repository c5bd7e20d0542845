//! The software engine: an interpreting simulator that executes a module
//! purely by walking a small internal IR of combinational and clocked
//! assignments. It is always available and acts as the fast fallback the
//! [`crate::dispatch`] dispatcher installs before a slower backend compiles.
//!
//! The lexer/parser/elaborator that would normally produce this IR from
//! Verilog source is an external collaborator and out of scope here (§1); a
//! [`Program`] is the shape elaboration is expected to hand the software
//! engine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bits::Bits;
use crate::engine::{Engine, Input, Interface, State, VarId};
use crate::error::Warnings;

/// One combinational assignment, run in declaration order every `evaluate`.
#[derive(Debug, Clone)]
pub enum CombOp {
    /// `out = inp` (or `out = ~inp` when `negate`).
    Assign {
        /// Destination variable.
        out: VarId,
        /// Source variable.
        inp: VarId,
        /// Whether the source is bitwise-negated before assignment.
        negate: bool,
    },
    /// `$finish(arg)`, reported to the engine's `Interface` every `evaluate`.
    Finish(i32),
}

/// One non-blocking (clocked) assignment: on a rising edge of `clock`, `inp`'s
/// current value is queued for `out` and applied on the next `update`.
#[derive(Debug, Clone)]
pub struct ClockedAssign {
    /// Destination register.
    pub out: VarId,
    /// Source variable, sampled at the clock edge.
    pub inp: VarId,
    /// The clock signal driving this assignment.
    pub clock: VarId,
}

/// The minimal module description the software engine interprets.
#[derive(Debug, Clone, Default)]
pub struct Program {
    /// Variable ids treated as input ports (captured by `get_input`/`set_input`).
    pub inputs: Vec<VarId>,
    /// Initial values for every variable the module declares, by id.
    pub initial: Vec<(VarId, Bits)>,
    /// Combinational logic, evaluated in order every cycle.
    pub comb: Vec<CombOp>,
    /// Clocked (non-blocking) assignments.
    pub clocked: Vec<ClockedAssign>,
}

/// The reference interpreting simulator.
pub struct SoftwareEngine {
    program: Program,
    vars: HashMap<VarId, Bits>,
    last_clock: HashMap<VarId, bool>,
    pending: VecDeque<(VarId, Bits)>,
    warnings: Warnings,
}

fn is_truthy(bits: &Bits) -> bool {
    !bits.is_zero()
}

impl SoftwareEngine {
    /// Build an engine from a `Program`, seeding every declared variable at its initial value.
    pub fn new(program: Program) -> Self {
        let mut vars = HashMap::new();
        for (id, value) in &program.initial {
            vars.insert(*id, value.clone());
        }
        let last_clock = program
            .clocked
            .iter()
            .map(|c| (c.clock, vars.get(&c.clock).map(is_truthy).unwrap_or(false)))
            .collect();
        Self {
            program,
            vars,
            last_clock,
            pending: VecDeque::new(),
            warnings: Warnings::new(),
        }
    }

    /// Non-fatal diagnostics buffered by this engine.
    pub fn warnings(&self) -> &Warnings {
        &self.warnings
    }
}

impl Engine for SoftwareEngine {
    fn get_state(&self) -> State {
        let mut state = State::new();
        let mut ids: Vec<_> = self.vars.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            state.insert(id, vec![self.vars[&id].clone()]);
        }
        state
    }

    fn set_state(&mut self, state: State) {
        for (id, values) in state.iter() {
            if let Some(first) = values.first() {
                self.vars.insert(id, first.clone());
            }
        }
    }

    fn get_input(&self) -> Input {
        let mut input = Input::new();
        for id in &self.program.inputs {
            if let Some(value) = self.vars.get(id) {
                input.insert(*id, vec![value.clone()]);
            }
        }
        input
    }

    fn set_input(&mut self, input: Input) {
        for (id, values) in input.iter() {
            if let Some(first) = values.first() {
                self.vars.insert(id, first.clone());
            }
        }
    }

    fn finalize(&mut self) {
        // The software engine applies non-blocking assignments synchronously in
        // `update`; there is no separate end-of-cycle commit to perform.
    }

    fn read(&self, vid: VarId) -> Bits {
        self.vars
            .get(&vid)
            .cloned()
            .unwrap_or_else(|| Bits::zero(1, false))
    }

    fn evaluate(&mut self, iface: &mut dyn Interface) {
        for op in self.program.comb.clone() {
            match op {
                CombOp::Assign { out, inp, negate } => {
                    let Some(src) = self.vars.get(&inp).cloned() else {
                        self.warnings.push(format!("evaluate: unknown variable {inp}"));
                        continue;
                    };
                    let new_value = if negate { src.not() } else { src };
                    let changed = self.vars.get(&out) != Some(&new_value);
                    self.vars.insert(out, new_value.clone());
                    if changed {
                        iface.write_bits(out, new_value);
                    }
                }
                CombOp::Finish(arg) => iface.finish(arg),
            }
        }

        for clocked in self.program.clocked.clone() {
            let Some(clock_val) = self.vars.get(&clocked.clock).cloned() else {
                continue;
            };
            let rising = is_truthy(&clock_val) && !*self.last_clock.get(&clocked.clock).unwrap_or(&false);
            self.last_clock.insert(clocked.clock, is_truthy(&clock_val));
            if rising {
                if let Some(src) = self.vars.get(&clocked.inp).cloned() {
                    self.pending.push_back((clocked.out, src));
                }
            }
        }
    }

    fn there_are_updates(&self) -> bool {
        !self.pending.is_empty()
    }

    fn update(&mut self, iface: &mut dyn Interface) {
        while let Some((out, value)) = self.pending.pop_front() {
            self.vars.insert(out, value.clone());
            iface.write_bits(out, value);
        }
    }

    fn open_loop(
        &mut self,
        vid_clock: VarId,
        val_expected: bool,
        bound: u64,
        cancel: &AtomicBool,
        iface: &mut dyn Interface,
    ) -> u64 {
        let mut cycles = 0u64;
        while cycles < bound {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let current = self.vars.get(&vid_clock).cloned().unwrap_or_else(|| Bits::zero(1, false));
            if is_truthy(&current) == val_expected {
                break;
            }
            let toggled = current.not();
            self.vars.insert(vid_clock, toggled);
            self.evaluate(iface);
            self.update(iface);
            cycles += 1;
        }
        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NullInterface;

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
    fn one_bit_counter_toggles_each_step() {
        let mut engine = SoftwareEngine::new(counter_program());
        let mut iface = NullInterface;
        for expected in [1u64, 0, 1, 0] {
            engine.evaluate(&mut iface);
            assert_eq!(engine.read(0), Bits::from_u64(expected, 1));
        }
    }

    #[test]
    fn pipeline_passthrough_propagates_value() {
        let a_out = 10;
        let b_in = 20;
        let b_out = 21;
        let a = SoftwareEngine::new(Program {
            inputs: vec![],
            initial: vec![(a_out, Bits::from_u64(0x37, 8))],
            comb: vec![],
            clocked: vec![],
        });
        let mut b = SoftwareEngine::new(Program {
            inputs: vec![b_in],
            initial: vec![(b_in, Bits::zero(8, false)), (b_out, Bits::zero(8, false))],
            comb: vec![CombOp::Assign {
                out: b_out,
                inp: b_in,
                negate: false,
            }],
            clocked: vec![],
        });
        let mut iface = NullInterface;

        for _ in 0..2 {
            let v = a.read(a_out);
            b.set_input({
                let mut i = Input::new();
                i.insert(b_in, vec![v]);
                i
            });
            b.evaluate(&mut iface);
        }
        assert_eq!(b.read(b_out), Bits::from_u64(0x37, 8));
    }

    #[test]
    fn open_loop_stops_at_bound_when_target_unreachable() {
        let mut engine = SoftwareEngine::new(Program {
            inputs: vec![],
            initial: vec![(0, Bits::from_u64(0, 1))],
            comb: vec![],
            clocked: vec![],
        });
        let cancel = AtomicBool::new(false);
        let mut iface = NullInterface;
        let executed = engine.open_loop(0, true, 3, &cancel, &mut iface);
        assert_eq!(executed, 1);
    }

    #[test]
    fn open_loop_honours_cancellation() {
        let mut engine = SoftwareEngine::new(Program {
            inputs: vec![],
            initial: vec![(0, Bits::from_u64(0, 1))],
            comb: vec![],
            clocked: vec![],
        });
        let cancel = AtomicBool::new(true);
        let mut iface = NullInterface;
        let executed = engine.open_loop(0, true, 1000, &cancel, &mut iface);
        assert_eq!(executed, 0);
    }

    #[test]
    fn state_round_trips_across_engines() {
        let mut e1 = SoftwareEngine::new(counter_program());
        let mut iface = NullInterface;
        e1.evaluate(&mut iface);
        e1.evaluate(&mut iface);
        let state = e1.get_state();

        let mut e2 = SoftwareEngine::new(counter_program());
        e2.set_state(state);
        assert_eq!(e2.read(0), e1.read(0));
        e1.evaluate(&mut iface);
        e2.evaluate(&mut iface);
        assert_eq!(e1.read(0), e2.read(0));
    }
}
