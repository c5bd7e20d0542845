//! The per-module execution handle abstraction (§4.3).
//!
//! An [`Engine`] is a handle to one module's execution. Every method is
//! either cycle-time (called while the scheduler drives a step, §4.4) or
//! state-safe (called only from within a drained [`crate::interrupt`]
//! closure, between steps). Cycle-time methods either succeed or leave the
//! engine observably unchanged; state-safe methods complete atomically.
//!
//! [`Interface`] is the callback surface an engine uses to report observable
//! effects back to the runtime. The channel is strictly one-directional: an
//! engine may call into its `Interface` from within `evaluate`/`update`, but
//! the runtime must never call back out into the engine from inside that
//! callback. Passing `&mut dyn Interface` as a borrowed argument to each
//! cycle-time method (rather than having the engine hold a stored reference)
//! makes that direction structurally impossible to violate.

pub mod software;

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::AtomicBool;

use crate::bits::Bits;

/// Identifies one named port or register within a module (flattened across dimensions).
pub type VarId = u32;

/// Identifies one engine, assigned by the dispatcher and stable across swaps.
pub type EngineId = u32;

/// A mapping from variable id to its ordered (possibly multi-dimensional)
/// value sequence. Used for both [`Engine::get_state`]/[`Engine::set_state`]
/// and [`Engine::get_input`]/[`Engine::set_input`]. All `Bits` sharing an id
/// share width and sign.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    entries: BTreeMap<VarId, Vec<Bits>>,
}

impl Snapshot {
    /// An empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the value sequence for `id`. All entries for the same id must share width/sign.
    pub fn insert(&mut self, id: VarId, values: Vec<Bits>) {
        debug_assert!(
            values
                .windows(2)
                .all(|w| w[0].width() == w[1].width() && w[0].is_signed() == w[1].is_signed()),
            "Snapshot entries for a single id must share width and sign"
        );
        self.entries.insert(id, values);
    }

    /// Look up the value sequence for `id`.
    pub fn get(&self, id: VarId) -> Option<&[Bits]> {
        self.entries.get(&id).map(Vec::as_slice)
    }

    /// Iterate over `(id, values)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (VarId, &[Bits])> {
        self.entries.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    /// Number of distinct ids recorded.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True iff no ids are recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize in the self-describing binary form: count, then `(id, arity, [Bits])` per entry.
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (id, values) in &self.entries {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&(values.len() as u32).to_le_bytes());
            for bits in values {
                out.extend_from_slice(&bits.to_binary());
            }
        }
        out
    }

    /// Render the self-describing text form: a count line, then per entry an
    /// `id arity width signed` header line followed by one indented `Bits`
    /// text line per value (§6, scenario 1: `"1\n  0 1 1 0\n    0b0\n"`).
    pub fn to_text(&self) -> String {
        let mut out = format!("{}\n", self.entries.len());
        for (id, values) in &self.entries {
            let width = values.first().map(|b| b.width()).unwrap_or(0);
            let signed = values.first().map(|b| b.is_signed()).unwrap_or(false);
            out.push_str(&format!("  {id} {} {width} {}\n", values.len(), signed as u8));
            for bits in values {
                out.push_str(&format!("    {}\n", bits.format(2)));
            }
        }
        out
    }

    /// Parse the form produced by [`Snapshot::to_text`].
    pub fn from_text(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let count: usize = lines.next()?.trim().parse().ok()?;
        let mut snapshot = Snapshot::new();
        for _ in 0..count {
            let header = lines.next()?;
            let mut fields = header.split_whitespace();
            let id: VarId = fields.next()?.parse().ok()?;
            let arity: usize = fields.next()?.parse().ok()?;
            let width: u32 = fields.next()?.parse().ok()?;
            let signed: u8 = fields.next()?.parse().ok()?;
            let mut values = Vec::with_capacity(arity);
            for _ in 0..arity {
                let line = lines.next()?.trim();
                values.push(Bits::parse_tagged(line, width, signed != 0).ok()?);
            }
            snapshot.insert(id, values);
        }
        Some(snapshot)
    }

    /// Decode the form produced by [`Snapshot::to_binary`].
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        let mut pos = 0usize;
        let count = u32::from_le_bytes(data.get(pos..pos + 4)?.try_into().ok()?);
        pos += 4;
        let mut snapshot = Snapshot::new();
        for _ in 0..count {
            let id = u32::from_le_bytes(data.get(pos..pos + 4)?.try_into().ok()?);
            pos += 4;
            let arity = u32::from_le_bytes(data.get(pos..pos + 4)?.try_into().ok()?);
            pos += 4;
            let mut values = Vec::with_capacity(arity as usize);
            for _ in 0..arity {
                let (bits, consumed) = Bits::from_binary(&data[pos..])?;
                pos += consumed;
                values.push(bits);
            }
            snapshot.insert(id, values);
        }
        Some(snapshot)
    }
}

/// State-safe snapshot of an engine's full internal state: fed to a second
/// engine for the same module, it must yield observationally identical
/// future behavior (the swap invariant, §4.5).
pub type State = Snapshot;

/// State-safe snapshot of an engine's input ports' latched values.
pub type Input = Snapshot;

/// A seek origin for the virtual filesystem facade, mirroring `std::io::SeekFrom`.
pub type SeekFrom = io::SeekFrom;

/// The callback surface an engine uses to report observable effects: port
/// writes, `$display`, `$finish`, `$save`, `$restart`, and file I/O. Calls
/// flow strictly engine -> runtime.
pub trait Interface {
    /// The engine assigned `value` to the named output port.
    fn write_bits(&mut self, vid: VarId, value: Bits);
    /// The engine assigned a single-bit `value` to the named output port.
    fn write_bool(&mut self, vid: VarId, value: bool);
    /// The engine emitted a `$display`/`$strobe`-style diagnostic at `level`.
    fn debug(&mut self, level: u32, text: &str);
    /// The engine invoked `$finish(arg)`.
    fn finish(&mut self, arg: i32);
    /// The engine invoked `$restart(path)`.
    fn restart(&mut self, path: &str);
    /// The engine requested recompilation against a different march/backend.
    fn retarget(&mut self, march: &str);
    /// The engine invoked `$save(path)`.
    fn save(&mut self, path: &str);

    /// Open a file, returning an opaque handle.
    fn fopen(&mut self, path: &str, mode: &str) -> Option<u32>;
    /// Bytes known to be available for a non-blocking read on `handle`.
    fn in_avail(&mut self, handle: u32) -> i64;
    /// Seek `handle` by a relative offset; returns the new absolute position.
    fn pubseekoff(&mut self, handle: u32, off: i64, dir: SeekFrom) -> i64;
    /// Seek `handle` to an absolute position.
    fn pubseekpos(&mut self, handle: u32, pos: u64) -> i64;
    /// Flush any buffered state for `handle`.
    fn pubsync(&mut self, handle: u32) -> i32;
    /// Read and consume one byte from `handle`.
    fn sbumpc(&mut self, handle: u32) -> Option<u8>;
    /// Peek one byte from `handle` without consuming it.
    fn sgetc(&mut self, handle: u32) -> Option<u8>;
    /// Bulk-read up to `n` bytes from `handle`.
    fn sgetn(&mut self, handle: u32, n: usize) -> Vec<u8>;
    /// Write one byte to `handle`.
    fn sputc(&mut self, handle: u32, c: u8) -> bool;
    /// Bulk-write `data` to `handle`, returning the number of bytes accepted.
    fn sputn(&mut self, handle: u32, data: &[u8]) -> usize;
}

/// A per-module execution handle. See the module-level documentation for the
/// cycle-time/state-safe split and the `Interface` calling convention.
pub trait Engine: Send {
    /// State-safe. Must produce a value that, fed to a second engine for the
    /// same module via `set_state`, yields observationally identical future
    /// behavior.
    fn get_state(&self) -> State;
    /// State-safe.
    fn set_state(&mut self, state: State);
    /// State-safe. Captures the input ports' latched values.
    fn get_input(&self) -> Input;
    /// State-safe.
    fn set_input(&mut self, input: Input);
    /// State-safe. Commits end-of-cycle pending assignments.
    fn finalize(&mut self);

    /// Cycle-time. Returns a port value.
    fn read(&self, vid: VarId) -> Bits;
    /// Cycle-time. Propagates combinational logic; may invoke `Interface` callbacks.
    fn evaluate(&mut self, iface: &mut dyn Interface);
    /// Cycle-time. True iff non-blocking assignments are pending.
    fn there_are_updates(&self) -> bool;
    /// Cycle-time. Applies pending non-blocking assignments.
    fn update(&mut self, iface: &mut dyn Interface);
    /// Cycle-time. If `there_are_updates`, applies them and returns true.
    fn conditional_update(&mut self, iface: &mut dyn Interface) -> bool {
        if self.there_are_updates() {
            self.update(iface);
            true
        } else {
            false
        }
    }

    /// Cycle-time fast path. Toggles `vid_clock` at full engine speed until
    /// either it reads `val_expected`, `bound` cycles pass, or `cancel` is
    /// set. Returns the number of cycles executed.
    fn open_loop(
        &mut self,
        vid_clock: VarId,
        val_expected: bool,
        bound: u64,
        cancel: &AtomicBool,
        iface: &mut dyn Interface,
    ) -> u64;

    /// Whether this engine overrides the default end-of-step signal.
    fn overrides_done_step(&self) -> bool {
        false
    }
    /// True iff the engine wants to signal end-of-step.
    fn done_step(&mut self) -> bool {
        false
    }
    /// Whether this engine overrides the default end-of-simulation signal.
    fn overrides_done_simulation(&self) -> bool {
        false
    }
    /// True iff the engine wants to signal end-of-simulation (observed `$finish` etc.).
    fn done_simulation(&mut self) -> bool {
        false
    }

    /// True once this engine has hit an unrecoverable fault (e.g. a proxy's
    /// sync socket failing a `TransportError`) and must be torn down by the
    /// scheduler at the next state-safe point rather than stepped further.
    fn is_faulted(&self) -> bool {
        false
    }
}

/// A no-op `Interface` useful for tests that don't care about observable effects.
#[derive(Debug, Default)]
pub struct NullInterface;

impl Interface for NullInterface {
    fn write_bits(&mut self, _vid: VarId, _value: Bits) {}
    fn write_bool(&mut self, _vid: VarId, _value: bool) {}
    fn debug(&mut self, _level: u32, _text: &str) {}
    fn finish(&mut self, _arg: i32) {}
    fn restart(&mut self, _path: &str) {}
    fn retarget(&mut self, _march: &str) {}
    fn save(&mut self, _path: &str) {}
    fn fopen(&mut self, _path: &str, _mode: &str) -> Option<u32> {
        None
    }
    fn in_avail(&mut self, _handle: u32) -> i64 {
        -1
    }
    fn pubseekoff(&mut self, _handle: u32, _off: i64, _dir: SeekFrom) -> i64 {
        -1
    }
    fn pubseekpos(&mut self, _handle: u32, _pos: u64) -> i64 {
        -1
    }
    fn pubsync(&mut self, _handle: u32) -> i32 {
        0
    }
    fn sbumpc(&mut self, _handle: u32) -> Option<u8> {
        None
    }
    fn sgetc(&mut self, _handle: u32) -> Option<u8> {
        None
    }
    fn sgetn(&mut self, _handle: u32, _n: usize) -> Vec<u8> {
        Vec::new()
    }
    fn sputc(&mut self, _handle: u32, _c: u8) -> bool {
        false
    }
    fn sputn(&mut self, _handle: u32, _data: &[u8]) -> usize {
        0
    }
}
