//! The length-framed typed RPC message used to drive a remote engine or
//! compiler over a socket (§6 of the runtime spec).
//!
//! Every frame is `type:u8 | pid:u32 | eid:u32 | n:u32`, little-endian,
//! optionally followed by a payload whose shape is determined by `type`.

use std::io::{self, Read, Write};

use strum::FromRepr;

use crate::bits::Bits;

/// The closed set of RPC message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
#[repr(u8)]
pub enum RpcType {
    /// Generic success reply.
    Okay = 0,
    /// Generic failure reply, optionally carrying a message payload.
    Fail,

    /// Compile a module's source text.
    Compile,
    /// Cancel a pending compile.
    StopCompile,

    /// `Engine::get_state`.
    GetState,
    /// `Engine::set_state`.
    SetState,
    /// `Engine::get_input`.
    GetInput,
    /// `Engine::set_input`.
    SetInput,
    /// `Engine::finalize`.
    Finalize,

    /// `Engine::overrides_done_step`.
    OverridesDoneStep,
    /// `Engine::done_step`.
    DoneStep,
    /// `Engine::overrides_done_simulation`.
    OverridesDoneSimulation,
    /// `Engine::done_simulation`.
    DoneSimulation,

    /// `Engine::read`.
    Read,
    /// `Engine::evaluate`.
    Evaluate,
    /// `Engine::there_are_updates`.
    ThereAreUpdates,
    /// `Engine::update`.
    Update,
    /// Whether any `$display`/task fired during the last evaluate.
    ThereWereTasks,

    /// `Engine::conditional_update`.
    ConditionalUpdate,
    /// `Engine::open_loop`.
    OpenLoop,

    /// `Interface::write_bits`.
    WriteBits,
    /// `Interface::write_bool`.
    WriteBool,

    /// `Interface::debug`.
    Debug,
    /// `Interface::finish`.
    Finish,
    /// `Interface::restart`.
    Restart,
    /// `Interface::retarget`.
    Retarget,
    /// `Interface::save`.
    Save,

    /// Virtual filesystem facade: open.
    Fopen,
    /// Virtual filesystem facade: bytes available.
    InAvail,
    /// Virtual filesystem facade: seek by offset.
    PubSeekOff,
    /// Virtual filesystem facade: seek to position.
    PubSeekPos,
    /// Virtual filesystem facade: sync.
    PubSync,
    /// Virtual filesystem facade: read one byte and advance.
    SBumpc,
    /// Virtual filesystem facade: peek one byte.
    SGetc,
    /// Virtual filesystem facade: bulk read.
    SGetn,
    /// Virtual filesystem facade: write one byte.
    SPutc,
    /// Virtual filesystem facade: bulk write.
    SPutn,

    /// Proxy compiler: step 1 of the two-step connect handshake.
    OpenConn1,
    /// Proxy compiler: step 2 of the two-step connect handshake.
    OpenConn2,
    /// Proxy compiler: teardown of a client connection.
    CloseConn,
    /// Proxy compiler: remote requests a quiescent snapshot window.
    StateSafeBegin,
    /// Proxy compiler: client acknowledges the quiescent window has begun.
    StateSafeOkay,
    /// Proxy compiler: client signals the quiescent window is over.
    StateSafeFinish,

    /// Proxy core: tear down a remote engine.
    TeardownEngine,
}

/// The fixed-size frame header common to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rpc {
    /// The message type.
    pub ty: RpcType,
    /// The client handle assigned during the connect handshake (0 if not yet assigned).
    pub pid: u32,
    /// The engine id this message concerns (0 if not applicable).
    pub eid: u32,
    /// A generic length/count field, interpretation depends on `ty`.
    pub n: u32,
}

impl Rpc {
    /// Construct a header-only frame (`pid`/`eid`/`n` all zero).
    pub fn new(ty: RpcType) -> Self {
        Self {
            ty,
            pid: 0,
            eid: 0,
            n: 0,
        }
    }

    /// Construct a fully specified frame.
    pub fn with_fields(ty: RpcType, pid: u32, eid: u32, n: u32) -> Self {
        Self { ty, pid, eid, n }
    }

    /// Serialize the header to `w`. Returns the number of bytes written.
    pub fn serialize(&self, w: &mut impl Write) -> io::Result<usize> {
        w.write_all(&[self.ty as u8])?;
        w.write_all(&self.pid.to_le_bytes())?;
        w.write_all(&self.eid.to_le_bytes())?;
        w.write_all(&self.n.to_le_bytes())?;
        Ok(13)
    }

    /// Deserialize a header from `r`.
    pub fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        let mut ty_byte = [0u8; 1];
        r.read_exact(&mut ty_byte)?;
        let ty = RpcType::from_repr(ty_byte[0])
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown RPC type tag"))?;
        let mut pid = [0u8; 4];
        r.read_exact(&mut pid)?;
        let mut eid = [0u8; 4];
        r.read_exact(&mut eid)?;
        let mut n = [0u8; 4];
        r.read_exact(&mut n)?;
        Ok(Self {
            ty,
            pid: u32::from_le_bytes(pid),
            eid: u32::from_le_bytes(eid),
            n: u32::from_le_bytes(n),
        })
    }
}

/// Write a `FAIL` frame with a null-terminated message payload.
pub fn write_fail(w: &mut impl Write, pid: u32, eid: u32, message: &str) -> io::Result<()> {
    Rpc::with_fields(RpcType::Fail, pid, eid, message.len() as u32 + 1).serialize(w)?;
    w.write_all(message.as_bytes())?;
    w.write_all(&[0u8])
}

/// Read a null-terminated `FAIL` message payload of `len` bytes (including the terminator).
pub fn read_fail_message(r: &mut impl Read, len: u32) -> io::Result<String> {
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    if buf.last() == Some(&0) {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a `Bits` payload: reuses [`Bits::to_binary`]'s self-describing form.
pub fn write_bits(w: &mut impl Write, bits: &Bits) -> io::Result<()> {
    w.write_all(&bits.to_binary())
}

/// Read a `Bits` payload written by [`write_bits`].
pub fn read_bits(r: &mut impl Read) -> io::Result<Bits> {
    let mut width = [0u8; 4];
    r.read_exact(&mut width)?;
    let width = u32::from_le_bytes(width);
    let mut flags = [0u8; 1];
    r.read_exact(&mut flags)?;
    let byte_len = (width as usize).div_ceil(8);
    let mut rest = vec![0u8; byte_len];
    r.read_exact(&mut rest)?;
    let mut full = Vec::with_capacity(5 + byte_len);
    full.extend_from_slice(&width.to_le_bytes());
    full.push(flags[0]);
    full.extend_from_slice(&rest);
    Bits::from_binary(&full)
        .map(|(b, _)| b)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed Bits payload"))
}
