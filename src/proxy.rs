//! A proxy engine and proxy compiler make a remote module look local (§4.6).
//!
//! Every [`Engine`] method on a [`ProxyEngine`] round-trips over a dedicated
//! synchronous socket: serialize a method tag plus arguments, flush, block
//! for the reply. A second asynchronous socket carries unsolicited messages
//! from the remote — in particular the state-safe handshake a remote peer
//! uses to take a quiescent snapshot across the link.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use crate::bits::Bits;
use crate::engine::{Engine, EngineId, Input, Interface, SeekFrom, State, VarId};
use crate::error::{ProtocolError, TransportError, Warnings};
use crate::interrupt::InterruptQueue;
use crate::rpc::{self, Rpc, RpcType};
use crate::stream::CacheStream;

const ASYNC_POLL_TIMEOUT: Duration = Duration::from_secs(1);

fn expect(rpc: &Rpc, expected: RpcType) -> Result<(), ProtocolError> {
    if rpc.ty == expected {
        Ok(())
    } else {
        Err(ProtocolError {
            expected,
            actual: rpc.ty,
        })
    }
}

/// A record in the proxy compiler's connection table: one remote peer, keyed
/// by location string.
struct ConnInfo {
    pid: u32,
    sync_sock: Mutex<CacheStream<TcpStream>>,
    listener: Option<JoinHandle<()>>,
}

/// Proxies an entire remote compiler: `dispatch_compile`'s `Backend`
/// counterpart, one layer above a single engine.
pub struct ProxyCompiler {
    conns: Mutex<HashMap<String, ConnInfo>>,
    running: Arc<AtomicBool>,
    interrupts: Arc<InterruptQueue>,
}

impl ProxyCompiler {
    /// A proxy compiler sharing `interrupts` with the local scheduler (the
    /// state-safe handshake enqueues work there).
    pub fn new(interrupts: Arc<InterruptQueue>) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(true)),
            interrupts,
        }
    }

    /// Open a connection to `loc` (`host:port`), running the two-step
    /// connect handshake. A no-op if already connected.
    pub fn open(&self, loc: &str) -> io::Result<()> {
        if self.conns.lock().expect("connection table mutex poisoned").contains_key(loc) {
            return Ok(());
        }

        let async_raw = TcpStream::connect(loc)?;
        async_raw.set_read_timeout(Some(ASYNC_POLL_TIMEOUT))?;
        let mut async_sock = CacheStream::new(async_raw.try_clone()?);
        Rpc::new(RpcType::OpenConn1).serialize(&mut async_sock)?;
        async_sock.flush()?;
        let reply = Rpc::deserialize(&mut async_sock)?;
        expect(&reply, RpcType::Okay).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let pid = reply.pid;

        let sync_raw = TcpStream::connect(loc)?;
        let mut sync_sock = CacheStream::new(sync_raw);
        Rpc::with_fields(RpcType::OpenConn2, pid, 0, 0).serialize(&mut sync_sock)?;
        sync_sock.flush()?;
        let reply = Rpc::deserialize(&mut sync_sock)?;
        expect(&reply, RpcType::Okay).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let running = Arc::clone(&self.running);
        let interrupts = Arc::clone(&self.interrupts);
        let listener = thread::spawn(move || async_listener_loop(async_raw, running, interrupts));

        self.conns.lock().expect("connection table mutex poisoned").insert(
            loc.to_string(),
            ConnInfo {
                pid,
                sync_sock: Mutex::new(sync_sock),
                listener: Some(listener),
            },
        );
        Ok(())
    }

    /// Cancel the outstanding compile for `eid` on every connected remote.
    pub fn stop_compile(&self, eid: EngineId) -> io::Result<()> {
        let conns = self.conns.lock().expect("connection table mutex poisoned");
        for conn in conns.values() {
            let mut sock = conn.sync_sock.lock().expect("sync socket mutex poisoned");
            Rpc::with_fields(RpcType::StopCompile, conn.pid, eid, 0).serialize(&mut *sock)?;
            sock.flush()?;
            let reply = Rpc::deserialize(&mut *sock)?;
            expect(&reply, RpcType::Okay).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
        Ok(())
    }

    /// Signal the async listener threads to stop at their next poll and join them.
    pub fn stop_async(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        let mut conns = self.conns.lock().expect("connection table mutex poisoned");
        for conn in conns.values_mut() {
            if let Some(handle) = conn.listener.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ProxyCompiler {
    fn drop(&mut self) {
        let mut conns = self.conns.lock().expect("connection table mutex poisoned");
        for (_, conn) in conns.drain() {
            let mut sock = conn.sync_sock.lock().expect("sync socket mutex poisoned");
            // Notify and move on: blocking for a reply here risks a race with
            // the remote side tearing down its own half of the connection.
            let _ = Rpc::with_fields(RpcType::CloseConn, conn.pid, 0, 0).serialize(&mut *sock);
            let _ = sock.flush();
        }
    }
}

fn async_listener_loop(mut sock: TcpStream, running: Arc<AtomicBool>, interrupts: Arc<InterruptQueue>) {
    while running.load(Ordering::Relaxed) {
        let rpc = match Rpc::deserialize(&mut sock) {
            Ok(rpc) => rpc,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => continue,
            Err(_) => return,
        };
        if rpc.ty != RpcType::StateSafeBegin {
            return;
        }
        let mut reply_sock = match sock.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };
        interrupts.schedule(move || {
            if Rpc::new(RpcType::StateSafeOkay).serialize(&mut reply_sock).is_err() {
                return;
            }
            let _ = reply_sock.flush();
            if let Ok(done) = Rpc::deserialize(&mut reply_sock) {
                debug_assert_eq!(done.ty, RpcType::StateSafeFinish);
            }
        });
    }
}

/// An `Engine` whose every method is a synchronous RPC round trip to a
/// remote peer already connected via [`ProxyCompiler::open`].
pub struct ProxyEngine {
    eid: EngineId,
    pid: u32,
    sync_sock: Mutex<CacheStream<TcpStream>>,
    warnings: Warnings,
    fault: Arc<AtomicBool>,
}

impl ProxyEngine {
    /// Bind a proxy engine to `eid` on an already-connected remote, sharing its sync socket.
    pub fn new(eid: EngineId, pid: u32, sync_sock: TcpStream) -> Self {
        Self {
            eid,
            pid,
            sync_sock: Mutex::new(CacheStream::new(sync_sock)),
            warnings: Warnings::new(),
            fault: Arc::new(AtomicBool::new(false)),
        }
    }

    fn roundtrip(&self, req: RpcType, n: u32) -> Result<Rpc, TransportError> {
        let mut sock = self.sync_sock.lock().expect("sync socket mutex poisoned");
        Rpc::with_fields(req, self.pid, self.eid, n).serialize(&mut *sock)?;
        sock.flush()?;
        Ok(Rpc::deserialize(&mut *sock)?)
    }

    fn get_snapshot(&self, ty: RpcType) -> Result<State, TransportError> {
        let mut sock = self.sync_sock.lock().expect("sync socket mutex poisoned");
        Rpc::with_fields(ty, self.pid, self.eid, 0).serialize(&mut *sock)?;
        sock.flush()?;
        let reply = Rpc::deserialize(&mut *sock)?;
        let mut payload = vec![0u8; reply.n as usize];
        sock.read_exact(&mut payload)?;
        State::from_binary(&payload)
            .ok_or_else(|| TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, "malformed snapshot payload")))
    }

    fn set_snapshot(&self, ty: RpcType, snapshot: &State) -> Result<(), TransportError> {
        let payload = snapshot.to_binary();
        let mut sock = self.sync_sock.lock().expect("sync socket mutex poisoned");
        Rpc::with_fields(ty, self.pid, self.eid, payload.len() as u32).serialize(&mut *sock)?;
        sock.write_all(&payload)?;
        sock.flush()?;
        Ok(())
    }

    /// Record `context: error` and mark this engine faulted — surfaced to the
    /// scheduler via [`Engine::is_faulted`] so it tears the engine down at
    /// the next state-safe point instead of stepping a link that can no
    /// longer be trusted.
    fn fail(&self, context: &str, e: impl std::fmt::Display) {
        self.warnings.push(format!("{context}: {e}"));
        self.fault.store(true, Ordering::Relaxed);
    }

    /// Non-fatal diagnostics accumulated while operating this proxy.
    pub fn warnings(&self) -> &Warnings {
        &self.warnings
    }
}

impl Engine for ProxyEngine {
    fn get_state(&self) -> State {
        self.get_snapshot(RpcType::GetState).unwrap_or_else(|e| {
            self.fail("get_state", e);
            State::new()
        })
    }

    fn set_state(&mut self, state: State) {
        if let Err(e) = self.set_snapshot(RpcType::SetState, &state) {
            self.fail("set_state", e);
        }
    }

    fn get_input(&self) -> Input {
        self.get_snapshot(RpcType::GetInput).unwrap_or_else(|e| {
            self.fail("get_input", e);
            Input::new()
        })
    }

    fn set_input(&mut self, input: Input) {
        if let Err(e) = self.set_snapshot(RpcType::SetInput, &input) {
            self.fail("set_input", e);
        }
    }

    fn finalize(&mut self) {
        if let Err(e) = self.roundtrip(RpcType::Finalize, 0) {
            self.fail("finalize", e);
        }
    }

    fn read(&self, vid: VarId) -> Bits {
        self.roundtrip_bits_for(RpcType::Read, vid).unwrap_or_else(|e| {
            self.fail("read", e);
            Bits::zero(1, false)
        })
    }

    fn evaluate(&mut self, _iface: &mut dyn Interface) {
        if let Err(e) = self.roundtrip(RpcType::Evaluate, 0) {
            self.fail("evaluate", e);
        }
    }

    fn there_are_updates(&self) -> bool {
        match self.roundtrip(RpcType::ThereAreUpdates, 0) {
            Ok(r) => r.n != 0,
            Err(e) => {
                self.fail("there_are_updates", e);
                false
            }
        }
    }

    fn update(&mut self, _iface: &mut dyn Interface) {
        if let Err(e) = self.roundtrip(RpcType::Update, 0) {
            self.fail("update", e);
        }
    }

    fn open_loop(
        &mut self,
        _vid_clock: VarId,
        _val_expected: bool,
        bound: u64,
        cancel: &AtomicBool,
        _iface: &mut dyn Interface,
    ) -> u64 {
        if cancel.load(Ordering::Relaxed) {
            return 0;
        }
        match self.roundtrip(RpcType::OpenLoop, bound as u32) {
            Ok(r) => r.n as u64,
            Err(e) => {
                self.fail("open_loop", e);
                0
            }
        }
    }

    fn is_faulted(&self) -> bool {
        self.fault.load(Ordering::Relaxed)
    }
}

impl ProxyEngine {
    fn roundtrip_bits_for(&self, req: RpcType, vid: VarId) -> Result<Bits, TransportError> {
        let mut sock = self.sync_sock.lock().expect("sync socket mutex poisoned");
        Rpc::with_fields(req, self.pid, self.eid, vid).serialize(&mut *sock)?;
        sock.flush()?;
        Ok(rpc::read_bits(&mut *sock)?)
    }
}

impl Drop for ProxyEngine {
    fn drop(&mut self) {
        let mut sock = self.sync_sock.lock().expect("sync socket mutex poisoned");
        // Best-effort notify, same discipline as `ProxyCompiler::drop`'s
        // `CLOSE_CONN`: blocking for a reply here risks a race with the
        // remote side tearing down its own half of the connection.
        let _ = Rpc::with_fields(RpcType::TeardownEngine, self.pid, self.eid, 0).serialize(&mut *sock);
        let _ = sock.flush();
    }
}

/// Translate an 8-byte little-endian payload back into an `i64`/`u64`-shaped
/// reply value too wide for the header's `n: u32` field.
fn read_wide(payload: &[u8]) -> io::Result<i64> {
    let bytes: [u8; 8] = payload
        .get(..8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "expected an 8-byte wide payload"))?;
    Ok(i64::from_le_bytes(bytes))
}

fn wide_reply(pid: u32, eid: u32, value: i64) -> (Rpc, Vec<u8>) {
    (
        Rpc::with_fields(RpcType::Okay, pid, eid, 8),
        value.to_le_bytes().to_vec(),
    )
}

fn split_nul_pair(payload: &[u8]) -> io::Result<(&str, &str)> {
    let mid = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "expected a NUL-separated pair"))?;
    let first = std::str::from_utf8(&payload[..mid]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let second = std::str::from_utf8(&payload[mid + 1..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok((first, second))
}

fn str_payload(payload: &[u8]) -> io::Result<&str> {
    std::str::from_utf8(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// The wire-side facade an `Interface` implementation translates remote
/// `Interface`/proxy-core RPCs into local calls on behalf of a remote peer.
/// Kept as a free function set (rather than a type) since it operates on
/// whatever local `Interface` the runtime already owns for `eid`. Returns the
/// reply header plus any variable-length payload the caller must write after it.
pub fn dispatch_interface_rpc(iface: &mut dyn Interface, rpc: &Rpc, payload: &[u8]) -> io::Result<(Rpc, Vec<u8>)> {
    let okay = || (Rpc::new(RpcType::Okay), Vec::new());
    let fail = || (Rpc::new(RpcType::Fail), Vec::new());
    match rpc.ty {
        RpcType::WriteBits => {
            let bits = rpc::read_bits(&mut &payload[..])?;
            iface.write_bits(rpc.eid, bits);
            Ok(okay())
        }
        RpcType::WriteBool => {
            iface.write_bool(rpc.eid, rpc.n != 0);
            Ok(okay())
        }
        RpcType::Debug => {
            iface.debug(rpc.n, str_payload(payload)?);
            Ok(okay())
        }
        RpcType::Finish => {
            iface.finish(rpc.n as i32);
            Ok(okay())
        }
        RpcType::Restart => {
            iface.restart(str_payload(payload)?);
            Ok(okay())
        }
        RpcType::Retarget => {
            iface.retarget(str_payload(payload)?);
            Ok(okay())
        }
        RpcType::Save => {
            iface.save(str_payload(payload)?);
            Ok(okay())
        }
        RpcType::Fopen => {
            let (path, mode) = split_nul_pair(payload)?;
            match iface.fopen(path, mode) {
                Some(handle) => Ok((Rpc::with_fields(RpcType::Okay, rpc.pid, rpc.eid, handle), Vec::new())),
                None => Ok(fail()),
            }
        }
        RpcType::InAvail => {
            let avail = iface.in_avail(rpc.n);
            Ok(wide_reply(rpc.pid, rpc.eid, avail))
        }
        RpcType::PubSeekOff => {
            let pos = iface.pubseekoff(rpc.eid, rpc.n as i64, SeekFrom::Current(0));
            Ok(wide_reply(rpc.pid, rpc.eid, pos))
        }
        RpcType::PubSeekPos => {
            let pos = read_wide(payload)? as u64;
            let pos = iface.pubseekpos(rpc.eid, pos);
            Ok(wide_reply(rpc.pid, rpc.eid, pos))
        }
        RpcType::PubSync => {
            let result = iface.pubsync(rpc.n);
            Ok((Rpc::with_fields(RpcType::Okay, rpc.pid, rpc.eid, result as u32), Vec::new()))
        }
        RpcType::SBumpc => match iface.sbumpc(rpc.n) {
            Some(byte) => Ok((Rpc::with_fields(RpcType::Okay, rpc.pid, rpc.eid, byte as u32), Vec::new())),
            None => Ok(fail()),
        },
        RpcType::SGetc => match iface.sgetc(rpc.n) {
            Some(byte) => Ok((Rpc::with_fields(RpcType::Okay, rpc.pid, rpc.eid, byte as u32), Vec::new())),
            None => Ok(fail()),
        },
        RpcType::SGetn => {
            let bytes = iface.sgetn(rpc.eid, rpc.n as usize);
            Ok((Rpc::with_fields(RpcType::Okay, rpc.pid, rpc.eid, bytes.len() as u32), bytes))
        }
        RpcType::SPutc => {
            let accepted = iface.sputc(rpc.eid, rpc.n as u8);
            Ok(if accepted { okay() } else { fail() })
        }
        RpcType::SPutn => {
            let written = iface.sputn(rpc.eid, payload);
            Ok((Rpc::with_fields(RpcType::Okay, rpc.pid, rpc.eid, written as u32), Vec::new()))
        }
        RpcType::TeardownEngine => {
            // No local engine-core table to release in this process; just
            // acknowledge so the peer can free its own bookkeeping for `eid`.
            Ok(okay())
        }
        other => {
            warn!(?other, "unsupported interface RPC");
            Ok(fail())
        }
    }
}
