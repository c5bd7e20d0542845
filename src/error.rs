//! Error taxonomy for the runtime core.
//!
//! Mirrors the split the original implementation draws between errors a
//! caller can recover from locally (`CompileError`, a bad parse) and errors
//! that must tear down a connection or the whole process (`ProtocolError`,
//! `Fatal`). Cycle-time [`crate::engine::Engine`] methods either succeed or
//! leave the engine observably unchanged; state-safe interrupts either
//! complete atomically or abort before the swap.

use std::sync::Mutex;

use thiserror::Error;

use crate::bits::MalformedLiteral;

/// Errors produced while parsing source-level text into a `Bits` value or
/// other textual encoding the runtime accepts directly (not the elaborator's
/// own parse errors, which are an external collaborator's concern).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// A malformed bit-vector literal.
    #[error(transparent)]
    MalformedLiteral(#[from] MalformedLiteral),
}

/// A backend could not produce an engine. Recovered locally by keeping
/// whatever engine was already installed (usually the software engine).
#[derive(Debug, Error)]
pub enum CompileError {
    /// The backend rejected the module text for a reason it reports as a string.
    #[error("compile failed: {0}")]
    Rejected(String),
    /// The compile was cancelled via `stop_compile` before it completed.
    #[error("compile cancelled")]
    Cancelled,
    /// The module was torn down while its compile was still outstanding.
    #[error("engine removed before compile completed")]
    EngineRemoved,
}

/// A socket read, write, or select operation failed. A proxy engine whose
/// sync socket errors surfaces this to the scheduler, which tears it down
/// via a state-safe interrupt.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying I/O operation failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
}

/// A reply's `type` tag didn't match what the request expected. Fatal to the
/// connection that produced it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("protocol error: expected reply type {expected:?}, got {actual:?}")]
pub struct ProtocolError {
    /// The reply type the caller expected.
    pub expected: crate::rpc::RpcType,
    /// The reply type actually received.
    pub actual: crate::rpc::RpcType,
}

/// Unrecoverable conditions: out-of-memory, invariant violation. The process
/// is expected to exit after observing one of these.
#[derive(Debug, Error)]
pub enum Fatal {
    /// An internal invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),
}

/// The runtime-wide error union.
#[derive(Debug, Error)]
pub enum CascadeError {
    /// Text failed to parse.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Elaboration failed; the message is produced by the external elaborator.
    #[error("elaboration error: {0}")]
    Elaboration(String),
    /// A backend compile failed.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// A transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A protocol-level failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// An unrecoverable failure.
    #[error(transparent)]
    Fatal(#[from] Fatal),
}

/// A buffer of non-fatal diagnostics a component accumulates and a caller can
/// later drain, matching the original `Loggable` warning-buffering idiom.
#[derive(Debug, Default)]
pub struct Warnings {
    buffer: Mutex<Vec<String>>,
}

impl Warnings {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning.
    pub fn push(&self, message: impl Into<String>) {
        self.buffer
            .lock()
            .expect("warnings mutex poisoned")
            .push(message.into());
    }

    /// Drain all recorded warnings, leaving the buffer empty.
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.buffer.lock().expect("warnings mutex poisoned"))
    }

    /// True iff no warnings are currently buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().expect("warnings mutex poisoned").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_drain_empties_the_buffer() {
        let w = Warnings::new();
        w.push("first");
        w.push("second");
        assert_eq!(w.drain(), vec!["first".to_string(), "second".to_string()]);
        assert!(w.is_empty());
    }
}
