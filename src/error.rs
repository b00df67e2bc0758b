//! Error types for the protocol core
//!
//! One taxonomy for the whole engine:
//! - `Protocol` / `Cell`: malformed or out-of-context bytes on the wire
//! - `Crypto`: handshake or onion-layer failures
//! - `Transport`: carrier connect/IO failures (trigger carrier failover)
//! - `Policy`: path selection dead ends
//! - `State`: illegal transitions (a bug, not a peer behavior)
//! - `Remote` / `StreamEnd`: the other side closed with a reason byte
//! - `Timeout`: a build/extend/connect budget expired

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Cell-codec errors. `UnknownCommand` is non-fatal: the decoder passes it
/// upward and the caller decides whether the context allows skipping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CellError {
    #[error("truncated cell: need {needed} bytes, have {have}")]
    TruncatedCell { needed: usize, have: usize },

    #[error("unknown cell command: {0}")]
    UnknownCommand(u8),

    #[error("variable-length cell too large: {0} bytes")]
    OversizedVariable(usize),
}

/// Main error type for the protocol core
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Wire errors =====
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Cell(#[from] CellError),

    #[error("relay cell digest mismatch")]
    DigestMismatch,

    // ===== Crypto errors =====
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("handshake auth verification failed")]
    AuthMismatch,

    // ===== Transport errors =====
    #[error("transport error: {0}")]
    Transport(String),

    #[error("all carriers failed: {0}")]
    AllCarriersFailed(String),

    // ===== Policy errors =====
    #[error("policy error: {0}")]
    Policy(String),

    #[error("no exit relay permits port {0}")]
    NoMatchingExit(u16),

    // ===== State errors (bugs) =====
    #[error("illegal state transition: {0}")]
    State(String),

    // ===== Remote closes =====
    #[error("circuit destroyed by remote: reason={reason} ({reason_name})")]
    Remote { reason: u8, reason_name: &'static str },

    #[error("stream ended by remote: reason={0}")]
    StreamEnd(u8),

    // ===== Timeouts =====
    #[error("timed out: {0}")]
    Timeout(&'static str),

    // ===== Build orchestration =====
    #[error("circuit build failed: {0}")]
    CircuitBuildFailed(String),

    #[error("circuit is closed")]
    CircuitClosed,

    // ===== Directory / consensus =====
    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl TorError {
    /// Map a DESTROY reason byte to its tor-spec name.
    pub fn destroy_reason_name(reason: u8) -> &'static str {
        match reason {
            0 => "NONE",
            1 => "PROTOCOL",
            2 => "INTERNAL",
            3 => "REQUESTED",
            4 => "HIBERNATING",
            5 => "RESOURCELIMIT",
            6 => "CONNECTFAILED",
            7 => "OR_IDENTITY",
            8 => "CHANNEL_CLOSED",
            9 => "FINISHED",
            10 => "TIMEOUT",
            11 => "DESTROYED",
            12 => "NOSUCHSERVICE",
            _ => "UNKNOWN",
        }
    }

    /// Build a `Remote` error from a DESTROY reason byte.
    pub fn destroyed(reason: u8) -> Self {
        TorError::Remote {
            reason,
            reason_name: Self::destroy_reason_name(reason),
        }
    }

    /// Raise a state error. Illegal transitions are a bug in the engine, so
    /// development builds trip a debug assertion; release builds close the
    /// circuit with this error instead.
    pub fn bad_state(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        debug_assert!(false, "illegal state transition: {msg}");
        TorError::State(msg)
    }

    /// Whether this error must tear down the whole circuit.
    ///
    /// Stream-scoped and carrier-scoped failures are not fatal: a remote END
    /// closes one stream, a connect failure moves on to the next carrier.
    pub fn is_fatal_to_circuit(&self) -> bool {
        !matches!(
            self,
            TorError::StreamEnd(_)
                | TorError::Transport(_)
                | TorError::Cell(CellError::UnknownCommand(_))
                | TorError::Policy(_)
                | TorError::NoMatchingExit(_)
                | TorError::Config(_)
        )
    }

    /// Whether a bootstrap may retry after this error with different relays
    /// or a different carrier.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::Transport(_)
                | TorError::Timeout(_)
                | TorError::CircuitBuildFailed(_)
                | TorError::Remote { .. }
        )
    }

    /// Crypto failures during a handshake blacklist the relay for the rest
    /// of the bootstrap: never retry the same relay after these.
    pub fn blacklists_relay(&self) -> bool {
        matches!(self, TorError::Crypto(_) | TorError::AuthMismatch)
    }
}

#[cfg(target_arch = "wasm32")]
impl From<TorError> for wasm_bindgen::JsValue {
    fn from(err: TorError) -> Self {
        wasm_bindgen::JsValue::from_str(&err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_reason_names() {
        let err = TorError::destroyed(1);
        if let TorError::Remote { reason, reason_name } = err {
            assert_eq!(reason, 1);
            assert_eq!(reason_name, "PROTOCOL");
        } else {
            panic!("expected Remote");
        }
        assert_eq!(TorError::destroy_reason_name(99), "UNKNOWN");
    }

    #[test]
    fn stream_end_is_local() {
        assert!(!TorError::StreamEnd(6).is_fatal_to_circuit());
        assert!(TorError::DigestMismatch.is_fatal_to_circuit());
        assert!(TorError::destroyed(5).is_fatal_to_circuit());
    }

    #[test]
    fn transport_errors_retry() {
        assert!(TorError::Transport("connect refused".into()).is_retryable());
        assert!(TorError::Timeout("transport connect").is_retryable());
        assert!(!TorError::AuthMismatch.is_retryable());
    }

    #[test]
    fn crypto_errors_blacklist() {
        assert!(TorError::AuthMismatch.blacklists_relay());
        assert!(TorError::Crypto("point decompression".into()).blacklists_relay());
        assert!(!TorError::Timeout("extend").blacklists_relay());
    }

    #[test]
    fn cell_error_converts() {
        let err: TorError = CellError::UnknownCommand(200).into();
        assert!(!err.is_fatal_to_circuit());
        let err: TorError = CellError::OversizedVariable(70000).into();
        assert!(err.is_fatal_to_circuit());
    }
}
