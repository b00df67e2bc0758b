//! Typed events surfaced by the engine
//!
//! The browser APIs underneath are callback-based; the engine instead owns
//! a message pump per circuit and reports progress through these events so
//! the host never observes intermediate mutation.

use crate::error::TorError;
use crate::transport::CarrierKind;

/// User-visible engine events.
#[derive(Debug, Clone)]
pub enum Event {
    /// A circuit reached `Ready` (three hops, keys in place).
    CircuitBuilt { circuit_id: u32 },

    /// A circuit failed before or after `Ready`.
    CircuitFailed { circuit_id: u32, reason: TorError },

    /// RELAY_CONNECTED arrived for a stream we opened.
    StreamOpened { circuit_id: u32, stream_id: u16 },

    /// A stream closed, locally or by remote END. `reason` is the END
    /// reason byte (DONE=6 for local closes).
    StreamClosed {
        circuit_id: u32,
        stream_id: u16,
        reason: u8,
    },

    /// Carrier failover switched transports.
    TransportSwitched {
        from: CarrierKind,
        to: CarrierKind,
    },
}
