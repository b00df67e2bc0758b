//! The Tor link and circuit protocol
//!
//! Cell framing, the ntor handshake, layered onion crypto with running
//! digests, the circuit engine, the stream multiplexer, and SENDME flow
//! control.

pub mod cell;
pub mod certs;
pub mod circuit;
pub mod flow;
pub mod ntor;
pub mod onion;
pub mod stream;

pub use cell::{Cell, CellCodec, CellCommand, RelayCell, RelayCommand, CELL_LEN, PAYLOAD_LEN, RELAY_DATA_LEN};
pub use circuit::{allocate_circuit_id, Circuit, CircuitState, Hop, CIRCUIT_BUILD_TIMEOUT, HOP_TIMEOUT};
pub use flow::{RecvWindow, SendWindow};
pub use ntor::NtorClient;
pub use onion::{CircuitKeys, OnionCrypt};
pub use stream::{Stream, StreamMap, StreamState};
