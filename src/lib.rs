//! # webtor
//!
//! The protocol core of a browser-hostable Tor client: enough engine to
//! let a sandboxed page build a real 3-hop onion circuit through a
//! bridging relay, carry streams over it, and look like something else
//! entirely while doing so.
//!
//! ## Architecture
//!
//! ```text
//! application bytes
//!   ↓ stream multiplexer        (protocol::stream)
//!   ↓ circuit engine + SENDMEs  (protocol::circuit, protocol::flow)
//!   ↓ onion layers + digests    (protocol::onion, protocol::ntor)
//!   ↓ cell codec                (protocol::cell)
//!   ↓ traffic shaper            (shaper)
//!   ↓ carrier                   (transport: ws / webtunnel / meek / webrtc)
//!   → bridge → guard → middle → exit
//! ```
//!
//! The protocol core is target-independent; only the concrete carriers
//! and the entry point below touch browser APIs. Path selection feeds on
//! a consensus snapshot the host fetches from the bridge; the WebRTC
//! carrier signals through the broker state machine in `broker`, which
//! also serves as the broker's own implementation.

pub mod broker;
pub mod client;
pub mod config;
pub mod consensus;
pub mod error;
pub mod events;
pub mod path;
pub mod protocol;
pub mod runtime;
pub mod shaper;
pub mod transport;

pub use client::TorClient;
pub use config::CoreConfig;
pub use consensus::{Consensus, RelayDescriptor, RelayFlags};
pub use error::{CellError, Result, TorError};
pub use events::Event;
pub use path::{GuardState, PathSelector};
pub use protocol::{Circuit, CircuitState};
pub use shaper::{Shaper, ShaperConfig, ShaperProfile};
pub use transport::{BridgeEndpoint, Carrier, CarrierConnector, CarrierKind, Failover};

/// Wire up logging when the wasm module loads.
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen::prelude::wasm_bindgen(start)]
pub fn init() {
    let _ = console_log::init_with_level(log::Level::Info);
    log::info!("webtor core initialized");
}
