//! Transport carriers
//!
//! A carrier is an opaque bidirectional ordered byte stream toward the
//! bridge; the cell codec reassembles cells from whatever chunking the
//! carrier delivers. Four concrete carriers exist (direct WebSocket,
//! WebTunnel, meek, WebRTC); the protocol core only sees the `Carrier`
//! trait plus the ordered failover policy.
//!
//! Failover is per-circuit, never per-cell: a circuit lives and dies on
//! the carrier it was built over.

use crate::error::{Result, TorError};
use crate::events::Event;
use crate::runtime;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod blinding;
pub mod meek;
pub mod webtunnel;

#[cfg(target_arch = "wasm32")]
pub mod webrtc;
#[cfg(target_arch = "wasm32")]
pub mod websocket;

/// Budget for one carrier's connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A carrier that closes within this window of opening, without having
/// delivered a cell, counts as failed (triggers failover, not retry).
pub const INFANT_CLOSE_WINDOW: Duration = Duration::from_secs(3);

/// The concrete carrier kinds, in their config spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CarrierKind {
    #[serde(rename = "ws")]
    WebSocket,
    #[serde(rename = "webtunnel")]
    WebTunnel,
    #[serde(rename = "meek")]
    Meek,
    #[serde(rename = "webrtc")]
    WebRtc,
}

impl std::fmt::Display for CarrierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CarrierKind::WebSocket => "ws",
            CarrierKind::WebTunnel => "webtunnel",
            CarrierKind::Meek => "meek",
            CarrierKind::WebRtc => "webrtc",
        };
        f.write_str(name)
    }
}

/// An established bidirectional ordered byte stream.
///
/// `recv` resolves with the next chunk of bytes as delivered by the
/// underlying protocol; chunk boundaries carry no meaning. All carriers
/// are `?Send`: the engine is single-threaded per circuit.
#[async_trait(?Send)]
pub trait Carrier {
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;
    async fn recv(&mut self) -> Result<Vec<u8>>;
    async fn close(&mut self) -> Result<()>;

    /// Bytes already buffered by the carrier, without suspending. Lets the
    /// engine notice a queued DESTROY before committing to an EXTEND2.
    fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Where a carrier should land.
#[derive(Debug, Clone)]
pub struct BridgeEndpoint {
    /// Bridge base URL (`wss://…` or `https://…` depending on carrier).
    pub url: String,

    /// Target guard as `host:port`, passed to the bridge in clear when no
    /// blinding envelope is configured.
    pub guard_addr: String,

    /// Base64url blinding envelope; when present it replaces the clear
    /// guard address on the wire (Bridge A relays it opaquely).
    pub blinded_addr: Option<String>,

    /// WebTunnel shared secret path, when that carrier is in play.
    pub webtunnel_secret: Option<String>,
}

impl BridgeEndpoint {
    /// The address parameter actually sent to the bridge.
    pub fn addr_param(&self) -> &str {
        self.blinded_addr.as_deref().unwrap_or(&self.guard_addr)
    }
}

/// Dials one kind of carrier. Concrete implementations live with their
/// carriers; tests inject mock connectors.
#[async_trait(?Send)]
pub trait CarrierConnector {
    fn kind(&self) -> CarrierKind;
    async fn connect(&self, endpoint: &BridgeEndpoint) -> Result<Box<dyn Carrier>>;
}

/// Ordered carrier failover with a per-epoch success cache.
pub struct Failover {
    order: Vec<CarrierKind>,
    cached: Option<(u64, CarrierKind)>,
    /// Carriers that connected but died at open (the infant-close rule);
    /// skipped until the whole order is exhausted.
    failed: Vec<CarrierKind>,
    /// The carrier last handed out, so a switch across establish() calls
    /// still surfaces as a TransportSwitched event.
    last_kind: Option<CarrierKind>,
}

/// Outcome of one failover round.
pub struct Established {
    pub kind: CarrierKind,
    pub carrier: Box<dyn Carrier>,
    /// `TransportSwitched` events accumulated while falling through the
    /// order; the caller forwards them to its event sink.
    pub events: Vec<Event>,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("kind", &self.kind)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Failover {
    pub fn new(order: Vec<CarrierKind>) -> Self {
        Self {
            order,
            cached: None,
            failed: Vec::new(),
            last_kind: None,
        }
    }

    /// Remember the carrier that worked, for the rest of this epoch.
    pub fn cache_success(&mut self, epoch: u64, kind: CarrierKind) {
        self.cached = Some((epoch, kind));
    }

    /// Forget a cached carrier that later proved broken.
    pub fn invalidate(&mut self, kind: CarrierKind) {
        if matches!(self.cached, Some((_, k)) if k == kind) {
            self.cached = None;
        }
    }

    /// A carrier connected but died before carrying a cell: skip it on
    /// the next rounds until everything else has failed too.
    pub fn mark_failed(&mut self, kind: CarrierKind) {
        self.invalidate(kind);
        if !self.failed.contains(&kind) {
            self.failed.push(kind);
        }
    }

    /// The order to try for this epoch: the cached success first, then the
    /// configured order, with open-failed carriers held back. Once every
    /// carrier has failed, the slate is wiped and the full order returns.
    fn attempt_order(&mut self, epoch: u64) -> Vec<CarrierKind> {
        if self.order.iter().all(|k| self.failed.contains(k)) {
            self.failed.clear();
        }

        let mut order = Vec::with_capacity(self.order.len());
        if let Some((cached_epoch, kind)) = self.cached {
            if cached_epoch == epoch && !self.failed.contains(&kind) {
                order.push(kind);
            }
        }
        for kind in &self.order {
            if !order.contains(kind) && !self.failed.contains(kind) {
                order.push(*kind);
            }
        }
        order
    }

    /// Walk the order until a connector yields a stream within the 10 s
    /// budget. Emits a `TransportSwitched` event at each fall-through.
    pub async fn establish(
        &mut self,
        epoch: u64,
        endpoint: &BridgeEndpoint,
        connectors: &[Box<dyn CarrierConnector>],
    ) -> Result<Established> {
        let mut events = Vec::new();
        let mut last_err = TorError::AllCarriersFailed("no carriers configured".into());
        let order = self.attempt_order(epoch);
        let mut previous = self.last_kind;

        for kind in order {
            let Some(connector) = connectors.iter().find(|c| c.kind() == kind) else {
                continue;
            };

            if let Some(from) = previous {
                if from != kind {
                    events.push(Event::TransportSwitched { from, to: kind });
                }
            }
            previous = Some(kind);
            self.last_kind = Some(kind);

            log::debug!("trying carrier {kind} toward {}", endpoint.url);
            match runtime::timeout("transport connect", CONNECT_TIMEOUT, connector.connect(endpoint))
                .await
            {
                Ok(Ok(carrier)) => {
                    return Ok(Established {
                        kind,
                        carrier: Box::new(InfantGuard::new(carrier)),
                        events,
                    });
                }
                Ok(Err(e)) => {
                    log::warn!("carrier {kind} failed to connect: {e}");
                    self.invalidate(kind);
                    last_err = e;
                }
                Err(e) => {
                    log::warn!("carrier {kind} timed out connecting");
                    self.invalidate(kind);
                    last_err = e;
                }
            }
        }

        Err(TorError::AllCarriersFailed(last_err.to_string()))
    }
}

/// Wraps a fresh carrier to apply the infant-close rule: an error before
/// any bytes arrived, within 3 s of opening, is reported as a carrier
/// failure (so the next build falls over) rather than a generic IO error.
struct InfantGuard {
    inner: Box<dyn Carrier>,
    opened_at_ms: u64,
    delivered: bool,
}

impl InfantGuard {
    fn new(inner: Box<dyn Carrier>) -> Self {
        Self {
            inner,
            opened_at_ms: runtime::now_unix_millis(),
            delivered: false,
        }
    }

    fn classify(&self, e: TorError) -> TorError {
        let age = runtime::now_unix_millis().saturating_sub(self.opened_at_ms);
        if !self.delivered && age <= INFANT_CLOSE_WINDOW.as_millis() as u64 {
            TorError::Transport(format!("carrier died at open ({e})"))
        } else {
            e
        }
    }
}

#[async_trait(?Send)]
impl Carrier for InfantGuard {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        match self.inner.send(bytes).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.classify(e)),
        }
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        match self.inner.recv().await {
            Ok(bytes) => {
                self.delivered = true;
                Ok(bytes)
            }
            Err(e) => Err(self.classify(e)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        let got = self.inner.try_recv()?;
        if got.is_some() {
            self.delivered = true;
        }
        Ok(got)
    }
}
