//! High-level client orchestration
//!
//! Ties the pieces together: consensus in, path selection, carrier
//! failover, circuit construction, and the engine event channel out. One
//! `TorClient` owns the failover cache, the guard state, the relay
//! blacklist for this bootstrap, and the set of live circuit IDs.

use crate::config::CoreConfig;
use crate::consensus::Consensus;
use crate::error::{Result, TorError};
use crate::events::Event;
use crate::path::{GuardState, PathPlan, PathSelector};
use crate::protocol::circuit::{Circuit, CIRCUIT_BUILD_TIMEOUT};
use crate::runtime;
use crate::shaper::{Shaper, ShaperConfig};
use crate::transport::{blinding, BridgeEndpoint, CarrierConnector, Failover};
use futures::channel::mpsc;
use std::collections::HashSet;

/// The protocol core's top-level handle.
pub struct TorClient {
    config: CoreConfig,
    bridge_url: String,
    connectors: Vec<Box<dyn CarrierConnector>>,
    failover: Failover,
    consensus: Option<Consensus>,
    guard_state: GuardState,
    /// Relays that failed a handshake this bootstrap; never retried.
    blacklist: HashSet<[u8; 20]>,
    /// Live circuit IDs, for collision-free allocation.
    circuit_ids: HashSet<u32>,
    events: mpsc::UnboundedSender<Event>,
}

impl TorClient {
    /// Create a client. The returned receiver is the engine event channel
    /// (`CircuitBuilt`, `CircuitFailed`, `TransportSwitched`, ...).
    pub fn new(
        config: CoreConfig,
        bridge_url: String,
        connectors: Vec<Box<dyn CarrierConnector>>,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, receiver) = mpsc::unbounded();
        let failover = Failover::new(config.usable_carriers());
        (
            Self {
                config,
                bridge_url,
                connectors,
                failover,
                consensus: None,
                guard_state: GuardState::new(),
                blacklist: HashSet::new(),
                circuit_ids: HashSet::new(),
                events,
            },
            receiver,
        )
    }

    /// Restore the host-persisted guard blob.
    pub fn load_guard_blob(&mut self, blob: &str) -> Result<()> {
        self.guard_state = GuardState::from_blob(blob)?;
        Ok(())
    }

    /// The opaque blob the host should persist.
    pub fn guard_blob(&self) -> Result<String> {
        self.guard_state.to_blob()
    }

    /// Install a consensus body (the bytes of `GET /tor/consensus`).
    pub fn set_consensus(&mut self, body: &[u8]) -> Result<()> {
        let consensus = Consensus::parse(body)?;
        log::info!(
            "consensus installed: {} relays, epoch {}",
            consensus.relays.len(),
            consensus.epoch()
        );
        self.consensus = Some(consensus);
        Ok(())
    }

    /// Whether the installed consensus is still usable under the
    /// configured TTL. Circuits must not be reused past this point.
    pub fn consensus_fresh(&self) -> bool {
        self.consensus
            .as_ref()
            .map(|c| c.is_fresh(self.config.consensus_ttl_s))
            .unwrap_or(false)
    }

    fn emit(&self, event: Event) {
        let _ = self.events.unbounded_send(event);
    }

    /// The bridge endpoint for a planned guard, applying the blinding
    /// envelope when Bridge B's key is configured.
    fn endpoint_for(&self, plan: &PathPlan) -> Result<BridgeEndpoint> {
        let guard_addr = plan.guard.addr_string();
        let blinded_addr = match self.config.bridge_b_key()? {
            Some(key) => Some(blinding::seal_guard_addr_b64(&guard_addr, &key)?),
            None => None,
        };
        Ok(BridgeEndpoint {
            url: self.bridge_url.clone(),
            guard_addr,
            blinded_addr,
            webtunnel_secret: self.config.webtunnel_secret.clone(),
        })
    }

    /// Build one 3-hop circuit toward `target_port`, walking the carrier
    /// order on transport failures and replanning around relays that fail
    /// their handshakes. Returns a `Ready` circuit.
    pub async fn build_circuit(&mut self, target_port: u16) -> Result<Circuit> {
        // One try per usable carrier, plus one for a mid-build replan.
        let attempts = self.config.usable_carriers().len().max(1) + 1;
        let mut last_err = TorError::CircuitBuildFailed("no attempts made".into());

        for attempt in 0..attempts {
            match self.try_build(target_port).await {
                Ok(circuit) => {
                    self.guard_state.record_success();
                    self.circuit_ids.insert(circuit.id());
                    self.emit(Event::CircuitBuilt {
                        circuit_id: circuit.id(),
                    });
                    return Ok(circuit);
                }
                Err(e) => {
                    log::warn!("circuit build attempt {} failed: {e}", attempt + 1);
                    if !e.is_retryable() && !e.blacklists_relay() {
                        self.emit_failure(&e);
                        return Err(e);
                    }
                    last_err = e;
                }
            }
        }

        self.emit_failure(&last_err);
        Err(last_err)
    }

    fn emit_failure(&self, err: &TorError) {
        self.emit(Event::CircuitFailed {
            circuit_id: 0,
            reason: err.clone(),
        });
    }

    async fn try_build(&mut self, target_port: u16) -> Result<Circuit> {
        let consensus = self
            .consensus
            .as_ref()
            .ok_or_else(|| TorError::Consensus("no consensus installed".into()))?;
        if !consensus.is_fresh(self.config.consensus_ttl_s) {
            return Err(TorError::Consensus("consensus expired, refetch".into()));
        }
        let epoch = consensus.epoch();
        let plan = PathSelector::new(consensus).plan(
            &mut self.guard_state,
            self.config.guard_fingerprint.as_deref(),
            target_port,
            &self.blacklist,
            runtime::now_unix_secs(),
        )?;
        log::info!(
            "path: {} -> {} -> {}",
            plan.guard.nickname,
            plan.middle.nickname,
            plan.exit.nickname
        );

        let endpoint = self.endpoint_for(&plan)?;
        let established = self
            .failover
            .establish(epoch, &endpoint, &self.connectors)
            .await?;
        for event in established.events {
            self.emit(event);
        }
        let kind = established.kind;

        let shaper = Shaper::new(ShaperConfig::for_profile(
            self.config.shaper_profile,
            self.config.paranoid,
        ));

        // Which hop the build is currently negotiating with, so a failed
        // handshake blacklists the right relay.
        let stage = std::cell::Cell::new(0u8);
        let circuit_ids = &self.circuit_ids;
        let built = runtime::timeout("circuit build", CIRCUIT_BUILD_TIMEOUT, async {
            let mut circuit =
                Circuit::open(&plan.guard, established.carrier, shaper, circuit_ids).await?;
            stage.set(1);
            circuit.extend(&plan.middle).await?;
            stage.set(2);
            circuit.extend(&plan.exit).await?;
            Ok::<Circuit, TorError>(circuit)
        })
        .await
        .and_then(|inner| inner);

        match built {
            Ok(circuit) => {
                self.failover.cache_success(epoch, kind);
                Ok(circuit)
            }
            Err(e) => {
                if e.blacklists_relay() {
                    let failed = match stage.get() {
                        0 => &plan.guard,
                        1 => &plan.middle,
                        _ => &plan.exit,
                    };
                    log::warn!(
                        "relay {} blacklisted for this bootstrap: {e}",
                        failed.nickname
                    );
                    self.blacklist.insert(failed.fingerprint);
                }
                if matches!(e, TorError::Transport(_) | TorError::Timeout(_)) {
                    self.failover.mark_failed(kind);
                    self.guard_state.record_failure();
                }
                Err(e)
            }
        }
    }

    /// Forget a circuit that the host has closed (frees its ID).
    pub fn circuit_closed(&mut self, circuit_id: u32) {
        self.circuit_ids.remove(&circuit_id);
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }
}
