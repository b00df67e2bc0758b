//! Circuit engine
//!
//! Owns one circuit end to end: link negotiation with the guard
//! (VERSIONS / CERTS / AUTH_CHALLENGE / NETINFO), CREATE2 and EXTEND2
//! assembly, the RELAY cell multiplexer, SENDME flow control, and
//! teardown. All mutation funnels through `&mut Circuit` — the single
//! owner task of the concurrency model; nothing here is shared.
//!
//! States: Opening → Building (CREATED2 from the guard) → Building (each
//! EXTENDED2) → Ready (EXTENDED2 from the exit) → Closing → Closed.

use crate::consensus::RelayDescriptor;
use crate::error::{Result, TorError};
use crate::events::Event;
use crate::protocol::cell::{
    Cell, CellCodec, CellCommand, RelayCell, RelayCommand, PAYLOAD_LEN, RELAY_DATA_LEN,
};
use crate::protocol::certs::CertsCell;
use crate::protocol::flow::{encode_sendme, parse_sendme, RecvWindow, SendWindow};
use crate::protocol::ntor::{NtorClient, NTOR_HANDSHAKE_TYPE, NTOR_ONIONSKIN_LEN};
use crate::protocol::onion::OnionCrypt;
use crate::protocol::stream::{StreamMap, StreamState};
use crate::runtime;
use crate::shaper::Shaper;
use crate::transport::Carrier;
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

/// Whole-build budget (guard + both extends).
pub const CIRCUIT_BUILD_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for one hop: the CREATE2 or one EXTEND2 round trip.
pub const HOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Attempts to find an unused circuit ID before giving up.
const CIRC_ID_ATTEMPTS: usize = 8;

/// Link protocol versions this engine speaks.
const SUPPORTED_LINK_VERSIONS: [u16; 2] = [4, 5];

/// DESTROY reason we send on protocol violations.
pub const DESTROY_REASON_PROTOCOL: u8 = 1;

/// DESTROY reason for an orderly local close.
pub const DESTROY_REASON_FINISHED: u8 = 9;

/// RELAY_END reason for an orderly close.
pub const END_REASON_DONE: u8 = 6;

/// Pick a circuit ID in our half-space (high bit set, as the initiating
/// side of the link), retrying on collision with live circuits.
pub fn allocate_circuit_id(in_use: &HashSet<u32>) -> Result<u32> {
    for _ in 0..CIRC_ID_ATTEMPTS {
        let id = rand::random::<u32>() | 0x8000_0000;
        if !in_use.contains(&id) {
            return Ok(id);
        }
    }
    Err(TorError::Protocol("no free circuit ID after 8 draws".into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Opening,
    Building,
    Ready,
    Closing,
    Closed,
}

/// One relay of the circuit. Key material lives in the onion layer; the
/// hop keeps the descriptor and a send counter for diagnostics.
pub struct Hop {
    pub relay: RelayDescriptor,
    pub cells_sent: u64,
}

/// A client circuit over one carrier.
pub struct Circuit {
    id: u32,
    state: CircuitState,
    hops: Vec<Hop>,
    crypt: OnionCrypt,
    carrier: Box<dyn Carrier>,
    codec: CellCodec,
    inbound: Vec<u8>,
    shaper: Shaper,
    circ_send: SendWindow,
    circ_recv: RecvWindow,
    pub(crate) streams: StreamMap,
    pub(crate) deferred_events: VecDeque<Event>,
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

impl Circuit {
    /// Open a circuit to `guard` over an established carrier: negotiate
    /// the link, then CREATE2. On success the circuit is in `Building`.
    pub async fn open(
        guard: &RelayDescriptor,
        carrier: Box<dyn Carrier>,
        shaper: Shaper,
        in_use: &HashSet<u32>,
    ) -> Result<Circuit> {
        let id = allocate_circuit_id(in_use)?;
        let mut circuit = Circuit {
            id,
            state: CircuitState::Opening,
            hops: Vec::new(),
            crypt: OnionCrypt::new(),
            carrier,
            codec: CellCodec::new(),
            inbound: Vec::new(),
            shaper,
            circ_send: SendWindow::circuit(),
            circ_recv: RecvWindow::circuit(),
            streams: StreamMap::new(),
            deferred_events: VecDeque::new(),
        };

        let guard = guard.clone();
        runtime::timeout("link + create", HOP_TIMEOUT, async {
            circuit.link_handshake(&guard).await?;
            circuit.create_first_hop(&guard).await
        })
        .await??;

        Ok(circuit)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn is_ready(&self) -> bool {
        self.state == CircuitState::Ready
    }

    /// Exposed for close-path tests: all hop keys overwritten with zeros.
    pub fn keys_wiped(&self) -> bool {
        self.crypt.all_keys_wiped()
    }

    // ===== Link negotiation =====

    /// VERSIONS exchange, CERTS verification, AUTH_CHALLENGE, NETINFO.
    async fn link_handshake(&mut self, guard: &RelayDescriptor) -> Result<()> {
        // VERSIONS goes out in the pre-negotiation framing.
        let mut versions_payload = Vec::with_capacity(SUPPORTED_LINK_VERSIONS.len() * 2);
        for v in SUPPORTED_LINK_VERSIONS {
            versions_payload.extend_from_slice(&v.to_be_bytes());
        }
        self.send_cell(Cell::new(0, CellCommand::Versions, versions_payload))
            .await?;

        let versions = self.read_cell().await?;
        if versions.command != CellCommand::Versions {
            return Err(TorError::Protocol(format!(
                "expected VERSIONS, got {:?}",
                versions.command
            )));
        }
        let link_version = negotiate_link_version(&versions.payload)?;
        self.codec.set_link_version(link_version);
        log::debug!("link protocol v{link_version} negotiated");

        // The relay now sends CERTS, AUTH_CHALLENGE, NETINFO.
        let mut saw_certs = false;
        loop {
            let cell = self.read_cell().await?;
            match cell.command {
                CellCommand::Certs => {
                    let certs = CertsCell::parse(&cell.payload)?;
                    match guard.ed_identity {
                        Some(identity) => {
                            certs.verify_signing_key(&identity, runtime::now_unix_secs())?;
                            log::debug!("guard link certs verified against Ed25519 identity");
                        }
                        None => certs.quick_check()?,
                    }
                    saw_certs = true;
                }
                CellCommand::AuthChallenge => {
                    // We never authenticate back; acknowledged by NETINFO.
                }
                CellCommand::Netinfo => break,
                CellCommand::Padding | CellCommand::Vpadding => {}
                CellCommand::Destroy => {
                    return Err(destroy_error(&cell));
                }
                other => {
                    return Err(TorError::Protocol(format!(
                        "unexpected {other:?} during link handshake"
                    )));
                }
            }
        }
        if !saw_certs {
            return Err(TorError::Protocol("relay sent no CERTS cell".into()));
        }

        self.send_cell(Cell::new(0, CellCommand::Netinfo, build_netinfo()))
            .await?;
        Ok(())
    }

    // ===== Circuit construction =====

    async fn create_first_hop(&mut self, guard: &RelayDescriptor) -> Result<()> {
        if self.state != CircuitState::Opening {
            return Err(TorError::bad_state(format!(
                "CREATE2 in {:?}",
                self.state
            )));
        }

        let (ntor, onionskin) = NtorClient::start(guard.fingerprint, guard.ntor_onion_key);

        let mut payload = Vec::with_capacity(4 + NTOR_ONIONSKIN_LEN);
        payload.extend_from_slice(&NTOR_HANDSHAKE_TYPE.to_be_bytes());
        payload.extend_from_slice(&(NTOR_ONIONSKIN_LEN as u16).to_be_bytes());
        payload.extend_from_slice(&onionskin);
        self.send_cell(Cell::new(self.id, CellCommand::Create2, payload))
            .await?;

        let reply = self.read_circuit_cell().await?;
        let hdata = match reply.command {
            CellCommand::Created2 => parse_hlen_hdata(&reply.payload)?,
            CellCommand::Destroy => {
                self.state = CircuitState::Closed;
                return Err(destroy_error(&reply));
            }
            other => {
                return Err(TorError::Protocol(format!(
                    "expected CREATED2, got {other:?}"
                )));
            }
        };

        let keys = ntor.finish(hdata)?;
        self.crypt.push_hop(keys);
        self.hops.push(Hop {
            relay: guard.clone(),
            cells_sent: 0,
        });
        self.state = CircuitState::Building;
        log::info!("circuit {:#x}: first hop {}", self.id, guard.nickname);
        Ok(())
    }

    /// Extend the circuit by one hop. `Building → Building` for the
    /// middle, `Building → Ready` once the third hop answers.
    pub async fn extend(&mut self, next: &RelayDescriptor) -> Result<()> {
        if self.state != CircuitState::Building {
            return Err(TorError::bad_state(format!("EXTEND2 in {:?}", self.state)));
        }

        // A DESTROY may already be sitting in the carrier (e.g. the guard
        // rejected us right after CREATED2). Surface it before putting an
        // EXTEND2 on the wire.
        self.drain_buffered_control()?;
        if self.state == CircuitState::Closed {
            return Err(TorError::CircuitClosed);
        }

        let next = next.clone();
        let deadline = HOP_TIMEOUT;
        runtime::timeout("extend", deadline, async {
            let (ntor, onionskin) = NtorClient::start(next.fingerprint, next.ntor_onion_key);
            let body = build_extend2(&next, &onionskin);

            // Circuit extension rides RELAY_EARLY per the link protocol.
            let relay = RelayCell::new(RelayCommand::Extend2, 0, body);
            self.send_relay_cell(relay, true).await?;

            let (reply, from_hop) = loop {
                let cell = self.read_circuit_cell().await?;
                match cell.command {
                    CellCommand::Relay | CellCommand::RelayEarly => {
                        let (relay, hop, _digest) = self.unwrap_relay(&cell)?;
                        break (relay, hop);
                    }
                    CellCommand::Destroy => {
                        self.state = CircuitState::Closed;
                        self.crypt.wipe();
                        return Err(destroy_error(&cell));
                    }
                    other => {
                        return Err(TorError::Protocol(format!(
                            "expected EXTENDED2, got {other:?}"
                        )));
                    }
                }
            };

            if from_hop != self.hops.len() - 1 {
                return Err(TorError::Protocol(
                    "EXTENDED2 from a hop other than the path end".into(),
                ));
            }
            if reply.command != RelayCommand::Extended2 {
                return Err(TorError::Protocol(format!(
                    "expected EXTENDED2, got {:?}",
                    reply.command
                )));
            }

            let keys = ntor.finish(parse_hlen_hdata(&reply.data)?)?;
            self.crypt.push_hop(keys);
            self.hops.push(Hop {
                relay: next.clone(),
                cells_sent: 0,
            });

            if self.hops.len() == 3 {
                self.state = CircuitState::Ready;
                log::info!("circuit {:#x}: ready ({} hops)", self.id, self.hops.len());
            } else {
                log::info!("circuit {:#x}: extended to {}", self.id, next.nickname);
            }
            Ok(())
        })
        .await?
    }

    // ===== Outbound =====

    /// Encode, shape, and ship one link cell. Shaping starts only after
    /// VERSIONS settles the framing: cover cells use the 4-byte layout and
    /// would corrupt the pre-negotiation stream.
    async fn send_cell(&mut self, cell: Cell) -> Result<()> {
        let bytes = self.codec.encode(&cell)?;
        if self.codec.link_version() < 4 {
            return self.carrier.send(&bytes).await;
        }
        let frames = self.shaper.shape(bytes);
        for frame in frames {
            if !frame.delay.is_zero() {
                runtime::sleep(frame.delay).await;
            }
            self.carrier.send(&frame.bytes).await?;
        }
        Ok(())
    }

    /// Seal, onion-encrypt, and send one relay cell to the last hop.
    /// Returns the full running digest committed for the cell (the SENDME
    /// ledger needs it for RELAY_DATA).
    pub(crate) async fn send_relay_cell(
        &mut self,
        relay: RelayCell,
        early: bool,
    ) -> Result<[u8; 20]> {
        // Closing is allowed: close() drains streams with END cells.
        if self.state == CircuitState::Closed {
            return Err(TorError::CircuitClosed);
        }
        if self.hops.is_empty() {
            return Err(TorError::bad_state("relay cell with no hops"));
        }

        let mut payload = relay.encode()?;
        let target = self.hops.len() - 1;
        let digest = self.crypt.encrypt_forward(target, &mut payload)?;
        self.hops[target].cells_sent += 1;

        let cell = if early {
            Cell::relay_early(self.id, payload.to_vec())
        } else {
            Cell::relay(self.id, payload.to_vec())
        };
        self.send_cell(cell).await?;
        Ok(digest)
    }

    /// Send a RELAY cell on this circuit (the engine contract's
    /// `send_relay`). RELAY_DATA must go through the stream layer, which
    /// owns the window bookkeeping.
    pub async fn send_relay(
        &mut self,
        stream_id: u16,
        command: RelayCommand,
        data: Vec<u8>,
    ) -> Result<()> {
        debug_assert!(
            command != RelayCommand::Data,
            "RELAY_DATA must use write_stream"
        );
        if data.len() > RELAY_DATA_LEN {
            return Err(TorError::Protocol(format!(
                "relay payload of {} bytes exceeds {}",
                data.len(),
                RELAY_DATA_LEN
            )));
        }
        self.send_relay_cell(RelayCell::new(command, stream_id, data), false)
            .await?;
        Ok(())
    }

    /// Account one outbound RELAY_DATA cell against the circuit window.
    pub(crate) fn note_data_sent(&mut self, digest: [u8; 20]) -> Result<()> {
        self.circ_send.record_sent(digest)
    }

    pub(crate) fn circuit_window_open(&self) -> bool {
        self.circ_send.can_send()
    }

    /// Opportunistic chaff: call when idle (the client's event loop does).
    pub async fn idle_tick(&mut self) -> Result<()> {
        if self.state != CircuitState::Ready || !self.shaper.chaff_due() {
            return Ok(());
        }
        let frame = self.shaper.make_chaff();
        self.carrier.send(&frame.bytes).await
    }

    // ===== Inbound =====

    /// Read one complete cell, reassembling from carrier chunks.
    async fn read_cell(&mut self) -> Result<Cell> {
        loop {
            if let Some(cell) = self.codec.decode_one(&mut self.inbound)? {
                return Ok(cell);
            }
            let chunk = self.carrier.recv().await?;
            self.inbound.extend_from_slice(&chunk);
        }
    }

    /// Read the next cell addressed to this circuit, skipping link
    /// padding.
    async fn read_circuit_cell(&mut self) -> Result<Cell> {
        loop {
            let cell = self.read_cell().await?;
            match cell.command {
                CellCommand::Padding | CellCommand::Vpadding => continue,
                _ => return Ok(cell),
            }
        }
    }

    /// Process control cells already buffered (no awaiting): used before
    /// EXTEND2 so a queued DESTROY stops us from extending a dead circuit.
    fn drain_buffered_control(&mut self) -> Result<()> {
        while let Ok(Some(chunk)) = self.carrier.try_recv() {
            self.inbound.extend_from_slice(&chunk);
        }
        loop {
            // Peek without consuming more than complete cells.
            let cell = match self.codec.decode_one(&mut self.inbound) {
                Ok(Some(cell)) => cell,
                Ok(None) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            match cell.command {
                CellCommand::Padding | CellCommand::Vpadding => continue,
                CellCommand::Destroy => {
                    let err = destroy_error(&cell);
                    self.state = CircuitState::Closed;
                    self.crypt.wipe();
                    return Err(err);
                }
                other => {
                    // Not ours to interpret here; a control cell this early
                    // is a protocol violation anyway.
                    return Err(TorError::Protocol(format!(
                        "unexpected {other:?} before EXTEND2"
                    )));
                }
            }
        }
    }

    /// Decrypt and decode an inbound RELAY cell; joint recognized/digest
    /// verification happens inside the onion layer.
    fn unwrap_relay(&mut self, cell: &Cell) -> Result<(RelayCell, usize, [u8; 20])> {
        let mut payload: [u8; PAYLOAD_LEN] = cell
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| TorError::Protocol("RELAY cell with short payload".into()))?;

        let recognized = self.crypt.decrypt_backward(&mut payload)?;
        let relay = RelayCell::decode(&payload)?;
        Ok((relay, recognized.hop, recognized.digest))
    }

    /// Pump one inbound cell through the state machine. `Ok(None)` means
    /// the cell was internal (data, SENDME, padding).
    pub(crate) async fn pump_one(&mut self) -> Result<Option<Event>> {
        let outcome = match self.read_cell().await {
            Ok(cell) => self.process_cell(cell).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(ev) => Ok(ev),
            Err(e) => {
                if matches!(e, TorError::Transport(_)) {
                    // The carrier died under us: nothing left to DESTROY.
                    self.state = CircuitState::Closed;
                    self.crypt.wipe();
                    self.streams.close_all();
                } else if e.is_fatal_to_circuit() {
                    self.fail_with_protocol().await;
                }
                Err(e)
            }
        }
    }

    /// The engine's `recv_loop` contract: resolve with the next
    /// user-visible event.
    pub async fn next_event(&mut self) -> Result<Event> {
        loop {
            if let Some(ev) = self.deferred_events.pop_front() {
                return Ok(ev);
            }
            if let Some(ev) = self.pump_one().await? {
                return Ok(ev);
            }
        }
    }

    async fn process_cell(&mut self, cell: Cell) -> Result<Option<Event>> {
        // Link-level cells ride circuit 0; everything else must be ours.
        if cell.circuit_id != 0 && cell.circuit_id != self.id {
            return Err(TorError::Protocol(format!(
                "cell for circuit {:#x} on circuit {:#x}",
                cell.circuit_id, self.id
            )));
        }

        match cell.command {
            CellCommand::Padding | CellCommand::Vpadding => Ok(None),

            CellCommand::Destroy => {
                let reason = cell.payload.first().copied().unwrap_or(0);
                log::warn!(
                    "circuit {:#x}: DESTROY ({})",
                    self.id,
                    TorError::destroy_reason_name(reason)
                );
                self.state = CircuitState::Closed;
                self.crypt.wipe();
                self.streams.close_all();
                Ok(Some(Event::CircuitFailed {
                    circuit_id: self.id,
                    reason: TorError::destroyed(reason),
                }))
            }

            CellCommand::Relay | CellCommand::RelayEarly => {
                let (relay, _hop, digest) = self.unwrap_relay(&cell)?;
                self.dispatch_relay(relay, digest).await
            }

            other => Err(TorError::Protocol(format!(
                "unexpected {other:?} on live circuit"
            ))),
        }
    }

    async fn dispatch_relay(
        &mut self,
        relay: RelayCell,
        digest: [u8; 20],
    ) -> Result<Option<Event>> {
        match relay.command {
            RelayCommand::Data => {
                // Circuit-level accounting covers every DATA cell, even for
                // streams we have already forgotten.
                if let Some(ack) = self.circ_recv.record_received(digest)? {
                    self.send_relay_cell(
                        RelayCell::new(RelayCommand::Sendme, 0, encode_sendme(&ack)),
                        false,
                    )
                    .await?;
                }

                let Some(stream) = self.streams.get_mut(relay.stream_id) else {
                    log::debug!("DATA for unknown stream {}", relay.stream_id);
                    return Ok(None);
                };
                if let Some(ack) = stream.recv_window.record_received(digest)? {
                    let id = relay.stream_id;
                    self.send_relay_cell(
                        RelayCell::new(RelayCommand::Sendme, id, encode_sendme(&ack)),
                        false,
                    )
                    .await?;
                }
                let stream = self
                    .streams
                    .get_mut(relay.stream_id)
                    .expect("stream vanished during dispatch");
                stream.inbound.extend(relay.data);
                Ok(None)
            }

            RelayCommand::Connected => {
                let Some(stream) = self.streams.get_mut(relay.stream_id) else {
                    return Ok(None);
                };
                if stream.state != StreamState::Connecting {
                    return Err(TorError::Protocol(format!(
                        "CONNECTED on stream {} in {:?}",
                        relay.stream_id, stream.state
                    )));
                }
                stream.state = StreamState::Open;
                Ok(Some(Event::StreamOpened {
                    circuit_id: self.id,
                    stream_id: relay.stream_id,
                }))
            }

            RelayCommand::End => {
                let reason = relay.data.first().copied().unwrap_or(0);
                let Some(stream) = self.streams.get_mut(relay.stream_id) else {
                    return Ok(None);
                };
                stream.state = StreamState::Closed;
                stream.end_reason = Some(reason);
                Ok(Some(Event::StreamClosed {
                    circuit_id: self.id,
                    stream_id: relay.stream_id,
                    reason,
                }))
            }

            RelayCommand::Sendme => {
                let ack = parse_sendme(&relay.data)?;
                if relay.stream_id == 0 {
                    self.circ_send.handle_sendme(&ack)?;
                } else if let Some(stream) = self.streams.get_mut(relay.stream_id) {
                    stream.send_window.handle_sendme(&ack)?;
                }
                Ok(None)
            }

            RelayCommand::Truncated => {
                let reason = relay.data.first().copied().unwrap_or(0);
                self.state = CircuitState::Closed;
                self.crypt.wipe();
                self.streams.close_all();
                Ok(Some(Event::CircuitFailed {
                    circuit_id: self.id,
                    reason: TorError::destroyed(reason),
                }))
            }

            RelayCommand::Drop => Ok(None),

            other => Err(TorError::Protocol(format!(
                "unexpected relay command {other:?}"
            ))),
        }
    }

    // ===== Teardown =====

    /// Fatal protocol failure: DESTROY the circuit with reason PROTOCOL.
    async fn fail_with_protocol(&mut self) {
        if matches!(self.state, CircuitState::Closed) {
            return;
        }
        self.state = CircuitState::Closing;
        let cell = Cell::new(
            self.id,
            CellCommand::Destroy,
            vec![DESTROY_REASON_PROTOCOL],
        );
        if let Ok(bytes) = self.codec.encode(&cell) {
            let _ = self.carrier.send(&bytes).await;
        }
        let _ = self.carrier.close().await;
        self.crypt.wipe();
        self.streams.close_all();
        self.state = CircuitState::Closed;
    }

    /// Orderly close: drain streams with END, DESTROY toward the guard,
    /// zeroize. Closing twice is a no-op.
    pub async fn close(&mut self, reason: u8) -> Result<()> {
        match self.state {
            CircuitState::Closed => return Ok(()),
            CircuitState::Closing => return Ok(()),
            _ => {}
        }
        self.state = CircuitState::Closing;

        let open_streams = self.streams.open_ids();
        for stream_id in open_streams {
            let end = RelayCell::new(RelayCommand::End, stream_id, vec![END_REASON_DONE]);
            if self.send_relay_cell(end, false).await.is_err() {
                break;
            }
            if let Some(stream) = self.streams.get_mut(stream_id) {
                stream.state = StreamState::Closed;
                stream.end_reason = Some(END_REASON_DONE);
            }
        }

        let cell = Cell::new(self.id, CellCommand::Destroy, vec![reason]);
        let bytes = self.codec.encode(&cell)?;
        let _ = self.carrier.send(&bytes).await;
        let _ = self.carrier.close().await;

        self.crypt.wipe();
        self.streams.close_all();
        self.state = CircuitState::Closed;
        log::info!("circuit {:#x}: closed", self.id);
        Ok(())
    }
}

fn negotiate_link_version(payload: &[u8]) -> Result<u16> {
    let mut best = 0u16;
    for pair in payload.chunks_exact(2) {
        let version = u16::from_be_bytes([pair[0], pair[1]]);
        if SUPPORTED_LINK_VERSIONS.contains(&version) && version > best {
            best = version;
        }
    }
    if best < 4 {
        return Err(TorError::Protocol(
            "no common link protocol version >= 4".into(),
        ));
    }
    Ok(best)
}

fn destroy_error(cell: &Cell) -> TorError {
    let reason = cell.payload.first().copied().unwrap_or(0);
    TorError::destroyed(reason)
}

/// CREATED2 / EXTENDED2 carry `HLEN(2) | HDATA(HLEN)`.
fn parse_hlen_hdata(payload: &[u8]) -> Result<&[u8]> {
    if payload.len() < 2 {
        return Err(TorError::Protocol("handshake reply too short".into()));
    }
    let hlen = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if payload.len() < 2 + hlen {
        return Err(TorError::Protocol(format!(
            "handshake reply truncated: HLEN={hlen}"
        )));
    }
    Ok(&payload[2..2 + hlen])
}

/// EXTEND2 body: link specifiers (address, legacy identity, Ed25519
/// identity), then the ntor handshake.
fn build_extend2(next: &RelayDescriptor, onionskin: &[u8; NTOR_ONIONSKIN_LEN]) -> Vec<u8> {
    let mut specs: Vec<(u8, Vec<u8>)> = Vec::with_capacity(3);

    match next.address {
        IpAddr::V4(v4) => {
            let mut spec = v4.octets().to_vec();
            spec.extend_from_slice(&next.or_port.to_be_bytes());
            specs.push((0x00, spec));
        }
        IpAddr::V6(v6) => {
            let mut spec = v6.octets().to_vec();
            spec.extend_from_slice(&next.or_port.to_be_bytes());
            specs.push((0x01, spec));
        }
    }
    specs.push((0x02, next.fingerprint.to_vec()));
    if let Some(ed) = next.ed_identity {
        specs.push((0x03, ed.to_vec()));
    }

    let mut body = Vec::with_capacity(64 + NTOR_ONIONSKIN_LEN);
    body.push(specs.len() as u8);
    for (spec_type, spec) in specs {
        body.push(spec_type);
        body.push(spec.len() as u8);
        body.extend_from_slice(&spec);
    }
    body.extend_from_slice(&NTOR_HANDSHAKE_TYPE.to_be_bytes());
    body.extend_from_slice(&(NTOR_ONIONSKIN_LEN as u16).to_be_bytes());
    body.extend_from_slice(onionskin);
    body
}

/// NETINFO from a browser client: we cannot know our outward address, so
/// both sides of the cell carry 0.0.0.0 placeholders.
fn build_netinfo() -> Vec<u8> {
    let mut payload = Vec::with_capacity(16);
    payload.extend_from_slice(&(runtime::now_unix_secs() as u32).to_be_bytes());
    payload.push(0x04); // other address: IPv4
    payload.push(4);
    payload.extend_from_slice(&[0, 0, 0, 0]);
    payload.push(1); // one address of ours
    payload.push(0x04);
    payload.push(4);
    payload.extend_from_slice(&[0, 0, 0, 0]);
    payload
}
