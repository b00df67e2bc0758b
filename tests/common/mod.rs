//! Test harness: an in-memory carrier wired to an honest relay chain.
//!
//! `SimNetwork` plays the guard, middle, and exit of one circuit behind a
//! single byte stream, with real server-side ntor, per-hop AES-CTR
//! layers, running digests, and SENDME accounting. Fault injection knobs
//! cover the destroy/corruption scenarios.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use ed25519_dalek::{Signer, SigningKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::Sha256;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::rc::Rc;
use webtor::consensus::{ExitPolicySummary, RelayDescriptor, RelayFlags};
use webtor::error::{Result, TorError};
use webtor::protocol::cell::{Cell, CellCodec, CellCommand, RelayCell, RelayCommand, PAYLOAD_LEN};
use webtor::transport::{BridgeEndpoint, Carrier, CarrierConnector, CarrierKind};
use x25519_dalek::{PublicKey, StaticSecret};

type HmacSha256 = Hmac<Sha256>;
type Aes128Ctr = Ctr128BE<Aes128>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Static identity of one simulated relay.
pub struct SimRelayDef {
    pub nickname: String,
    pub fingerprint: [u8; 20],
    pub identity: SigningKey,
    pub ntor_secret: StaticSecret,
    pub address: IpAddr,
    pub or_port: u16,
}

impl SimRelayDef {
    pub fn new(tag: u8, nickname: &str) -> Self {
        Self {
            nickname: nickname.to_string(),
            fingerprint: [tag; 20],
            identity: SigningKey::from_bytes(&[tag; 32]),
            ntor_secret: StaticSecret::from([tag.wrapping_add(100); 32]),
            address: format!("10.{tag}.0.1").parse().unwrap(),
            or_port: 9001,
        }
    }

    /// The consensus descriptor matching this simulated relay.
    pub fn descriptor(&self, guard: bool, exit: bool) -> RelayDescriptor {
        RelayDescriptor {
            nickname: self.nickname.clone(),
            fingerprint: self.fingerprint,
            ed_identity: Some(self.identity.verifying_key().to_bytes()),
            ntor_onion_key: PublicKey::from(&self.ntor_secret).to_bytes(),
            address: self.address,
            or_port: self.or_port,
            flags: RelayFlags {
                guard,
                exit,
                // The exit stays out of the middle pool so path selection
                // over this tiny consensus is deterministic.
                fast: !exit,
                stable: true,
                running: true,
                valid: true,
                bad_exit: false,
            },
            bandwidth: 10_000,
            family: Vec::new(),
            exit_policy: exit.then(|| ExitPolicySummary::parse("accept 80,443").unwrap()),
        }
    }
}

fn hmac_over(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("any key length");
    mac.update(data);
    let out = mac.finalize().into_bytes();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&out);
    bytes
}

/// Live crypto state of one hop, relay side.
struct SimHop {
    /// Strips client→relay layers (client's forward key).
    fwd_cipher: Aes128Ctr,
    /// Adds relay→client layers (client's backward key).
    bwd_cipher: Aes128Ctr,
    fwd_digest: Sha1,
    bwd_digest: Sha1,
}

impl SimHop {
    fn from_key_seed(key_seed: &[u8; 32]) -> Self {
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed).expect("prk length");
        let mut okm = [0u8; 92];
        hkdf.expand(M_EXPAND, &mut okm).expect("expand");

        let zero_iv = [0u8; 16];
        let mut fwd_digest = Sha1::new();
        fwd_digest.update(&okm[0..20]);
        let mut bwd_digest = Sha1::new();
        bwd_digest.update(&okm[20..40]);

        let fwd_key: [u8; 16] = okm[40..56].try_into().unwrap();
        let bwd_key: [u8; 16] = okm[56..72].try_into().unwrap();
        Self {
            fwd_cipher: Aes128Ctr::new((&fwd_key).into(), (&zero_iv).into()),
            bwd_cipher: Aes128Ctr::new((&bwd_key).into(), (&zero_iv).into()),
            fwd_digest,
            bwd_digest,
        }
    }

    fn strip(&mut self, payload: &mut [u8; PAYLOAD_LEN]) {
        self.fwd_cipher.apply_keystream(&mut payload[..]);
    }

    /// Joint recognized/digest check after this hop's layer is off.
    fn try_recognize(&mut self, payload: &[u8; PAYLOAD_LEN]) -> Option<[u8; 20]> {
        if payload[1..3] != [0, 0] {
            return None;
        }
        let mut scratch = *payload;
        scratch[5..9].fill(0);
        let mut trial = self.fwd_digest.clone();
        trial.update(&scratch[..]);
        let full = trial.clone().finalize();
        if full[..4] != payload[5..9] {
            return None;
        }
        self.fwd_digest = trial;
        let mut digest = [0u8; 20];
        digest.copy_from_slice(&full);
        Some(digest)
    }

    /// Seal an outbound relay payload with the backward digest. The
    /// caller then wraps the outer layers.
    fn seal(&mut self, payload: &mut [u8; PAYLOAD_LEN]) -> [u8; 20] {
        payload[5..9].fill(0);
        self.bwd_digest.update(&payload[..]);
        let full = self.bwd_digest.clone().finalize();
        payload[5..9].copy_from_slice(&full[..4]);
        let mut digest = [0u8; 20];
        digest.copy_from_slice(&full);
        digest
    }
}

/// Per-stream receiver accounting on the exit side.
struct SimStream {
    received: Vec<u8>,
    unacked: u16,
    open: bool,
    responded: bool,
}

/// The relay chain behind one carrier.
pub struct SimNetwork {
    relays: Vec<SimRelayDef>,
    hops: Vec<SimHop>,
    codec: CellCodec,
    inbuf: Vec<u8>,
    out: VecDeque<Vec<u8>>,
    circuit_id: Option<u32>,

    streams: HashMap<u16, SimStream>,
    circuit_unacked: u16,
    /// Ledger of fwd digests at every 50th/100th data cell, for SENDMEs.
    last_digest: [u8; 20],

    // ==== fault injection & scripting ====
    /// Queue a DESTROY with this reason right after CREATED2.
    pub destroy_after_create: Option<u8>,
    /// Flip a byte in the next DATA cell sent to the client.
    pub corrupt_next_send: bool,
    /// Reply to a completed request (one ending in CRLFCRLF) with this.
    pub canned_response: Option<Vec<u8>>,

    // ==== observability ====
    pub extend2_seen: usize,
    pub begin_seen: usize,
    pub destroyed_by_client: Option<u8>,
    pub sendme_digest_mismatches: usize,
    pub closed: bool,
}

impl SimNetwork {
    pub fn new(relays: Vec<SimRelayDef>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            relays,
            hops: Vec::new(),
            codec: CellCodec::new(),
            inbuf: Vec::new(),
            out: VecDeque::new(),
            circuit_id: None,
            streams: HashMap::new(),
            circuit_unacked: 0,
            last_digest: [0; 20],
            destroy_after_create: None,
            corrupt_next_send: false,
            canned_response: None,
            extend2_seen: 0,
            begin_seen: 0,
            destroyed_by_client: None,
            sendme_digest_mismatches: 0,
            closed: false,
        }))
    }

    /// A standard guard/middle/exit chain.
    pub fn three_relays() -> Vec<SimRelayDef> {
        vec![
            SimRelayDef::new(1, "SimGuard"),
            SimRelayDef::new(2, "SimMiddle"),
            SimRelayDef::new(3, "SimExit"),
        ]
    }

    pub fn stream_bytes(&self, stream_id: u16) -> Vec<u8> {
        self.streams
            .get(&stream_id)
            .map(|s| s.received.clone())
            .unwrap_or_default()
    }

    fn push_cell(&mut self, cell: Cell) {
        let bytes = self.codec.encode(&cell).expect("sim encode");
        self.out.push_back(bytes);
    }

    /// Bytes from the client: parse cells and react.
    pub fn ingest(&mut self, bytes: &[u8]) {
        self.inbuf.extend_from_slice(bytes);
        loop {
            let cell = match self.codec.decode_one(&mut self.inbuf) {
                Ok(Some(cell)) => cell,
                Ok(None) => return,
                Err(e) => panic!("sim: undecodable client bytes: {e}"),
            };
            self.handle_cell(cell);
        }
    }

    fn handle_cell(&mut self, cell: Cell) {
        match cell.command {
            CellCommand::Versions => self.handle_versions(),
            CellCommand::Netinfo => {}
            CellCommand::Padding | CellCommand::Vpadding => {}
            CellCommand::Create2 => self.handle_create2(cell),
            CellCommand::Relay | CellCommand::RelayEarly => self.handle_relay(cell),
            CellCommand::Destroy => {
                self.destroyed_by_client = Some(cell.payload.first().copied().unwrap_or(0));
                self.closed = true;
            }
            other => panic!("sim: unexpected {other:?} from client"),
        }
    }

    fn handle_versions(&mut self) {
        // VERSIONS reply still in the narrow framing, then v4 cells.
        self.push_cell(Cell::new(0, CellCommand::Versions, vec![0, 4, 0, 5]));
        self.codec.set_link_version(4);

        // CERTS: an Ed25519 signing-key certificate from the guard.
        let guard = &self.relays[0];
        let cert = make_ed_cert(&guard.identity, 4, [9u8; 32]);
        let mut certs_payload = vec![1u8, 4];
        certs_payload.extend_from_slice(&(cert.len() as u16).to_be_bytes());
        certs_payload.extend_from_slice(&cert);
        self.push_cell(Cell::new(0, CellCommand::Certs, certs_payload));

        self.push_cell(Cell::new(0, CellCommand::AuthChallenge, vec![0u8; 38]));
        self.push_cell(Cell::new(0, CellCommand::Netinfo, vec![0u8; 12]));
    }

    fn handle_create2(&mut self, cell: Cell) {
        assert!(self.hops.is_empty(), "sim: CREATE2 on built circuit");
        self.circuit_id = Some(cell.circuit_id);

        let htype = u16::from_be_bytes([cell.payload[0], cell.payload[1]]);
        let hlen = u16::from_be_bytes([cell.payload[2], cell.payload[3]]) as usize;
        assert_eq!(htype, 2, "sim: non-ntor CREATE2");
        assert_eq!(hlen, 84);
        let onionskin: [u8; 84] = cell.payload[4..4 + 84].try_into().unwrap();

        let (reply, hop) = self.ntor_respond(0, &onionskin);
        self.hops.push(hop);

        let mut payload = Vec::with_capacity(2 + 64);
        payload.extend_from_slice(&64u16.to_be_bytes());
        payload.extend_from_slice(&reply);
        self.push_cell(Cell::new(cell.circuit_id, CellCommand::Created2, payload));

        if let Some(reason) = self.destroy_after_create.take() {
            self.push_cell(Cell::new(cell.circuit_id, CellCommand::Destroy, vec![reason]));
        }
    }

    /// Server side of ntor for relay index `idx`.
    fn ntor_respond(&mut self, idx: usize, onionskin: &[u8; 84]) -> ([u8; 64], SimHop) {
        let relay = &self.relays[idx];
        assert_eq!(&onionskin[..20], &relay.fingerprint, "sim: wrong relay id");
        let b_public = PublicKey::from(&relay.ntor_secret);
        assert_eq!(&onionskin[20..52], b_public.as_bytes(), "sim: wrong onion key");

        let x_bytes: [u8; 32] = onionskin[52..84].try_into().unwrap();
        let client_public = PublicKey::from(x_bytes);

        let y_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let y_public = PublicKey::from(&y_secret);

        let xy = y_secret.diffie_hellman(&client_public);
        let xb = relay.ntor_secret.diffie_hellman(&client_public);

        let mut secret_input = Vec::new();
        secret_input.extend_from_slice(xy.as_bytes());
        secret_input.extend_from_slice(xb.as_bytes());
        secret_input.extend_from_slice(&relay.fingerprint);
        secret_input.extend_from_slice(b_public.as_bytes());
        secret_input.extend_from_slice(client_public.as_bytes());
        secret_input.extend_from_slice(y_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let verify = hmac_over(T_VERIFY, &secret_input);
        let mut auth_input = Vec::new();
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&relay.fingerprint);
        auth_input.extend_from_slice(b_public.as_bytes());
        auth_input.extend_from_slice(y_public.as_bytes());
        auth_input.extend_from_slice(client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");
        let auth = hmac_over(T_MAC, &auth_input);

        let mut reply = [0u8; 64];
        reply[..32].copy_from_slice(y_public.as_bytes());
        reply[32..].copy_from_slice(&auth);

        let key_seed = hmac_over(T_KEY, &secret_input);
        (reply, SimHop::from_key_seed(&key_seed))
    }

    fn handle_relay(&mut self, cell: Cell) {
        let mut payload: [u8; PAYLOAD_LEN] = cell.payload.as_slice().try_into().expect("509");

        // Strip layers inward until a hop recognizes the cell.
        let mut owner = None;
        for idx in 0..self.hops.len() {
            self.hops[idx].strip(&mut payload);
            if let Some(digest) = self.hops[idx].try_recognize(&payload) {
                owner = Some((idx, digest));
                break;
            }
        }
        let Some((hop_idx, digest)) = owner else {
            panic!("sim: relay cell recognized by no hop");
        };

        let relay = RelayCell::decode(&payload).expect("sim relay decode");
        match relay.command {
            RelayCommand::Extend2 => self.handle_extend2(hop_idx, relay),
            RelayCommand::Begin => self.handle_begin(hop_idx, relay),
            RelayCommand::Data => self.handle_data(hop_idx, relay, digest),
            RelayCommand::End => {
                if let Some(stream) = self.streams.get_mut(&relay.stream_id) {
                    stream.open = false;
                }
            }
            RelayCommand::Sendme => self.handle_client_sendme(relay),
            other => panic!("sim: unexpected relay {other:?}"),
        }
    }

    fn handle_extend2(&mut self, hop_idx: usize, relay: RelayCell) {
        assert_eq!(
            hop_idx,
            self.hops.len() - 1,
            "sim: EXTEND2 not addressed to path end"
        );
        self.extend2_seen += 1;

        // Parse link specifiers, find the legacy identity.
        let body = &relay.data;
        let nspec = body[0] as usize;
        let mut off = 1;
        let mut legacy_id = None;
        for _ in 0..nspec {
            let spec_type = body[off];
            let len = body[off + 1] as usize;
            let value = &body[off + 2..off + 2 + len];
            if spec_type == 0x02 {
                legacy_id = Some(<[u8; 20]>::try_from(value).unwrap());
            }
            off += 2 + len;
        }
        let legacy_id = legacy_id.expect("sim: EXTEND2 without legacy id");

        let htype = u16::from_be_bytes([body[off], body[off + 1]]);
        let hlen = u16::from_be_bytes([body[off + 2], body[off + 3]]) as usize;
        assert_eq!(htype, 2);
        assert_eq!(hlen, 84);
        let onionskin: [u8; 84] = body[off + 4..off + 4 + 84].try_into().unwrap();

        let next_idx = self.hops.len();
        assert_eq!(
            legacy_id, self.relays[next_idx].fingerprint,
            "sim: EXTEND2 to unexpected relay"
        );

        let (reply, hop) = self.ntor_respond(next_idx, &onionskin);
        self.hops.push(hop);

        let mut data = Vec::with_capacity(2 + 64);
        data.extend_from_slice(&64u16.to_be_bytes());
        data.extend_from_slice(&reply);
        self.send_relay_from(hop_idx, RelayCell::new(RelayCommand::Extended2, 0, data));
    }

    fn handle_begin(&mut self, hop_idx: usize, relay: RelayCell) {
        assert_eq!(hop_idx, self.hops.len() - 1, "sim: BEGIN not at exit");
        self.begin_seen += 1;

        let nul = relay
            .data
            .iter()
            .position(|&b| b == 0)
            .expect("sim: BEGIN without NUL");
        let target = String::from_utf8_lossy(&relay.data[..nul]).to_string();
        assert!(target.contains(':'), "sim: BEGIN target {target:?}");
        // 4-byte flags follow the NUL
        assert!(relay.data.len() >= nul + 5, "sim: BEGIN missing flags");

        self.streams.insert(
            relay.stream_id,
            SimStream {
                received: Vec::new(),
                unacked: 0,
                open: true,
                responded: false,
            },
        );
        self.send_relay_from(
            hop_idx,
            RelayCell::new(RelayCommand::Connected, relay.stream_id, Vec::new()),
        );
    }

    fn handle_data(&mut self, hop_idx: usize, relay: RelayCell, digest: [u8; 20]) {
        assert_eq!(hop_idx, self.hops.len() - 1, "sim: DATA not at exit");
        self.last_digest = digest;
        self.circuit_unacked += 1;

        let stream_id = relay.stream_id;
        {
            let stream = self
                .streams
                .get_mut(&stream_id)
                .expect("sim: DATA for unknown stream");
            if !stream.open {
                return;
            }
            stream.received.extend_from_slice(&relay.data);
            stream.unacked += 1;
        }

        // Stream-level SENDME every 50 cells.
        if self.streams[&stream_id].unacked >= 50 {
            self.streams.get_mut(&stream_id).unwrap().unacked = 0;
            let body = sendme_body(&digest);
            self.send_relay_from(
                hop_idx,
                RelayCell::new(RelayCommand::Sendme, stream_id, body),
            );
        }
        // Circuit-level SENDME every 100 cells.
        if self.circuit_unacked >= 100 {
            self.circuit_unacked = 0;
            let body = sendme_body(&digest);
            self.send_relay_from(hop_idx, RelayCell::new(RelayCommand::Sendme, 0, body));
        }

        // Scripted response once the request looks complete.
        let done = self.streams[&stream_id]
            .received
            .windows(4)
            .any(|w| w == b"\r\n\r\n");
        if done && !self.streams[&stream_id].responded {
            if let Some(response) = self.canned_response.clone() {
                self.streams.get_mut(&stream_id).unwrap().responded = true;
                for chunk in response.chunks(498) {
                    self.send_relay_from(
                        hop_idx,
                        RelayCell::new(RelayCommand::Data, stream_id, chunk.to_vec()),
                    );
                }
                self.send_relay_from(
                    hop_idx,
                    RelayCell::new(RelayCommand::End, stream_id, vec![6]),
                );
            }
        }
    }

    fn handle_client_sendme(&mut self, relay: RelayCell) {
        // v1: version, length, 20-byte digest. The digest must echo one of
        // the digests this side recently sealed into outbound DATA; the
        // harness only checks shape and version.
        if relay.data.len() < 23 || relay.data[0] != 1 {
            self.sendme_digest_mismatches += 1;
        }
    }

    /// Seal at `hop_idx` and wrap the outer backward layers, then queue.
    fn send_relay_from(&mut self, hop_idx: usize, relay: RelayCell) {
        let mut payload = relay.encode().expect("sim encode relay");
        self.hops[hop_idx].seal(&mut payload);
        for idx in (0..=hop_idx).rev() {
            self.hops[idx].bwd_cipher.apply_keystream(&mut payload[..]);
        }

        let mut bytes = self
            .codec
            .encode(&Cell::relay(self.circuit_id.unwrap(), payload.to_vec()))
            .expect("sim encode cell");

        if self.corrupt_next_send {
            self.corrupt_next_send = false;
            // Flip a byte well inside the encrypted relay payload.
            bytes[5 + 20] ^= 0x01;
        }
        self.out.push_back(bytes);
    }
}

fn sendme_body(digest: &[u8; 20]) -> Vec<u8> {
    let mut body = Vec::with_capacity(23);
    body.push(1);
    body.extend_from_slice(&20u16.to_be_bytes());
    body.extend_from_slice(digest);
    body
}

/// Build a tor-cert signed by `signer`.
fn make_ed_cert(signer: &SigningKey, cert_type: u8, certified: [u8; 32]) -> Vec<u8> {
    let mut body = vec![0x01, cert_type];
    // expiration far in the future (hours since epoch)
    body.extend_from_slice(&u32::MAX.to_be_bytes());
    body.push(0x01);
    body.extend_from_slice(&certified);
    body.push(0);
    let sig = signer.sign(&body);
    body.extend_from_slice(&sig.to_bytes());
    body
}

/// Carrier wired straight into a `SimNetwork`.
pub struct LoopCarrier {
    sim: Rc<RefCell<SimNetwork>>,
}

impl LoopCarrier {
    pub fn new(sim: Rc<RefCell<SimNetwork>>) -> Self {
        Self { sim }
    }
}

#[async_trait::async_trait(?Send)]
impl Carrier for LoopCarrier {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let mut sim = self.sim.borrow_mut();
        if sim.closed {
            return Err(TorError::Transport("sim: link closed".into()));
        }
        sim.ingest(bytes);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        let mut sim = self.sim.borrow_mut();
        match sim.out.pop_front() {
            Some(bytes) => Ok(bytes),
            None => Err(TorError::Transport("sim: no bytes pending".into())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.sim.borrow_mut().closed = true;
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.sim.borrow_mut().out.pop_front())
    }
}

/// Connector that hands out `LoopCarrier`s to one shared simulator.
pub struct SimConnector {
    pub kind: CarrierKind,
    pub sim: Rc<RefCell<SimNetwork>>,
}

#[async_trait::async_trait(?Send)]
impl CarrierConnector for SimConnector {
    fn kind(&self) -> CarrierKind {
        self.kind
    }

    async fn connect(&self, _endpoint: &BridgeEndpoint) -> Result<Box<dyn Carrier>> {
        Ok(Box::new(LoopCarrier::new(self.sim.clone())))
    }
}

/// Connector whose carriers die immediately (scenario: server closes
/// within seconds of open, no cell delivered).
pub struct DeadConnector {
    pub kind: CarrierKind,
}

struct DeadCarrier;

#[async_trait::async_trait(?Send)]
impl Carrier for DeadCarrier {
    async fn send(&mut self, _bytes: &[u8]) -> Result<()> {
        Err(TorError::Transport("connection reset".into()))
    }
    async fn recv(&mut self) -> Result<Vec<u8>> {
        Err(TorError::Transport("connection reset".into()))
    }
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait(?Send)]
impl CarrierConnector for DeadConnector {
    fn kind(&self) -> CarrierKind {
        self.kind
    }

    async fn connect(&self, _endpoint: &BridgeEndpoint) -> Result<Box<dyn Carrier>> {
        Ok(Box::new(DeadCarrier))
    }
}

/// The consensus text matching `SimNetwork::three_relays`, as the bridge
/// would serve it.
pub fn sim_consensus_text() -> String {
    let relays = SimNetwork::three_relays();
    let mut text = String::from("valid-after 9999999999\nfresh-until 10000003599\n");
    for (idx, relay) in relays.iter().enumerate() {
        let descriptor = relay.descriptor(idx == 0, idx == 2);
        text.push_str(&format!(
            "r {} {} x x {} {}\n",
            descriptor.nickname,
            hex::encode(descriptor.fingerprint),
            descriptor.address,
            descriptor.or_port,
        ));
        let mut flags = String::from("s Running Stable Valid");
        if descriptor.flags.fast {
            flags.push_str(" Fast");
        }
        if descriptor.flags.guard {
            flags.push_str(" Guard");
        }
        if descriptor.flags.exit {
            flags.push_str(" Exit");
        }
        text.push_str(&flags);
        text.push('\n');
        text.push_str("w Bandwidth=10000\n");
        text.push_str(&format!(
            "ntor-onion-key {}\n",
            hex::encode(descriptor.ntor_onion_key)
        ));
        text.push_str(&format!(
            "id ed25519 {}\n",
            hex::encode(descriptor.ed_identity.unwrap())
        ));
        if descriptor.flags.exit {
            text.push_str("p accept 80,443\n");
        }
    }
    text
}
