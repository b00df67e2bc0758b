//! ntor circuit-creation handshake (Proposal 216)
//!
//! X25519-based one-way authenticated key exchange. The client sends
//! `ID | B | X` (84 bytes) in CREATE2/EXTEND2; the relay answers
//! `Y | AUTH` (64 bytes) in CREATED2/EXTENDED2. Both sides derive the
//! per-hop key material with HKDF-SHA256.
//!
//! AUTH verification is constant-time; a failure aborts the circuit and
//! blacklists the relay for the rest of the bootstrap.

use crate::error::{Result, TorError};
use crate::protocol::onion::CircuitKeys;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

type HmacSha256 = Hmac<Sha256>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// ntor handshake type in CREATE2/EXTEND2.
pub const NTOR_HANDSHAKE_TYPE: u16 = 2;

/// Client onionskin: ID(20) | B(32) | X(32).
pub const NTOR_ONIONSKIN_LEN: usize = 84;

/// Relay reply: Y(32) | AUTH(32).
pub const NTOR_REPLY_LEN: usize = 64;

/// HKDF output width: Df(20) Db(20) Kf(16) Kb(16) plus 20 unused bytes.
const KDF_OUT_LEN: usize = 92;

/// In-flight client side of one ntor handshake.
///
/// The ephemeral secret is used for two DH operations on completion, so it
/// is held as a `StaticSecret` (which zeroizes itself on drop).
pub struct NtorClient {
    secret: StaticSecret,
    public: PublicKey,
    relay_id: [u8; 20],
    relay_onion_key: PublicKey,
}

impl NtorClient {
    /// Start a handshake toward a relay, returning the state to keep and
    /// the 84-byte onionskin to put in CREATE2/EXTEND2.
    pub fn start(relay_id: [u8; 20], relay_onion_key: [u8; 32]) -> (Self, [u8; NTOR_ONIONSKIN_LEN]) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let relay_onion_key = PublicKey::from(relay_onion_key);

        let mut onionskin = [0u8; NTOR_ONIONSKIN_LEN];
        onionskin[..20].copy_from_slice(&relay_id);
        onionskin[20..52].copy_from_slice(relay_onion_key.as_bytes());
        onionskin[52..84].copy_from_slice(public.as_bytes());

        (
            Self {
                secret,
                public,
                relay_id,
                relay_onion_key,
            },
            onionskin,
        )
    }

    /// The client's ephemeral public key X.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Complete the handshake with the relay's `Y | AUTH` reply and derive
    /// this hop's keys.
    pub fn finish(self, reply: &[u8]) -> Result<CircuitKeys> {
        if reply.len() < NTOR_REPLY_LEN {
            return Err(TorError::Protocol(format!(
                "ntor reply too short: {} bytes",
                reply.len()
            )));
        }

        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&reply[..32]);
        let server_public = PublicKey::from(y_bytes);
        let server_auth = &reply[32..64];

        // EXP(Y,x) and EXP(B,x). A low-order peer point yields an
        // all-zero shared secret; treat it as a decompression failure.
        let xy = self.secret.diffie_hellman(&server_public);
        let xb = self.secret.diffie_hellman(&self.relay_onion_key);
        if !xy.was_contributory() || !xb.was_contributory() {
            return Err(TorError::Crypto("ntor: low-order peer point".into()));
        }

        // secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
        let mut secret_input = Vec::with_capacity(32 * 4 + 20 + 32 + PROTOID.len());
        secret_input.extend_from_slice(xy.as_bytes());
        secret_input.extend_from_slice(xb.as_bytes());
        secret_input.extend_from_slice(&self.relay_id);
        secret_input.extend_from_slice(self.relay_onion_key.as_bytes());
        secret_input.extend_from_slice(self.public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let verify = hmac_over(T_VERIFY, &secret_input);

        // auth_input = verify | ID | B | Y | X | PROTOID | "Server"
        let mut auth_input = Vec::with_capacity(32 + 20 + 32 * 3 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.relay_id);
        auth_input.extend_from_slice(self.relay_onion_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let computed_auth = hmac_over(T_MAC, &auth_input);

        if computed_auth[..32].ct_eq(server_auth).unwrap_u8() != 1 {
            log::warn!("ntor AUTH mismatch from relay {}", hex::encode(self.relay_id));
            return Err(TorError::AuthMismatch);
        }

        let key_seed = hmac_over(T_KEY, &secret_input);
        expand_keys(&key_seed)
    }
}

fn hmac_over(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let out = mac.finalize().into_bytes();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&out);
    bytes
}

/// Expand KEY_SEED into per-hop keys.
///
/// 92 bytes of output, split Df(20) | Db(20) | Kf(16) | Kb(16); the final
/// 20 bytes are reserved by the KDF layout and unused by the client.
pub fn expand_keys(key_seed: &[u8; 32]) -> Result<CircuitKeys> {
    use hkdf::Hkdf;

    // KEY_SEED is already pseudorandom (an HMAC output), so it is used as
    // the PRK directly, skipping HKDF-Extract.
    let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
        .map_err(|_| TorError::Crypto("ntor: invalid PRK length".into()))?;

    let mut okm = [0u8; KDF_OUT_LEN];
    hkdf.expand(M_EXPAND, &mut okm)
        .map_err(|_| TorError::Crypto("ntor: key expansion failed".into()))?;

    Ok(CircuitKeys::from_kdf_output(&okm[..72]))
}
