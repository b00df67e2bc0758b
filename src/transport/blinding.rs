//! Two-hop bridge blinding
//!
//! Splits client-IP knowledge from guard-IP knowledge across two bridge
//! operators: the client seals the guard's `host:port` under Bridge B's
//! static X25519 key and hands the envelope to Bridge A, which relays the
//! bytes without being able to read them. Bridge B opens the envelope and
//! dials the guard.
//!
//! Envelope: `E (32) | ciphertext | tag (16)` with
//! `key = HKDF-SHA256(shared, salt = E | P_B, info = "bridge-blind-v1")`
//! and AES-256-GCM under the fixed nonce `"bridge-blind"`. The nonce is
//! safe because E is fresh per connection, so (key, nonce) never repeats.

use crate::error::{Result, TorError};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

const HKDF_INFO: &[u8] = b"bridge-blind-v1";
const NONCE: &[u8; 12] = b"bridge-blind";

/// GCM tag length; the envelope must at least hold E plus a tag.
const MIN_ENVELOPE_LEN: usize = 32 + 16;

fn derive_key(shared: &[u8], ephemeral: &[u8; 32], bridge_b: &[u8; 32]) -> Result<[u8; 32]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral);
    salt[32..].copy_from_slice(bridge_b);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .map_err(|_| TorError::Crypto("blinding: HKDF expand failed".into()))?;
    Ok(key)
}

/// Seal the guard address for Bridge B. Returns the raw envelope bytes.
pub fn seal_guard_addr(guard_addr: &str, bridge_b_pubkey: &[u8; 32]) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);

    let bridge_b = PublicKey::from(*bridge_b_pubkey);
    let shared = ephemeral.diffie_hellman(&bridge_b);
    if !shared.was_contributory() {
        return Err(TorError::Crypto("blinding: degenerate bridge key".into()));
    }

    let key = derive_key(shared.as_bytes(), ephemeral_pub.as_bytes(), bridge_b_pubkey)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| TorError::Crypto("blinding: AES key init failed".into()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(NONCE), guard_addr.as_bytes())
        .map_err(|_| TorError::Crypto("blinding: GCM seal failed".into()))?;

    let mut envelope = Vec::with_capacity(32 + ciphertext.len());
    envelope.extend_from_slice(ephemeral_pub.as_bytes());
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Seal and base64url-encode, the form carried as a subprotocol/query
/// parameter to Bridge A.
pub fn seal_guard_addr_b64(guard_addr: &str, bridge_b_pubkey: &[u8; 32]) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(seal_guard_addr(guard_addr, bridge_b_pubkey)?))
}

/// Bridge B's side: open an envelope with the static secret key. Also
/// exercised by tests as the correctness oracle.
pub fn open_guard_addr(envelope: &[u8], bridge_b_secret: &StaticSecret) -> Result<String> {
    if envelope.len() < MIN_ENVELOPE_LEN {
        return Err(TorError::Crypto(format!(
            "blinding: envelope of {} bytes too short",
            envelope.len()
        )));
    }

    let mut ephemeral_bytes = [0u8; 32];
    ephemeral_bytes.copy_from_slice(&envelope[..32]);
    let ephemeral_pub = PublicKey::from(ephemeral_bytes);

    let bridge_b_pub = PublicKey::from(bridge_b_secret);
    let shared = bridge_b_secret.diffie_hellman(&ephemeral_pub);

    let key = derive_key(
        shared.as_bytes(),
        &ephemeral_bytes,
        bridge_b_pub.as_bytes(),
    )?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| TorError::Crypto("blinding: AES key init failed".into()))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(NONCE), &envelope[32..])
        .map_err(|_| TorError::Crypto("blinding: GCM open failed".into()))?;

    String::from_utf8(plaintext).map_err(|_| TorError::Crypto("blinding: not UTF-8".into()))
}

/// Open the base64url form.
pub fn open_guard_addr_b64(envelope_b64: &str, bridge_b_secret: &StaticSecret) -> Result<String> {
    let envelope = URL_SAFE_NO_PAD
        .decode(envelope_b64)
        .map_err(|e| TorError::Crypto(format!("blinding: bad base64: {e}")))?;
    open_guard_addr(&envelope, bridge_b_secret)
}
