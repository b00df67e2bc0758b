//! Onion-layer cryptography
//!
//! Per-hop AES-128-CTR streams plus running SHA-1 digests over relay
//! payloads. The CTR keystreams are never reset: each hop's cipher state is
//! continuous across the whole circuit lifetime for its direction, which is
//! why trial decryption must stop at the recognizing hop.
//!
//! Digest discipline: digests are updated through a clone that is committed
//! only when a cell is actually sealed (forward) or recognized (backward).
//! An inbound cell that fails the joint recognized/digest check at one hop
//! leaves that hop's digest state untouched.

use crate::error::{Result, TorError};
use crate::protocol::cell::PAYLOAD_LEN;
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes128Ctr = Ctr128BE<Aes128>;

/// Byte range of the digest field inside a relay payload.
const DIGEST_FIELD: std::ops::Range<usize> = 5..9;

/// Byte range of the recognized field inside a relay payload.
const RECOGNIZED_FIELD: std::ops::Range<usize> = 1..3;

/// Key material for one hop, as laid out by the ntor KDF:
/// Df(20) | Db(20) | Kf(16) | Kb(16).
///
/// Zeroized on drop; the circuit additionally wipes it explicitly when a
/// hop is torn down.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    pub forward_digest_seed: [u8; 20],
    pub backward_digest_seed: [u8; 20],
    pub forward_key: [u8; 16],
    pub backward_key: [u8; 16],
}

impl std::fmt::Debug for CircuitKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitKeys").finish_non_exhaustive()
    }
}

impl CircuitKeys {
    /// Split the first 72 bytes of KDF output into this hop's keys.
    pub fn from_kdf_output(okm: &[u8]) -> Self {
        assert!(okm.len() >= 72);
        let mut keys = Self {
            forward_digest_seed: [0; 20],
            backward_digest_seed: [0; 20],
            forward_key: [0; 16],
            backward_key: [0; 16],
        };
        keys.forward_digest_seed.copy_from_slice(&okm[0..20]);
        keys.backward_digest_seed.copy_from_slice(&okm[20..40]);
        keys.forward_key.copy_from_slice(&okm[40..56]);
        keys.backward_key.copy_from_slice(&okm[56..72]);
        keys
    }

    /// True once `zeroize` has run (used by close-path tests).
    pub fn is_wiped(&self) -> bool {
        self.forward_key == [0; 16]
            && self.backward_key == [0; 16]
            && self.forward_digest_seed == [0; 20]
            && self.backward_digest_seed == [0; 20]
    }
}

/// Live crypto state for one hop: both CTR streams and both running
/// digests, seeded from the hop's keys.
pub struct HopCrypto {
    keys: CircuitKeys,
    forward_cipher: Aes128Ctr,
    backward_cipher: Aes128Ctr,
    forward_digest: Sha1,
    backward_digest: Sha1,
}

impl HopCrypto {
    pub fn new(keys: CircuitKeys) -> Self {
        // CTR IVs start at zero; the counter carries all cell-to-cell state.
        let zero_iv = [0u8; 16];
        let forward_cipher = Aes128Ctr::new((&keys.forward_key).into(), (&zero_iv).into());
        let backward_cipher = Aes128Ctr::new((&keys.backward_key).into(), (&zero_iv).into());

        let mut forward_digest = Sha1::new();
        forward_digest.update(keys.forward_digest_seed);
        let mut backward_digest = Sha1::new();
        backward_digest.update(keys.backward_digest_seed);

        Self {
            keys,
            forward_cipher,
            backward_cipher,
            forward_digest,
            backward_digest,
        }
    }

    /// Zero the digest field, commit the payload into the forward running
    /// digest, and patch the 4-byte prefix in. Returns the full 20-byte
    /// digest for the SENDME ledger.
    pub fn seal_forward(&mut self, payload: &mut [u8; PAYLOAD_LEN]) -> [u8; 20] {
        payload[DIGEST_FIELD].fill(0);

        let mut trial = self.forward_digest.clone();
        trial.update(&payload[..]);
        let full = trial.clone().finalize();
        self.forward_digest = trial;

        payload[DIGEST_FIELD].copy_from_slice(&full[..4]);
        let mut digest = [0u8; 20];
        digest.copy_from_slice(&full);
        digest
    }

    /// Apply one forward encryption layer.
    pub fn encrypt_forward(&mut self, payload: &mut [u8]) {
        self.forward_cipher.apply_keystream(payload);
    }

    /// Strip one backward encryption layer.
    pub fn decrypt_backward(&mut self, payload: &mut [u8]) {
        self.backward_cipher.apply_keystream(payload);
    }

    /// Joint recognized/digest check after this hop's layer came off.
    ///
    /// Both conditions must hold together; recognized==0 alone is a
    /// protocol error, not a match. On success the trial digest state is
    /// committed and the full digest returned; on failure nothing changes.
    pub fn try_recognize(&mut self, payload: &[u8; PAYLOAD_LEN]) -> Option<[u8; 20]> {
        if payload[RECOGNIZED_FIELD] != [0, 0] {
            return None;
        }

        let mut scratch = *payload;
        scratch[DIGEST_FIELD].fill(0);

        let mut trial = self.backward_digest.clone();
        trial.update(&scratch[..]);
        let full = trial.clone().finalize();

        if full[..4].ct_eq(&payload[DIGEST_FIELD]).unwrap_u8() != 1 {
            return None;
        }

        self.backward_digest = trial;
        let mut digest = [0u8; 20];
        digest.copy_from_slice(&full);
        Some(digest)
    }

    /// Overwrite this hop's key material with zeros.
    pub fn wipe_keys(&mut self) {
        self.keys.zeroize();
    }

    pub fn keys_wiped(&self) -> bool {
        self.keys.is_wiped()
    }
}

/// The layered view over all hops of one circuit.
pub struct OnionCrypt {
    hops: Vec<HopCrypto>,
}

/// Result of recognizing an inbound relay payload.
pub struct Recognized {
    /// Index of the hop the cell originated from (0 = guard).
    pub hop: usize,
    /// Full 20-byte running digest at this cell, for SENDME validation.
    pub digest: [u8; 20],
}

impl OnionCrypt {
    pub fn new() -> Self {
        Self { hops: Vec::new() }
    }

    pub fn push_hop(&mut self, keys: CircuitKeys) {
        self.hops.push(HopCrypto::new(keys));
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Seal and encrypt an outbound relay payload for `target_hop`
    /// (0-based). The digest is the target's; encryption layers go on from
    /// the target inward to the guard, so the guard strips first.
    ///
    /// Returns the full digest committed at the target hop.
    pub fn encrypt_forward(
        &mut self,
        target_hop: usize,
        payload: &mut [u8; PAYLOAD_LEN],
    ) -> Result<[u8; 20]> {
        if target_hop >= self.hops.len() {
            return Err(TorError::bad_state(format!(
                "encrypt for hop {target_hop} of {}",
                self.hops.len()
            )));
        }

        let digest = self.hops[target_hop].seal_forward(payload);
        for hop in self.hops[..=target_hop].iter_mut().rev() {
            hop.encrypt_forward(&mut payload[..]);
        }
        Ok(digest)
    }

    /// Peel an inbound relay payload hop by hop until one recognizes it.
    ///
    /// Hops are tried in order (guard first), so if two hops would both
    /// match the same cleartext the closer one wins. A cell no hop
    /// recognizes is a fatal protocol error: keystreams are now desynced
    /// and the circuit cannot continue.
    pub fn decrypt_backward(&mut self, payload: &mut [u8; PAYLOAD_LEN]) -> Result<Recognized> {
        for (idx, hop) in self.hops.iter_mut().enumerate() {
            hop.decrypt_backward(&mut payload[..]);
            if let Some(digest) = hop.try_recognize(payload) {
                return Ok(Recognized { hop: idx, digest });
            }
        }
        Err(TorError::DigestMismatch)
    }

    /// Wipe every hop's key material.
    pub fn wipe(&mut self) {
        for hop in &mut self.hops {
            hop.wipe_keys();
        }
    }

    pub fn all_keys_wiped(&self) -> bool {
        self.hops.iter().all(|h| h.keys_wiped())
    }
}

impl Default for OnionCrypt {
    fn default() -> Self {
        Self::new()
    }
}
