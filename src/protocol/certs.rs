//! CERTS cell handling for link setup
//!
//! During link negotiation the relay presents a CERTS cell. The client
//! needs two things from it: the relay's Ed25519 identity, and evidence
//! that the signing key presented on this link is certified by that
//! identity (tor-cert format, cert type 4).
//!
//! RSA-chain certificate types are carried opaquely; this client never
//! validates the legacy RSA chain (the 20-byte fingerprint pins identity
//! at the path-selection layer instead).

use crate::error::{Result, TorError};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// tor-cert: Ed25519 signing key certified by the Ed25519 identity.
pub const CERT_TYPE_ED_SIGNING: u8 = 4;

/// tor-cert: TLS link certificate digest, certified by the signing key.
pub const CERT_TYPE_ED_LINK: u8 = 5;

/// Cross-certificate: Ed25519 identity signed by the RSA identity.
pub const CERT_TYPE_RSA_ED_CROSS: u8 = 7;

/// One entry of a CERTS cell, still opaque.
#[derive(Debug, Clone)]
pub struct RawCert {
    pub cert_type: u8,
    pub body: Vec<u8>,
}

/// A parsed CERTS cell.
#[derive(Debug, Clone, Default)]
pub struct CertsCell {
    pub certs: Vec<RawCert>,
}

impl CertsCell {
    /// Parse the CERTS payload: N(1), then N × (type(1) | len(2) | body).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(TorError::Protocol("empty CERTS cell".into()));
        }

        let count = payload[0] as usize;
        let mut certs = Vec::with_capacity(count);
        let mut off = 1;

        for _ in 0..count {
            if off + 3 > payload.len() {
                return Err(TorError::Protocol("CERTS entry header truncated".into()));
            }
            let cert_type = payload[off];
            let len = u16::from_be_bytes([payload[off + 1], payload[off + 2]]) as usize;
            off += 3;
            if off + len > payload.len() {
                return Err(TorError::Protocol("CERTS entry body truncated".into()));
            }
            certs.push(RawCert {
                cert_type,
                body: payload[off..off + len].to_vec(),
            });
            off += len;
        }

        Ok(Self { certs })
    }

    pub fn find(&self, cert_type: u8) -> Option<&RawCert> {
        self.certs.iter().find(|c| c.cert_type == cert_type)
    }

    /// Structural check when no identity is pinned: the cell must at least
    /// carry a well-formed signing-key certificate.
    pub fn quick_check(&self) -> Result<()> {
        let raw = self
            .find(CERT_TYPE_ED_SIGNING)
            .ok_or_else(|| TorError::Protocol("CERTS missing signing-key cert".into()))?;
        EdCert::parse(&raw.body)?;
        Ok(())
    }

    /// Verify the signing-key certificate against the relay's Ed25519
    /// identity from the consensus, and return the certified signing key.
    pub fn verify_signing_key(&self, identity: &[u8; 32], now_unix: u64) -> Result<[u8; 32]> {
        let raw = self
            .find(CERT_TYPE_ED_SIGNING)
            .ok_or_else(|| TorError::Protocol("CERTS missing signing-key cert".into()))?;
        let cert = EdCert::parse(&raw.body)?;

        if cert.expired_at(now_unix) {
            return Err(TorError::Crypto("link signing certificate expired".into()));
        }
        cert.verify_signed_by(identity)?;
        Ok(cert.certified_key)
    }
}

/// The tor-cert wire format: version(1)=1, cert_type(1), expiration(4,
/// hours since epoch), key_type(1), certified_key(32), n_extensions(1),
/// extensions, signature(64) over everything before it.
#[derive(Debug, Clone)]
pub struct EdCert {
    pub cert_type: u8,
    pub expiration_hours: u32,
    pub certified_key: [u8; 32],
    signed_body: Vec<u8>,
    signature: [u8; 64],
}

impl EdCert {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 104 {
            return Err(TorError::Protocol(format!(
                "tor-cert too short: {} bytes",
                data.len()
            )));
        }
        if data[0] != 0x01 {
            return Err(TorError::Protocol(format!(
                "unknown tor-cert version {}",
                data[0]
            )));
        }

        let cert_type = data[1];
        let expiration_hours = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let mut certified_key = [0u8; 32];
        certified_key.copy_from_slice(&data[7..39]);

        // Walk extensions: len(2) | type(1) | flags(1) | body(len).
        let n_extensions = data[39];
        let mut off = 40;
        for _ in 0..n_extensions {
            if off + 4 > data.len() {
                return Err(TorError::Protocol("tor-cert extension truncated".into()));
            }
            let ext_len = u16::from_be_bytes([data[off], data[off + 1]]) as usize;
            off += 4 + ext_len;
        }

        if data.len() < off + 64 {
            return Err(TorError::Protocol("tor-cert signature truncated".into()));
        }
        let sig_start = data.len() - 64;
        if sig_start < off {
            return Err(TorError::Protocol("tor-cert extension overruns signature".into()));
        }

        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[sig_start..]);

        Ok(Self {
            cert_type,
            expiration_hours,
            certified_key,
            signed_body: data[..sig_start].to_vec(),
            signature,
        })
    }

    pub fn expired_at(&self, now_unix: u64) -> bool {
        (self.expiration_hours as u64) * 3600 <= now_unix
    }

    /// Check the signature with the given Ed25519 key.
    pub fn verify_signed_by(&self, signer: &[u8; 32]) -> Result<()> {
        let key = VerifyingKey::from_bytes(signer)
            .map_err(|_| TorError::Crypto("bad Ed25519 identity key".into()))?;
        let sig = Signature::from_bytes(&self.signature);
        key.verify(&self.signed_body, &sig)
            .map_err(|_| TorError::Crypto("tor-cert signature invalid".into()))
    }
}
