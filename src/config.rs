//! Protocol-core configuration
//!
//! Everything the engine can be told from the host, with the defaults the
//! core ships with. The host hands this over once at client creation; the
//! core never reads ambient state.

use crate::error::{Result, TorError};
use crate::shaper::ShaperProfile;
use crate::transport::CarrierKind;
use serde::{Deserialize, Serialize};

/// How long a consensus may be reused, in seconds (one epoch).
pub const DEFAULT_CONSENSUS_TTL_S: u64 = 3600;

/// Configuration recognized by the protocol core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Ordered list of transports to try.
    pub carrier_order: Vec<CarrierKind>,

    /// Pinned guard identity (hex fingerprint). Unset means random
    /// bandwidth-weighted selection.
    pub guard_fingerprint: Option<String>,

    /// Traffic shaping profile.
    pub shaper_profile: ShaperProfile,

    /// Enables chaff plus strict timing.
    pub paranoid: bool,

    /// How long to reuse a consensus, in seconds.
    pub consensus_ttl_s: u64,

    /// X25519 public key of Bridge B for bridge blinding (base64url).
    /// Unset means one-hop bridging: the guard address travels in clear to
    /// the (single) bridge.
    pub bridge_b_pubkey: Option<String>,

    /// Shared secret path used as the WebTunnel HMAC key. Unset disables
    /// the WebTunnel carrier.
    pub webtunnel_secret: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            carrier_order: vec![
                CarrierKind::WebSocket,
                CarrierKind::WebTunnel,
                CarrierKind::Meek,
                CarrierKind::WebRtc,
            ],
            guard_fingerprint: None,
            shaper_profile: ShaperProfile::Padded,
            paranoid: false,
            consensus_ttl_s: DEFAULT_CONSENSUS_TTL_S,
            bridge_b_pubkey: None,
            webtunnel_secret: None,
        }
    }
}

impl CoreConfig {
    /// Parse a config from its JSON form (the shape the host passes in).
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| TorError::Config(format!("bad config JSON: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| TorError::Config(format!("serialize: {e}")))
    }

    /// Decode the pinned Bridge B public key, if configured.
    pub fn bridge_b_key(&self) -> Result<Option<[u8; 32]>> {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let Some(ref b64) = self.bridge_b_pubkey else {
            return Ok(None);
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(b64)
            .map_err(|e| TorError::Config(format!("bridge_b_pubkey: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TorError::Config("bridge_b_pubkey must be 32 bytes".into()))?;
        Ok(Some(key))
    }

    /// The carriers actually usable under this config: WebTunnel drops out
    /// without a shared secret.
    pub fn usable_carriers(&self) -> Vec<CarrierKind> {
        self.carrier_order
            .iter()
            .copied()
            .filter(|kind| *kind != CarrierKind::WebTunnel || self.webtunnel_secret.is_some())
            .collect()
    }
}
