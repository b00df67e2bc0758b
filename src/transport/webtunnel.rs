//! WebTunnel carrier
//!
//! Wire shape identical to the direct WebSocket carrier, but the upgrade
//! rides a secret path on a cover site and authenticates through the
//! `Sec-WebSocket-Protocol` header: `v1.<HEX32>.<unix-seconds>`, where
//! HEX32 is the first 128 bits of HMAC-SHA256(secret_path, seconds-string).
//!
//! The server verifies in constant time and answers failures with a
//! response byte-identical to the cover site's 404, so an active prober
//! learns nothing from a wrong path or a replayed challenge.

use crate::error::{Result, TorError};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock drift between client and server, seconds.
pub const MAX_DRIFT_SECS: u64 = 5 * 60;

/// Truncation of the HMAC: 128 bits, 32 hex characters.
const MAC_HEX_LEN: usize = 32;

/// Build the subprotocol challenge for `secret_path` at `unix_secs`.
pub fn make_challenge(secret_path: &str, unix_secs: u64) -> String {
    let ts = unix_secs.to_string();
    let mut mac =
        HmacSha256::new_from_slice(secret_path.as_bytes()).expect("HMAC accepts any key length");
    mac.update(ts.as_bytes());
    let tag = mac.finalize().into_bytes();
    format!("v1.{}.{}", hex::encode(&tag[..MAC_HEX_LEN / 2]), ts)
}

/// Server-side verification: parse `v1.<hex32>.<secs>`, check drift, and
/// compare the MAC in constant time. Callers MUST map any `Err` to the
/// cover site's 404 without distinguishing the cause.
pub fn verify_challenge(secret_path: &str, challenge: &str, now_unix: u64) -> Result<()> {
    let reject = || TorError::Transport("webtunnel challenge rejected".into());

    let mut parts = challenge.splitn(3, '.');
    let (version, mac_hex, ts_str) = match (parts.next(), parts.next(), parts.next()) {
        (Some(v), Some(m), Some(t)) => (v, m, t),
        _ => return Err(reject()),
    };
    if version != "v1" || mac_hex.len() != MAC_HEX_LEN {
        return Err(reject());
    }

    let ts: u64 = ts_str.parse().map_err(|_| reject())?;
    let drift = now_unix.abs_diff(ts);
    if drift > MAX_DRIFT_SECS {
        return Err(reject());
    }

    let expected = make_challenge(secret_path, ts);
    let expected_mac = &expected.as_bytes()[3..3 + MAC_HEX_LEN];
    if expected_mac.ct_eq(mac_hex.as_bytes()).unwrap_u8() != 1 {
        return Err(reject());
    }
    Ok(())
}

/// The full WebSocket URL for a WebTunnel bridge: base URL joined with the
/// secret path.
pub fn tunnel_url(base_url: &str, secret_path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if secret_path.starts_with('/') {
        format!("{base}{secret_path}")
    } else {
        format!("{base}/{secret_path}")
    }
}

#[cfg(target_arch = "wasm32")]
pub use wasm::WebTunnelConnector;

#[cfg(target_arch = "wasm32")]
mod wasm {
    use super::*;
    use crate::runtime::now_unix_secs;
    use crate::transport::websocket::WsCarrier;
    use crate::transport::{BridgeEndpoint, Carrier, CarrierConnector, CarrierKind};
    use async_trait::async_trait;

    /// Dials a WebTunnel bridge: same carrier as the direct WebSocket one,
    /// with the HMAC challenge as the subprotocol instead of "tor".
    pub struct WebTunnelConnector;

    #[async_trait(?Send)]
    impl CarrierConnector for WebTunnelConnector {
        fn kind(&self) -> CarrierKind {
            CarrierKind::WebTunnel
        }

        async fn connect(&self, endpoint: &BridgeEndpoint) -> crate::error::Result<Box<dyn Carrier>> {
            let secret = endpoint.webtunnel_secret.as_deref().ok_or_else(|| {
                TorError::Config("webtunnel carrier without webtunnel_secret".into())
            })?;
            let url = format!(
                "{}?addr={}",
                tunnel_url(&endpoint.url, secret),
                endpoint.addr_param()
            );
            let protocol = make_challenge(secret, now_unix_secs());
            let carrier = WsCarrier::connect(&url, &protocol).await?;
            Ok(Box::new(carrier))
        }
    }
}
