//! meek carrier
//!
//! Cell bytes ride HTTP POST bodies addressed at a CDN front-end; the
//! response body carries the reverse direction. A censor sees ordinary
//! HTTPS requests to a CDN. The session is identified by an opaque random
//! `X-Session-Id` header and the bridge target by `X-Target`.
//!
//! The session logic (header values, idle accounting) is plain Rust so it
//! can be tested natively; only the fetch plumbing is browser code.

/// Session id: 16 random bytes, hex on the wire.
pub const SESSION_ID_BYTES: usize = 8 * 2;

/// The server keeps an idle session alive at least this long.
pub const IDLE_TIMEOUT_SECS: u64 = 30;

/// How often the client polls when it has nothing to send (ms).
pub const POLL_INTERVAL_MS: u64 = 100;

/// The per-session HTTP header state of one meek tunnel.
#[derive(Debug, Clone)]
pub struct MeekSession {
    session_id: String,
    target: String,
    last_exchange_unix: u64,
}

impl MeekSession {
    /// A fresh session toward `target` (the bridge's `host:port` or a
    /// blinding envelope).
    pub fn new(target: &str, now_unix: u64) -> Self {
        let mut bytes = [0u8; SESSION_ID_BYTES / 2];
        if getrandom::getrandom(&mut bytes).is_err() {
            log::warn!("CSPRNG unavailable for meek session id");
        }
        Self {
            session_id: hex::encode(bytes),
            target: target.to_string(),
            last_exchange_unix: now_unix,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The headers for every exchange of this session.
    pub fn headers(&self) -> [(&'static str, &str); 3] {
        [
            ("X-Session-Id", &self.session_id),
            ("X-Target", &self.target),
            ("Content-Type", "application/octet-stream"),
        ]
    }

    pub fn note_exchange(&mut self, now_unix: u64) {
        self.last_exchange_unix = now_unix;
    }

    /// Whether the server may already have reaped this session.
    pub fn expired(&self, now_unix: u64) -> bool {
        now_unix.saturating_sub(self.last_exchange_unix) > IDLE_TIMEOUT_SECS
    }
}

#[cfg(target_arch = "wasm32")]
pub use wasm::{MeekCarrier, MeekConnector};

#[cfg(target_arch = "wasm32")]
mod wasm {
    use super::*;
    use crate::error::TorError;
    use crate::runtime::{now_unix_secs, sleep};
    use crate::transport::{BridgeEndpoint, Carrier, CarrierConnector, CarrierKind};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;
    use wasm_bindgen::JsCast;
    use wasm_bindgen_futures::JsFuture;
    use web_sys::{Request, RequestInit, RequestMode, Response};

    /// One HTTP-POST tunnel. Sends are buffered and shipped on the next
    /// exchange; `recv` polls the front-end until bytes come back.
    pub struct MeekCarrier {
        url: String,
        session: MeekSession,
        outbound: Vec<u8>,
        inbound: VecDeque<u8>,
        closed: bool,
    }

    impl MeekCarrier {
        pub async fn connect(url: &str, target: &str) -> Result<Self> {
            let mut carrier = Self {
                url: url.to_string(),
                session: MeekSession::new(target, now_unix_secs()),
                outbound: Vec::new(),
                inbound: VecDeque::new(),
                closed: false,
            };
            // Empty-body exchange opens the session server-side.
            let first = carrier.exchange(&[]).await?;
            carrier.inbound.extend(first);
            Ok(carrier)
        }

        /// One POST round trip: ship `body`, collect the response bytes.
        async fn exchange(&mut self, body: &[u8]) -> Result<Vec<u8>> {
            let opts = RequestInit::new();
            opts.set_method("POST");
            opts.set_mode(RequestMode::Cors);
            let js_body = js_sys::Uint8Array::from(body);
            opts.set_body(&js_body.into());

            let request = Request::new_with_str_and_init(&self.url, &opts)
                .map_err(|e| TorError::Transport(format!("meek request: {e:?}")))?;
            let headers = request.headers();
            for (name, value) in self.session.headers() {
                headers
                    .set(name, value)
                    .map_err(|e| TorError::Transport(format!("meek header: {e:?}")))?;
            }

            let window =
                web_sys::window().ok_or_else(|| TorError::Transport("no window".into()))?;
            let resp_value = JsFuture::from(window.fetch_with_request(&request))
                .await
                .map_err(|e| TorError::Transport(format!("meek fetch: {e:?}")))?;
            let resp: Response = resp_value
                .dyn_into()
                .map_err(|_| TorError::Transport("meek: not a Response".into()))?;
            if !resp.ok() {
                return Err(TorError::Transport(format!("meek HTTP {}", resp.status())));
            }

            let buf = JsFuture::from(
                resp.array_buffer()
                    .map_err(|e| TorError::Transport(format!("meek body: {e:?}")))?,
            )
            .await
            .map_err(|e| TorError::Transport(format!("meek body await: {e:?}")))?;
            let array = js_sys::Uint8Array::new(&buf);

            self.session.note_exchange(now_unix_secs());
            Ok(array.to_vec())
        }
    }

    #[async_trait(?Send)]
    impl Carrier for MeekCarrier {
        async fn send(&mut self, bytes: &[u8]) -> Result<()> {
            if self.closed {
                return Err(TorError::Transport("meek session closed".into()));
            }
            self.outbound.extend_from_slice(bytes);
            let body = std::mem::take(&mut self.outbound);
            let reply = self.exchange(&body).await?;
            self.inbound.extend(reply);
            Ok(())
        }

        async fn recv(&mut self) -> Result<Vec<u8>> {
            loop {
                if !self.inbound.is_empty() {
                    return Ok(self.inbound.drain(..).collect());
                }
                if self.closed {
                    return Err(TorError::Transport("meek session closed".into()));
                }
                // Nothing buffered: poll with an empty body.
                let reply = self.exchange(&[]).await?;
                if reply.is_empty() {
                    sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
                } else {
                    self.inbound.extend(reply);
                }
            }
        }

        async fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }

        fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
            if self.inbound.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.inbound.drain(..).collect()))
            }
        }
    }

    /// Connector for the meek carrier.
    pub struct MeekConnector;

    #[async_trait(?Send)]
    impl CarrierConnector for MeekConnector {
        fn kind(&self) -> CarrierKind {
            CarrierKind::Meek
        }

        async fn connect(&self, endpoint: &BridgeEndpoint) -> Result<Box<dyn Carrier>> {
            let carrier = MeekCarrier::connect(&endpoint.url, endpoint.addr_param()).await?;
            Ok(Box::new(carrier))
        }
    }
}
