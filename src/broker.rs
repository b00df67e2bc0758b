//! Signaling broker state machine
//!
//! A stateless matcher between volunteer proxies and censored clients:
//! proxies REGISTER an SDP offer, clients REQUEST one, the client's ANSWER
//! is forwarded back to the proxy, and the broker forgets both parties.
//!
//! The whole broker is one owned `BrokerState` value; connection handlers
//! call into it through explicit operations and apply the returned
//! actions. Nothing is mutated behind the state's back, and no await
//! happens while an entry is half-moved between the maps.

use crate::error::{Result, TorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Registered proxies older than this are swept out.
pub const PROXY_TTL_SECS: u64 = 5 * 60;

/// Cap on the available-proxy pool.
pub const DEFAULT_POOL_CAP: usize = 10_000;

/// Messages a party sends to the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartyMessage {
    /// A volunteer proxy offers itself.
    Register {
        sdp_offer: String,
        #[serde(default)]
        ice_candidates: Vec<String>,
    },
    /// A censored client asks for a proxy.
    Request {},
    /// The client answers a matched proxy's offer.
    Answer {
        proxy_id: String,
        sdp_answer: String,
        #[serde(default)]
        ice_candidates: Vec<String>,
    },
}

/// Messages the broker sends back (or forwards to the proxy).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerMessage {
    Registered {
        proxy_id: String,
        pool_size: usize,
    },
    Matched {
        proxy_id: String,
        sdp_offer: String,
        ice_candidates: Vec<String>,
    },
    /// Forwarded to the proxy's connection after ANSWER.
    Connect {
        sdp_answer: String,
        ice_candidates: Vec<String>,
    },
    NoProxies {},
    AnswerSent {},
    Error {
        message: String,
    },
}

impl BrokerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        BrokerMessage::Error {
            message: message.into(),
        }
    }
}

/// Opaque handle the embedding server uses to reach a proxy's connection.
pub type ConnectionId = u64;

/// What the caller must do after an operation: send `message` on
/// `connection`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub connection: ConnectionId,
    pub message: BrokerMessage,
}

/// An available proxy, waiting to be matched.
#[derive(Debug, Clone)]
struct AvailableProxy {
    proxy_id: String,
    connection: ConnectionId,
    sdp_offer: String,
    ice_candidates: Vec<String>,
    registered_at: u64,
}

/// A proxy already handed to a client, awaiting the client's ANSWER.
#[derive(Debug, Clone)]
struct PendingMatch {
    connection: ConnectionId,
}

/// The broker's entire state.
pub struct BrokerState {
    pool_cap: usize,
    /// FIFO by registration time; matched from the front.
    available: Vec<AvailableProxy>,
    /// proxy_id → the proxy connection awaiting CONNECT.
    pending: HashMap<String, PendingMatch>,
    /// Live connections, so matches skip proxies that dropped.
    connections: HashMap<ConnectionId, ()>,
}

impl BrokerState {
    pub fn new() -> Self {
        Self::with_pool_cap(DEFAULT_POOL_CAP)
    }

    pub fn with_pool_cap(pool_cap: usize) -> Self {
        Self {
            pool_cap,
            available: Vec::new(),
            pending: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.available.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// A new connection attached (proxy or client; typed by first message).
    pub fn connection_opened(&mut self, connection: ConnectionId) {
        self.connections.insert(connection, ());
    }

    /// A connection dropped: purge it from both maps.
    pub fn connection_closed(&mut self, connection: ConnectionId) {
        self.connections.remove(&connection);
        self.available.retain(|p| p.connection != connection);
        self.pending.retain(|_, m| m.connection != connection);
    }

    /// Handle one parsed message from `from`. Returns the messages to put
    /// on the wire (reply to the sender, and possibly a forward to a
    /// proxy).
    pub fn handle(
        &mut self,
        from: ConnectionId,
        message: PartyMessage,
        now_unix: u64,
    ) -> Vec<Outgoing> {
        match message {
            PartyMessage::Register {
                sdp_offer,
                ice_candidates,
            } => self.handle_register(from, sdp_offer, ice_candidates, now_unix),
            PartyMessage::Request {} => self.handle_request(from, now_unix),
            PartyMessage::Answer {
                proxy_id,
                sdp_answer,
                ice_candidates,
            } => self.handle_answer(from, proxy_id, sdp_answer, ice_candidates),
        }
    }

    /// Handle one raw JSON text frame. Malformed input earns an error
    /// reply, never a dropped connection.
    pub fn handle_json(&mut self, from: ConnectionId, text: &str, now_unix: u64) -> Vec<Outgoing> {
        match parse_message(text) {
            Ok(message) => self.handle(from, message, now_unix),
            Err(e) => vec![Outgoing {
                connection: from,
                message: BrokerMessage::error(e.to_string()),
            }],
        }
    }

    fn handle_register(
        &mut self,
        from: ConnectionId,
        sdp_offer: String,
        ice_candidates: Vec<String>,
        now_unix: u64,
    ) -> Vec<Outgoing> {
        if sdp_offer.is_empty() {
            return vec![Outgoing {
                connection: from,
                message: BrokerMessage::error("register requires sdp_offer"),
            }];
        }
        if self.available.len() >= self.pool_cap {
            return vec![Outgoing {
                connection: from,
                message: BrokerMessage::error("proxy pool full"),
            }];
        }

        let proxy_id = new_proxy_id();
        self.available.push(AvailableProxy {
            proxy_id: proxy_id.clone(),
            connection: from,
            sdp_offer,
            ice_candidates,
            registered_at: now_unix,
        });

        vec![Outgoing {
            connection: from,
            message: BrokerMessage::Registered {
                proxy_id,
                pool_size: self.available.len(),
            },
        }]
    }

    fn handle_request(&mut self, from: ConnectionId, now_unix: u64) -> Vec<Outgoing> {
        // Oldest first. Dead entries at the front are discarded on the
        // way, not matched; bulk eviction stays in sweep().
        let matched = loop {
            if self.available.is_empty() {
                break None;
            }
            let oldest_idx = self
                .available
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.registered_at)
                .map(|(i, _)| i)
                .expect("non-empty pool");
            let proxy = self.available.remove(oldest_idx);

            let alive = self.connections.contains_key(&proxy.connection)
                && now_unix.saturating_sub(proxy.registered_at) <= PROXY_TTL_SECS;
            if alive {
                break Some(proxy);
            }
        };

        let Some(proxy) = matched else {
            return vec![Outgoing {
                connection: from,
                message: BrokerMessage::NoProxies {},
            }];
        };

        self.pending.insert(
            proxy.proxy_id.clone(),
            PendingMatch {
                connection: proxy.connection,
            },
        );

        vec![Outgoing {
            connection: from,
            message: BrokerMessage::Matched {
                proxy_id: proxy.proxy_id,
                sdp_offer: proxy.sdp_offer,
                ice_candidates: proxy.ice_candidates,
            },
        }]
    }

    fn handle_answer(
        &mut self,
        from: ConnectionId,
        proxy_id: String,
        sdp_answer: String,
        ice_candidates: Vec<String>,
    ) -> Vec<Outgoing> {
        if proxy_id.is_empty() || sdp_answer.is_empty() {
            return vec![Outgoing {
                connection: from,
                message: BrokerMessage::error("answer requires proxy_id and sdp_answer"),
            }];
        }

        // Remove first: after the forward the broker retains no state
        // about either party.
        let Some(pending) = self.pending.remove(&proxy_id) else {
            return vec![Outgoing {
                connection: from,
                message: BrokerMessage::error("unknown or expired proxy_id"),
            }];
        };

        if !self.connections.contains_key(&pending.connection) {
            return vec![Outgoing {
                connection: from,
                message: BrokerMessage::error("proxy went away"),
            }];
        }

        vec![
            Outgoing {
                connection: pending.connection,
                message: BrokerMessage::Connect {
                    sdp_answer,
                    ice_candidates,
                },
            },
            Outgoing {
                connection: from,
                message: BrokerMessage::AnswerSent {},
            },
        ]
    }

    /// Periodic eviction of proxies older than the TTL or whose
    /// connection died. Separate pass; never runs inside matching.
    pub fn sweep(&mut self, now_unix: u64) -> usize {
        let before = self.available.len();
        let connections = &self.connections;
        self.available.retain(|p| {
            connections.contains_key(&p.connection)
                && now_unix.saturating_sub(p.registered_at) <= PROXY_TTL_SECS
        });
        before - self.available.len()
    }

    /// `GET /health` payload.
    pub fn health(&self, role: &str, uptime_secs: u64) -> serde_json::Value {
        serde_json::json!({
            "status": "ok",
            "role": role,
            "uptime": uptime_secs,
            "available_proxies": self.available.len(),
            "pending_matches": self.pending.len(),
        })
    }

    /// `GET /stats` payload.
    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({ "proxies": self.available.len() })
    }
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a party message, mapping malformed JSON and unknown types to a
/// protocol error (the caller turns it into an error reply).
pub fn parse_message(text: &str) -> Result<PartyMessage> {
    serde_json::from_str(text).map_err(|e| TorError::Protocol(format!("bad broker message: {e}")))
}

/// 16 random bytes, hex-encoded.
fn new_proxy_id() -> String {
    let mut bytes = [0u8; 16];
    if getrandom::getrandom(&mut bytes).is_err() {
        log::warn!("CSPRNG unavailable for proxy id");
    }
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(state: &mut BrokerState, conn: ConnectionId, now: u64) -> String {
        state.connection_opened(conn);
        let out = state.handle(
            conn,
            PartyMessage::Register {
                sdp_offer: format!("offer-{conn}"),
                ice_candidates: vec![format!("candidate-{conn}")],
            },
            now,
        );
        match &out[0].message {
            BrokerMessage::Registered { proxy_id, .. } => proxy_id.clone(),
            other => panic!("expected Registered, got {other:?}"),
        }
    }

    #[test]
    fn register_assigns_unique_ids_and_counts_pool() {
        let mut state = BrokerState::new();
        let a = register(&mut state, 1, 100);
        let b = register(&mut state, 2, 101);
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert_eq!(state.pool_size(), 2);
    }

    #[test]
    fn request_matches_fifo_and_moves_to_pending() {
        let mut state = BrokerState::new();
        let first = register(&mut state, 1, 100);
        let _second = register(&mut state, 2, 200);

        state.connection_opened(10);
        let out = state.handle(10, PartyMessage::Request {}, 300);
        match &out[0].message {
            BrokerMessage::Matched {
                proxy_id,
                sdp_offer,
                ..
            } => {
                assert_eq!(proxy_id, &first, "oldest registration wins");
                assert_eq!(sdp_offer, "offer-1");
            }
            other => panic!("expected Matched, got {other:?}"),
        }
        assert_eq!(state.pool_size(), 1);
        assert_eq!(state.pending_count(), 1);
    }

    #[test]
    fn request_on_empty_pool_says_no_proxies() {
        let mut state = BrokerState::new();
        state.connection_opened(10);
        let out = state.handle(10, PartyMessage::Request {}, 100);
        assert_eq!(out[0].message, BrokerMessage::NoProxies {});
    }

    #[test]
    fn answer_forwards_connect_and_forgets() {
        let mut state = BrokerState::new();
        let proxy_id = register(&mut state, 1, 100);
        state.connection_opened(10);
        state.handle(10, PartyMessage::Request {}, 150);

        let out = state.handle(
            10,
            PartyMessage::Answer {
                proxy_id: proxy_id.clone(),
                sdp_answer: "answer-sdp".into(),
                ice_candidates: vec!["c1".into()],
            },
            160,
        );

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].connection, 1);
        assert_eq!(
            out[0].message,
            BrokerMessage::Connect {
                sdp_answer: "answer-sdp".into(),
                ice_candidates: vec!["c1".into()],
            }
        );
        assert_eq!(out[1].connection, 10);
        assert_eq!(out[1].message, BrokerMessage::AnswerSent {});

        // nothing survives the match
        assert_eq!(state.pool_size(), 0);
        assert_eq!(state.pending_count(), 0);

        // replaying the answer finds nothing
        let out = state.handle(
            10,
            PartyMessage::Answer {
                proxy_id,
                sdp_answer: "again".into(),
                ice_candidates: vec![],
            },
            170,
        );
        assert!(matches!(out[0].message, BrokerMessage::Error { .. }));
    }

    #[test]
    fn concurrent_requests_get_distinct_proxies() {
        let mut state = BrokerState::new();
        for conn in 1..=3 {
            register(&mut state, conn, 100 + conn);
        }
        let mut seen = std::collections::HashSet::new();
        for client in [10u64, 11] {
            state.connection_opened(client);
            let out = state.handle(client, PartyMessage::Request {}, 500);
            match &out[0].message {
                BrokerMessage::Matched { proxy_id, .. } => {
                    assert!(seen.insert(proxy_id.clone()), "proxy matched twice");
                }
                other => panic!("expected Matched, got {other:?}"),
            }
        }
        assert_eq!(state.pool_size(), 1);
    }

    #[test]
    fn dead_proxy_is_skipped_not_matched() {
        let mut state = BrokerState::new();
        register(&mut state, 1, 100);
        let live = register(&mut state, 2, 200);
        state.connection_closed(1);

        state.connection_opened(10);
        let out = state.handle(10, PartyMessage::Request {}, 300);
        match &out[0].message {
            BrokerMessage::Matched { proxy_id, .. } => assert_eq!(proxy_id, &live),
            other => panic!("expected Matched, got {other:?}"),
        }
    }

    #[test]
    fn sweep_evicts_stale_entries() {
        let mut state = BrokerState::new();
        register(&mut state, 1, 100);
        register(&mut state, 2, 100 + PROXY_TTL_SECS);
        let evicted = state.sweep(100 + PROXY_TTL_SECS + 1);
        assert_eq!(evicted, 1);
        assert_eq!(state.pool_size(), 1);
    }

    #[test]
    fn pool_cap_is_enforced() {
        let mut state = BrokerState::with_pool_cap(1);
        register(&mut state, 1, 100);
        state.connection_opened(2);
        let out = state.handle(
            2,
            PartyMessage::Register {
                sdp_offer: "offer".into(),
                ice_candidates: vec![],
            },
            101,
        );
        assert!(matches!(out[0].message, BrokerMessage::Error { .. }));
    }

    #[test]
    fn disconnect_removes_from_both_maps() {
        let mut state = BrokerState::new();
        let proxy_id = register(&mut state, 1, 100);
        state.connection_opened(10);
        state.handle(10, PartyMessage::Request {}, 150);
        assert_eq!(state.pending_count(), 1);

        state.connection_closed(1);
        assert_eq!(state.pending_count(), 0);

        let out = state.handle(
            10,
            PartyMessage::Answer {
                proxy_id,
                sdp_answer: "late".into(),
                ice_candidates: vec![],
            },
            160,
        );
        assert!(matches!(out[0].message, BrokerMessage::Error { .. }));
    }

    #[test]
    fn malformed_json_earns_error_reply() {
        let mut state = BrokerState::new();
        state.connection_opened(5);
        let out = state.handle_json(5, "{not json", 100);
        assert!(matches!(out[0].message, BrokerMessage::Error { .. }));
        let out = state.handle_json(5, r#"{"type":"launch"}"#, 100);
        assert!(matches!(out[0].message, BrokerMessage::Error { .. }));
        // missing required field
        let out = state.handle_json(5, r#"{"type":"answer","proxy_id":"x"}"#, 100);
        assert!(matches!(out[0].message, BrokerMessage::Error { .. }));
    }

    #[test]
    fn wire_spelling_matches_interface() {
        let msg: PartyMessage =
            serde_json::from_str(r#"{"type":"register","sdp_offer":"o"}"#).unwrap();
        assert!(matches!(msg, PartyMessage::Register { .. }));

        let json = serde_json::to_string(&BrokerMessage::NoProxies {}).unwrap();
        assert!(json.contains("\"no_proxies\""));
        let json = serde_json::to_string(&BrokerMessage::AnswerSent {}).unwrap();
        assert!(json.contains("\"answer_sent\""));
    }

    #[test]
    fn health_and_stats_shapes() {
        let mut state = BrokerState::new();
        register(&mut state, 1, 100);
        let health = state.health("broker", 42);
        assert_eq!(health["available_proxies"], 1);
        assert_eq!(health["pending_matches"], 0);
        assert_eq!(state.stats()["proxies"], 1);
    }
}
