//! Relay descriptors and the consensus snapshot
//!
//! The bridge serves a pre-digested micro-consensus: one `r` line per
//! relay plus `s` (flags), `w` (bandwidth), `p` (exit port policy),
//! `ntor-onion-key`, `id ed25519` and `family` lines, bracketed by
//! `valid-after`/`fresh-until` stamps. This module parses exactly the
//! fields the path selector needs and nothing more.
//!
//! The body may arrive base64-wrapped (the bridge obfuscates it for DPI);
//! the parser detects and unwraps that transparently.

use crate::error::{Result, TorError};
use crate::runtime::now_unix_secs;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Relay flags from the consensus `s` line.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RelayFlags {
    pub guard: bool,
    pub exit: bool,
    pub fast: bool,
    pub stable: bool,
    pub running: bool,
    pub valid: bool,
    pub bad_exit: bool,
}

impl RelayFlags {
    pub fn parse(flags: &str) -> Self {
        let mut out = RelayFlags::default();
        for flag in flags.split_whitespace() {
            match flag {
                "Guard" => out.guard = true,
                "Exit" => out.exit = true,
                "Fast" => out.fast = true,
                "Stable" => out.stable = true,
                "Running" => out.running = true,
                "Valid" => out.valid = true,
                "BadExit" => out.bad_exit = true,
                _ => {}
            }
        }
        out
    }
}

/// Summary of an exit policy: the ports this relay will connect out to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitPolicySummary {
    /// `accept` (listed ports allowed) or `reject` (listed ports refused).
    pub accept: bool,
    /// Port ranges, inclusive.
    pub ranges: Vec<(u16, u16)>,
}

impl ExitPolicySummary {
    /// Parse a `p` line body such as `accept 80,443,8000-8999`.
    pub fn parse(body: &str) -> Result<Self> {
        let mut parts = body.split_whitespace();
        let keyword = parts
            .next()
            .ok_or_else(|| TorError::Consensus("empty policy line".into()))?;
        let accept = match keyword {
            "accept" => true,
            "reject" => false,
            other => {
                return Err(TorError::Consensus(format!("bad policy keyword {other}")));
            }
        };

        let mut ranges = Vec::new();
        if let Some(list) = parts.next() {
            for item in list.split(',') {
                let (lo, hi) = match item.split_once('-') {
                    Some((lo, hi)) => (lo, hi),
                    None => (item, item),
                };
                let lo: u16 = lo
                    .parse()
                    .map_err(|_| TorError::Consensus(format!("bad policy port {item}")))?;
                let hi: u16 = hi
                    .parse()
                    .map_err(|_| TorError::Consensus(format!("bad policy port {item}")))?;
                ranges.push((lo, hi));
            }
        }
        Ok(Self { accept, ranges })
    }

    /// Whether this relay's policy permits exiting to `port`.
    pub fn permits(&self, port: u16) -> bool {
        let listed = self.ranges.iter().any(|&(lo, hi)| port >= lo && port <= hi);
        if self.accept {
            listed
        } else {
            !listed
        }
    }
}

/// One relay from the consensus, immutable for the consensus epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayDescriptor {
    pub nickname: String,

    /// RSA identity fingerprint (20 bytes).
    pub fingerprint: [u8; 20],

    /// Ed25519 identity key, when the consensus carries it.
    pub ed_identity: Option<[u8; 32]>,

    /// ntor onion key (32 bytes).
    pub ntor_onion_key: [u8; 32],

    pub address: IpAddr,
    pub or_port: u16,

    pub flags: RelayFlags,

    /// Consensus bandwidth weight.
    pub bandwidth: u64,

    /// Declared family fingerprints (hex, upper-case).
    pub family: Vec<String>,

    /// Exit policy port summary; `None` means no exiting at all.
    pub exit_policy: Option<ExitPolicySummary>,
}

impl RelayDescriptor {
    pub fn addr_string(&self) -> String {
        format!("{}:{}", self.address, self.or_port)
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode_upper(self.fingerprint)
    }

    pub fn is_guard_candidate(&self) -> bool {
        self.flags.guard && self.flags.fast && self.flags.stable && self.flags.running
    }

    pub fn is_middle_candidate(&self) -> bool {
        self.flags.fast && self.flags.running
    }

    pub fn is_exit_candidate(&self, port: u16) -> bool {
        self.flags.exit
            && !self.flags.bad_exit
            && self.flags.running
            && self
                .exit_policy
                .as_ref()
                .map(|p| p.permits(port))
                .unwrap_or(false)
    }

    /// The IPv4 /16 prefix, used for path diversity (`None` for IPv6).
    pub fn slash16(&self) -> Option<[u8; 2]> {
        match self.address {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                Some([o[0], o[1]])
            }
            IpAddr::V6(_) => None,
        }
    }

    /// Whether `other` is in this relay's declared family (either
    /// direction; family is honored even when only one side declares it).
    pub fn same_family(&self, other: &RelayDescriptor) -> bool {
        let other_fp = other.fingerprint_hex();
        let my_fp = self.fingerprint_hex();
        self.family.iter().any(|f| f == &other_fp) || other.family.iter().any(|f| f == &my_fp)
    }
}

/// A parsed consensus snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consensus {
    pub valid_after: u64,
    pub fresh_until: u64,
    pub relays: Vec<RelayDescriptor>,
}

impl Consensus {
    /// Still usable under the configured reuse TTL?
    pub fn is_fresh(&self, ttl_s: u64) -> bool {
        let now = now_unix_secs();
        now < self.fresh_until && now < self.valid_after.saturating_add(ttl_s)
    }

    /// The epoch tag used to key per-epoch caches (carrier choice, circuit
    /// reuse). Changes at least hourly.
    pub fn epoch(&self) -> u64 {
        self.valid_after
    }

    pub fn find(&self, fingerprint: &[u8; 20]) -> Option<&RelayDescriptor> {
        self.relays.iter().find(|r| &r.fingerprint == fingerprint)
    }

    /// Parse a consensus body as served by the bridge. Accepts the raw
    /// text or a base64 wrapping of it.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let text = match std::str::from_utf8(body) {
            Ok(t) if t.contains("r ") => t.to_string(),
            Ok(t) => {
                use base64::engine::general_purpose::STANDARD;
                use base64::Engine;
                let stripped: String = t.split_whitespace().collect();
                match STANDARD.decode(stripped.as_bytes()) {
                    Ok(raw) => String::from_utf8(raw)
                        .map_err(|e| TorError::Consensus(format!("not UTF-8 after unwrap: {e}")))?,
                    Err(_) => t.to_string(),
                }
            }
            Err(e) => return Err(TorError::Consensus(format!("not UTF-8: {e}"))),
        };
        Self::parse_text(&text)
    }

    pub fn parse_text(text: &str) -> Result<Self> {
        let mut valid_after = 0u64;
        let mut fresh_until = 0u64;
        let mut relays = Vec::new();
        let mut current: Option<PendingRelay> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix("valid-after ") {
                valid_after = parse_stamp(rest);
            } else if let Some(rest) = line.strip_prefix("fresh-until ") {
                fresh_until = parse_stamp(rest);
            } else if let Some(rest) = line.strip_prefix("r ") {
                if let Some(pending) = current.take() {
                    relays.extend(pending.finish());
                }
                current = Some(PendingRelay::from_r_line(rest)?);
            } else if let Some(rest) = line.strip_prefix("s ") {
                if let Some(ref mut pending) = current {
                    pending.flags = RelayFlags::parse(rest);
                }
            } else if let Some(rest) = line.strip_prefix("w ") {
                if let Some(ref mut pending) = current {
                    pending.bandwidth = parse_bandwidth(rest);
                }
            } else if let Some(rest) = line.strip_prefix("p ") {
                if let Some(ref mut pending) = current {
                    pending.exit_policy = ExitPolicySummary::parse(rest).ok();
                }
            } else if let Some(rest) = line.strip_prefix("ntor-onion-key ") {
                if let Some(ref mut pending) = current {
                    pending.ntor_onion_key = decode_key_32(rest);
                }
            } else if let Some(rest) = line.strip_prefix("id ed25519 ") {
                if let Some(ref mut pending) = current {
                    pending.ed_identity = decode_key_32(rest);
                }
            } else if let Some(rest) = line.strip_prefix("family ") {
                if let Some(ref mut pending) = current {
                    pending.family = rest
                        .split_whitespace()
                        .map(|f| f.trim_start_matches('$').to_uppercase())
                        .collect();
                }
            }
        }
        if let Some(pending) = current.take() {
            relays.extend(pending.finish());
        }

        if relays.is_empty() {
            return Err(TorError::Consensus("no relays in consensus".into()));
        }

        // A bridge that strips timestamps still gets a working epoch.
        if valid_after == 0 {
            valid_after = now_unix_secs();
        }
        if fresh_until == 0 {
            fresh_until = valid_after + 3600;
        }

        Ok(Self {
            valid_after,
            fresh_until,
            relays,
        })
    }
}

/// Accumulates one relay while its `r`/`s`/`w`/`p` lines stream past.
struct PendingRelay {
    nickname: String,
    fingerprint: Option<[u8; 20]>,
    ed_identity: Option<[u8; 32]>,
    ntor_onion_key: Option<[u8; 32]>,
    address: IpAddr,
    or_port: u16,
    flags: RelayFlags,
    bandwidth: u64,
    family: Vec<String>,
    exit_policy: Option<ExitPolicySummary>,
}

impl PendingRelay {
    /// `r <nickname> <identity-b64-or-hex> <published...> <ip> <orport> ...`
    fn from_r_line(rest: &str) -> Result<Self> {
        let parts: Vec<&str> = rest.split_whitespace().collect();
        if parts.len() < 5 {
            return Err(TorError::Consensus("short r line".into()));
        }

        // The bridge may emit the identity as hex or as consensus base64.
        let fingerprint = decode_fingerprint(parts[1]);

        // Address and port are the last two fixed columns the bridge keeps.
        let (addr_idx, port_idx) = (parts.len() - 2, parts.len() - 1);
        let address: IpAddr = parts[addr_idx]
            .parse()
            .map_err(|_| TorError::Consensus(format!("bad relay address {}", parts[addr_idx])))?;
        let or_port: u16 = parts[port_idx]
            .parse()
            .map_err(|_| TorError::Consensus(format!("bad OR port {}", parts[port_idx])))?;

        Ok(Self {
            nickname: parts[0].to_string(),
            fingerprint,
            ed_identity: None,
            ntor_onion_key: None,
            address,
            or_port,
            flags: RelayFlags::default(),
            bandwidth: 0,
            family: Vec::new(),
            exit_policy: None,
        })
    }

    /// Relays missing an identity or ntor key cannot be used for anything;
    /// drop them here rather than at selection time.
    fn finish(self) -> Option<RelayDescriptor> {
        Some(RelayDescriptor {
            nickname: self.nickname,
            fingerprint: self.fingerprint?,
            ed_identity: self.ed_identity,
            ntor_onion_key: self.ntor_onion_key?,
            address: self.address,
            or_port: self.or_port,
            flags: self.flags,
            bandwidth: self.bandwidth,
            family: self.family,
            exit_policy: self.exit_policy,
        })
    }
}

fn parse_bandwidth(rest: &str) -> u64 {
    rest.split_whitespace()
        .find_map(|p| p.strip_prefix("Bandwidth="))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// `valid-after`/`fresh-until` stamps arrive either as Unix seconds (the
/// bridge's digest) or an ISO date we don't need precisely; unknown shapes
/// fall back to "now".
fn parse_stamp(rest: &str) -> u64 {
    rest.split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(now_unix_secs)
}

fn decode_fingerprint(field: &str) -> Option<[u8; 20]> {
    if let Ok(bytes) = hex::decode(field) {
        if let Ok(fp) = <[u8; 20]>::try_from(bytes.as_slice()) {
            return Some(fp);
        }
    }
    use base64::engine::general_purpose::STANDARD_NO_PAD;
    use base64::Engine;
    let bytes = STANDARD_NO_PAD.decode(field.trim_end_matches('=')).ok()?;
    <[u8; 20]>::try_from(bytes.as_slice()).ok()
}

fn decode_key_32(field: &str) -> Option<[u8; 32]> {
    use base64::engine::general_purpose::STANDARD_NO_PAD;
    use base64::Engine;
    let field = field.trim();
    if let Ok(bytes) = hex::decode(field) {
        if let Ok(key) = <[u8; 32]>::try_from(bytes.as_slice()) {
            return Some(key);
        }
    }
    let bytes = STANDARD_NO_PAD.decode(field.trim_end_matches('=')).ok()?;
    <[u8; 32]>::try_from(bytes.as_slice()).ok()
}
