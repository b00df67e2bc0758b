//! Path selection and guard persistence
//!
//! The guard is chosen once per long-lived identity, bandwidth-weighted
//! among Guard-flagged relays, and persisted (the host owns the opaque
//! blob). Middles are weighted picks excluding the guard's family and /16;
//! exits are weighted among relays whose policy permits the requested
//! port, excluding both prior hops' families.

use crate::consensus::{Consensus, RelayDescriptor};
use crate::error::{Result, TorError};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How long a guard persists before rotation (60 days).
pub const GUARD_LIFETIME_SECS: u64 = 60 * 24 * 60 * 60;

/// Consecutive failures before the guard is abandoned early.
pub const MAX_GUARD_FAILURES: u32 = 5;

/// Persisted guard identity plus rotation bookkeeping. Serialized as the
/// opaque blob the host stores for us.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardState {
    /// Hex fingerprint of the current guard, once chosen.
    pub fingerprint: Option<String>,
    pub selected_at: u64,
    pub rotate_after: u64,
    pub consecutive_failures: u32,
    version: u32,
}

impl Default for GuardState {
    fn default() -> Self {
        Self {
            fingerprint: None,
            selected_at: 0,
            rotate_after: 0,
            consecutive_failures: 0,
            version: 1,
        }
    }
}

impl GuardState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_blob(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| TorError::Config(format!("guard blob: {e}")))
    }

    pub fn from_blob(blob: &str) -> Result<Self> {
        serde_json::from_str(blob).map_err(|e| TorError::Config(format!("guard blob: {e}")))
    }

    /// Whether a fresh guard must be chosen.
    pub fn needs_selection(&self, now_unix: u64) -> bool {
        self.fingerprint.is_none()
            || now_unix >= self.rotate_after
            || self.consecutive_failures >= MAX_GUARD_FAILURES
    }

    fn adopt(&mut self, relay: &RelayDescriptor, now_unix: u64) {
        self.fingerprint = Some(relay.fingerprint_hex());
        self.selected_at = now_unix;
        self.rotate_after = now_unix + GUARD_LIFETIME_SECS;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= MAX_GUARD_FAILURES {
            log::warn!("guard failed {} times, will rotate", self.consecutive_failures);
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }
}

/// A chosen 3-hop path.
pub struct PathPlan {
    pub guard: RelayDescriptor,
    pub middle: RelayDescriptor,
    pub exit: RelayDescriptor,
}

/// Weighted selection over one consensus snapshot.
pub struct PathSelector<'a> {
    consensus: &'a Consensus,
}

impl<'a> PathSelector<'a> {
    pub fn new(consensus: &'a Consensus) -> Self {
        Self { consensus }
    }

    /// Resolve the guard: the pinned fingerprint wins, then the persisted
    /// guard if it is still in the consensus and healthy, otherwise a
    /// fresh bandwidth-weighted pick (persisted into `state`).
    pub fn choose_guard(
        &self,
        state: &mut GuardState,
        pinned: Option<&str>,
        excluded: &HashSet<[u8; 20]>,
        now_unix: u64,
    ) -> Result<RelayDescriptor> {
        if let Some(pin) = pinned {
            let fp = decode_fp(pin)?;
            let relay = self
                .consensus
                .find(&fp)
                .ok_or_else(|| TorError::Policy(format!("pinned guard {pin} not in consensus")))?;
            return Ok(relay.clone());
        }

        if !state.needs_selection(now_unix) {
            if let Some(ref hex_fp) = state.fingerprint {
                if let Ok(fp) = decode_fp(hex_fp) {
                    if !excluded.contains(&fp) {
                        if let Some(relay) = self.consensus.find(&fp) {
                            if relay.is_guard_candidate() {
                                return Ok(relay.clone());
                            }
                        }
                    }
                }
                log::info!("persisted guard unusable, reselecting");
            }
        }

        let candidates: Vec<&RelayDescriptor> = self
            .consensus
            .relays
            .iter()
            .filter(|r| r.is_guard_candidate() && !excluded.contains(&r.fingerprint))
            .collect();
        let relay = weighted_pick(&candidates)
            .ok_or_else(|| TorError::Policy("no guard candidates in consensus".into()))?;
        state.adopt(relay, now_unix);
        Ok(relay.clone())
    }

    /// Middle: weighted, never the guard, its family, or its /16.
    pub fn choose_middle(
        &self,
        guard: &RelayDescriptor,
        excluded: &HashSet<[u8; 20]>,
    ) -> Result<RelayDescriptor> {
        let candidates: Vec<&RelayDescriptor> = self
            .consensus
            .relays
            .iter()
            .filter(|r| {
                r.is_middle_candidate()
                    && r.fingerprint != guard.fingerprint
                    && !excluded.contains(&r.fingerprint)
                    && !r.same_family(guard)
                    && !(r.slash16().is_some() && r.slash16() == guard.slash16())
            })
            .collect();
        weighted_pick(&candidates)
            .cloned()
            .ok_or_else(|| TorError::Policy("no middle candidates left".into()))
    }

    /// Exit: weighted among Exit-flagged relays whose policy permits
    /// `port`, excluding both prior hops and their families.
    pub fn choose_exit(
        &self,
        guard: &RelayDescriptor,
        middle: &RelayDescriptor,
        port: u16,
        excluded: &HashSet<[u8; 20]>,
    ) -> Result<RelayDescriptor> {
        let candidates: Vec<&RelayDescriptor> = self
            .consensus
            .relays
            .iter()
            .filter(|r| {
                r.is_exit_candidate(port)
                    && r.fingerprint != guard.fingerprint
                    && r.fingerprint != middle.fingerprint
                    && !excluded.contains(&r.fingerprint)
                    && !r.same_family(guard)
                    && !r.same_family(middle)
            })
            .collect();
        weighted_pick(&candidates)
            .cloned()
            .ok_or(TorError::NoMatchingExit(port))
    }

    /// One full path toward `port`.
    pub fn plan(
        &self,
        state: &mut GuardState,
        pinned_guard: Option<&str>,
        port: u16,
        excluded: &HashSet<[u8; 20]>,
        now_unix: u64,
    ) -> Result<PathPlan> {
        let guard = self.choose_guard(state, pinned_guard, excluded, now_unix)?;
        let middle = self.choose_middle(&guard, excluded)?;
        let exit = self.choose_exit(&guard, &middle, port, excluded)?;
        Ok(PathPlan {
            guard,
            middle,
            exit,
        })
    }
}

fn decode_fp(hex_fp: &str) -> Result<[u8; 20]> {
    let bytes = hex::decode(hex_fp)
        .map_err(|_| TorError::Config(format!("bad fingerprint hex: {hex_fp}")))?;
    bytes
        .try_into()
        .map_err(|_| TorError::Config("fingerprint must be 20 bytes".into()))
}

/// Bandwidth-weighted random pick; zero-weight relays still get a floor so
/// a sparse test consensus remains selectable.
fn weighted_pick<'a>(candidates: &[&'a RelayDescriptor]) -> Option<&'a RelayDescriptor> {
    if candidates.is_empty() {
        return None;
    }
    let weights: Vec<u64> = candidates.iter().map(|r| r.bandwidth.max(1)).collect();
    let dist = WeightedIndex::new(&weights).ok()?;
    let mut rng = rand::thread_rng();
    Some(candidates[dist.sample(&mut rng)])
}
