//! Traffic shaping
//!
//! Sits between the circuit engine and the carrier. Outbound cell bytes
//! pass through unchanged in order; the shaper decides how they are cut
//! into carrier messages and what cover traffic rides along:
//!
//! - `none`: passthrough, raw cells visible on the wire.
//! - `padded`: with probability p per cell, an extra PADDING cell
//!   (CSPRNG payload) follows the real one.
//! - chaff (paranoid): a PADDING cell every T seconds of idleness.
//! - `chat`/`ticker`/`video`: carrier message sizes are drawn from the
//!   profile's range. Cells are fragmented across messages, and messages
//!   that would run short are topped up with a VPADDING cell so the link
//!   stream stays valid. Random 0–50 ms delays separate messages.
//!
//! Shaping never reorders cells relative to the engine's output.

use crate::protocol::cell::CELL_LEN;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shaping profile names as they appear in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaperProfile {
    None,
    Padded,
    Chat,
    Ticker,
    Video,
}

impl ShaperProfile {
    /// Target carrier-message size range, for the profiled modes.
    fn message_range(&self) -> Option<(usize, usize)> {
        match self {
            ShaperProfile::Chat => Some((50, 200)),
            ShaperProfile::Ticker => Some((20, 100)),
            ShaperProfile::Video => Some((800, 1200)),
            _ => None,
        }
    }
}

/// Tunables derived from the profile and the paranoid flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShaperConfig {
    pub profile: ShaperProfile,

    /// Probability of an extra PADDING cell per real cell (padded mode).
    pub padding_probability: f32,

    /// Emit a PADDING cell after this much idleness (paranoid only).
    pub chaff_enabled: bool,
    pub chaff_interval_secs: u64,

    /// Upper bound of the random inter-message delay (profiled modes).
    pub max_jitter_ms: u64,
}

impl ShaperConfig {
    pub fn for_profile(profile: ShaperProfile, paranoid: bool) -> Self {
        Self {
            profile,
            padding_probability: 0.1,
            chaff_enabled: paranoid,
            chaff_interval_secs: 15,
            max_jitter_ms: if profile.message_range().is_some() { 50 } else { 0 },
        }
    }
}

/// One carrier message, with the delay to apply before sending it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub delay: Duration,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShaperStats {
    pub cells_shaped: u64,
    pub padding_cells_sent: u64,
    pub chaff_cells_sent: u64,
    pub frames_emitted: u64,
    pub total_delay_ms: u64,
}

/// Per-link shaping state.
pub struct Shaper {
    config: ShaperConfig,
    rng_state: u64,
    last_sent_ms: u64,
    stats: ShaperStats,
}

impl Shaper {
    pub fn new(config: ShaperConfig) -> Self {
        let mut seed = [0u8; 8];
        // Decision randomness only; padding payloads use the CSPRNG directly.
        let _ = getrandom::getrandom(&mut seed);
        let rng_state = u64::from_le_bytes(seed) | 1;

        Self {
            config,
            rng_state,
            last_sent_ms: crate::runtime::now_unix_millis(),
            stats: ShaperStats::default(),
        }
    }

    pub fn config(&self) -> &ShaperConfig {
        &self.config
    }

    pub fn stats(&self) -> &ShaperStats {
        &self.stats
    }

    /// Shape one outbound wire chunk (one encoded cell) into carrier
    /// frames. Cell bytes appear in the output in their original order.
    pub fn shape(&mut self, bytes: Vec<u8>) -> Vec<Frame> {
        self.stats.cells_shaped += 1;
        self.last_sent_ms = crate::runtime::now_unix_millis();

        let mut frames = match self.config.profile.message_range() {
            Some(range) => self.fragment(bytes, range),
            None => vec![Frame {
                bytes,
                delay: Duration::ZERO,
            }],
        };

        if self.config.profile == ShaperProfile::Padded
            && self.roll_float() < self.config.padding_probability
        {
            frames.push(Frame {
                bytes: padding_cell(),
                delay: Duration::ZERO,
            });
            self.stats.padding_cells_sent += 1;
        }

        self.stats.frames_emitted += frames.len() as u64;
        self.stats.total_delay_ms += frames
            .iter()
            .map(|f| f.delay.as_millis() as u64)
            .sum::<u64>();
        frames
    }

    /// Whether the idle chaff timer has fired.
    pub fn chaff_due(&self) -> bool {
        if !self.config.chaff_enabled {
            return false;
        }
        let idle = crate::runtime::now_unix_millis().saturating_sub(self.last_sent_ms);
        idle >= self.config.chaff_interval_secs * 1000
    }

    /// A chaff frame (a full PADDING cell). Resets the idle timer.
    pub fn make_chaff(&mut self) -> Frame {
        self.last_sent_ms = crate::runtime::now_unix_millis();
        self.stats.chaff_cells_sent += 1;
        Frame {
            bytes: padding_cell(),
            delay: Duration::ZERO,
        }
    }

    /// Cut `bytes` into messages whose sizes fall inside `range`, topping
    /// up a short tail with a VPADDING cell so every message (except at
    /// most the residue of pathological inputs) lands in range.
    fn fragment(&mut self, bytes: Vec<u8>, (lo, hi): (usize, usize)) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset < bytes.len() {
            let remaining = bytes.len() - offset;
            let target = lo + (self.roll() as usize % (hi - lo + 1));

            let frame_bytes = if remaining >= target {
                bytes[offset..offset + target].to_vec()
            } else {
                // Tail shorter than the drawn size. A tail already inside
                // the range ships as-is; a short one is topped up to the
                // target with link padding. VPADDING needs 7 header bytes,
                // so the target is nudged up when the deficit is tiny
                // (every profile has hi >= lo + 7).
                let mut tail = bytes[offset..].to_vec();
                if remaining < lo {
                    let target = target.max(remaining + VPADDING_MIN);
                    tail.extend(vpadding_cell(target - remaining));
                }
                tail
            };
            offset += frame_bytes.len().min(remaining);

            let delay = if self.config.max_jitter_ms > 0 {
                Duration::from_millis(self.roll() % (self.config.max_jitter_ms + 1))
            } else {
                Duration::ZERO
            };
            frames.push(Frame {
                bytes: frame_bytes,
                delay,
            });
        }

        frames
    }

    // xorshift64 for shaping decisions
    fn roll(&mut self) -> u64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        self.rng_state
    }

    fn roll_float(&mut self) -> f32 {
        (self.roll() % 10_000) as f32 / 10_000.0
    }
}

/// Minimum wire size of a VPADDING cell (4-byte circ id + cmd + length).
const VPADDING_MIN: usize = 7;

/// A full 514-byte PADDING cell (command 0, circuit 0) with a
/// CSPRNG-filled payload.
pub fn padding_cell() -> Vec<u8> {
    let mut cell = vec![0u8; CELL_LEN];
    cell[4] = 0; // PADDING
    if getrandom::getrandom(&mut cell[5..]).is_err() {
        log::warn!("CSPRNG unavailable for padding payload");
    }
    cell
}

/// A VPADDING cell sized to exactly `total` wire bytes (`total` >= 7).
fn vpadding_cell(total: usize) -> Vec<u8> {
    debug_assert!(total >= VPADDING_MIN);
    let payload_len = total - VPADDING_MIN;
    let mut cell = vec![0u8; total];
    cell[4] = 128; // VPADDING
    cell[5..7].copy_from_slice(&(payload_len as u16).to_be_bytes());
    let _ = getrandom::getrandom(&mut cell[7..]);
    cell
}
