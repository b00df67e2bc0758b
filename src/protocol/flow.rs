//! SENDME flow control
//!
//! Windows per the link protocol: circuits start at 1000 cells with SENDME
//! credits of 100; streams start at 500 with credits of 50. The sender may
//! never overrun its window; the receiver must acknowledge before the
//! sender's window would reach zero.
//!
//! SENDMEs are version 1: the body carries the 20-byte running digest of
//! the last acknowledged DATA cell, and the sender validates it against
//! its own ledger before crediting the window.

use crate::error::{Result, TorError};
use std::collections::VecDeque;
use subtle::ConstantTimeEq;

pub const CIRCUIT_SEND_WINDOW: u16 = 1000;
pub const CIRCUIT_SENDME_INCREMENT: u16 = 100;
pub const STREAM_SEND_WINDOW: u16 = 500;
pub const STREAM_SENDME_INCREMENT: u16 = 50;

/// SENDME version we emit and require.
const SENDME_VERSION: u8 = 1;

/// Encode a v1 SENDME body: version(1) | len(2) | digest(20).
pub fn encode_sendme(digest: &[u8; 20]) -> Vec<u8> {
    let mut body = Vec::with_capacity(23);
    body.push(SENDME_VERSION);
    body.extend_from_slice(&20u16.to_be_bytes());
    body.extend_from_slice(digest);
    body
}

/// Parse and require a v1 SENDME body.
pub fn parse_sendme(body: &[u8]) -> Result<[u8; 20]> {
    if body.len() < 3 {
        return Err(TorError::Protocol("SENDME body too short".into()));
    }
    if body[0] != SENDME_VERSION {
        return Err(TorError::Protocol(format!(
            "unsupported SENDME version {}",
            body[0]
        )));
    }
    let len = u16::from_be_bytes([body[1], body[2]]) as usize;
    if len != 20 || body.len() < 3 + 20 {
        return Err(TorError::Protocol("SENDME digest must be 20 bytes".into()));
    }
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&body[3..23]);
    Ok(digest)
}

/// Sender-side window plus the digest ledger of SENDMEs we expect back.
///
/// Every `increment`-th DATA cell sent records its full running digest;
/// the peer's SENDME must echo that digest exactly before the window is
/// credited.
#[derive(Debug)]
pub struct SendWindow {
    window: u16,
    increment: u16,
    sent_since_mark: u16,
    expected_acks: VecDeque<[u8; 20]>,
}

impl SendWindow {
    pub fn circuit() -> Self {
        Self::new(CIRCUIT_SEND_WINDOW, CIRCUIT_SENDME_INCREMENT)
    }

    pub fn stream() -> Self {
        Self::new(STREAM_SEND_WINDOW, STREAM_SENDME_INCREMENT)
    }

    fn new(initial: u16, increment: u16) -> Self {
        Self {
            window: initial,
            increment,
            sent_since_mark: 0,
            expected_acks: VecDeque::new(),
        }
    }

    pub fn remaining(&self) -> u16 {
        self.window
    }

    pub fn can_send(&self) -> bool {
        self.window > 0
    }

    /// Account one DATA cell going out. `digest` is the full running
    /// digest the onion layer committed for this cell.
    pub fn record_sent(&mut self, digest: [u8; 20]) -> Result<()> {
        if self.window == 0 {
            return Err(TorError::bad_state("send past exhausted window"));
        }
        self.window -= 1;
        self.sent_since_mark += 1;
        if self.sent_since_mark == self.increment {
            self.sent_since_mark = 0;
            self.expected_acks.push_back(digest);
        }
        Ok(())
    }

    /// Credit the window for a validated SENDME. The carried digest must
    /// match the ledger entry for the acknowledged cell.
    pub fn handle_sendme(&mut self, digest: &[u8; 20]) -> Result<()> {
        let expected = self
            .expected_acks
            .pop_front()
            .ok_or_else(|| TorError::Protocol("SENDME with no outstanding data".into()))?;

        if expected[..].ct_eq(&digest[..]).unwrap_u8() != 1 {
            return Err(TorError::Protocol("SENDME digest does not match ledger".into()));
        }

        self.window = self.window.saturating_add(self.increment);
        Ok(())
    }
}

/// Receiver-side accounting: counts delivered DATA cells and says when a
/// SENDME (with which digest) must go back.
#[derive(Debug)]
pub struct RecvWindow {
    /// Cells the peer may still send before it must stop.
    credit: u16,
    increment: u16,
    unacked: u16,
}

impl RecvWindow {
    pub fn circuit() -> Self {
        Self::new(CIRCUIT_SEND_WINDOW, CIRCUIT_SENDME_INCREMENT)
    }

    pub fn stream() -> Self {
        Self::new(STREAM_SEND_WINDOW, STREAM_SENDME_INCREMENT)
    }

    fn new(initial: u16, increment: u16) -> Self {
        Self {
            credit: initial,
            increment,
            unacked: 0,
        }
    }

    /// Account one DATA cell coming in. Returns the digest to acknowledge
    /// when the unacked count reaches the increment; the caller must then
    /// actually emit the SENDME (the credit is granted here).
    pub fn record_received(&mut self, digest: [u8; 20]) -> Result<Option<[u8; 20]>> {
        if self.credit == 0 {
            // The peer ignored our window: it sent more than it was allowed.
            return Err(TorError::Protocol("peer exceeded its send window".into()));
        }
        self.credit -= 1;
        self.unacked += 1;

        if self.unacked == self.increment {
            self.unacked = 0;
            self.credit = self.credit.saturating_add(self.increment);
            Ok(Some(digest))
        } else {
            Ok(None)
        }
    }
}
