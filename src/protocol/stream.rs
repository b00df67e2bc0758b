//! Stream multiplexer
//!
//! Streams nest inside their circuit: BEGIN opens one toward `host:port`
//! through the exit, DATA cells carry at most 498 bytes each, END closes
//! with a reason byte. Each stream has its own SENDME windows on top of
//! the circuit-level ones.

use crate::error::{Result, TorError};
use crate::events::Event;
use crate::protocol::cell::{RelayCell, RelayCommand, RELAY_DATA_LEN};
use crate::protocol::circuit::{Circuit, CircuitState, END_REASON_DONE};
use crate::protocol::flow::{RecvWindow, SendWindow};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    New,
    Connecting,
    Open,
    HalfClosed,
    Closed,
}

/// One stream inside a circuit.
pub struct Stream {
    pub id: u16,
    pub state: StreamState,
    pub send_window: SendWindow,
    pub recv_window: RecvWindow,

    /// Ordered bytes delivered by RELAY_DATA, awaiting `read_stream`.
    pub inbound: VecDeque<u8>,

    /// END reason once the stream closed.
    pub end_reason: Option<u8>,

    pub host: String,
    pub port: u16,
}

/// The circuit's stream table plus ID allocation.
pub struct StreamMap {
    streams: HashMap<u16, Stream>,
    next_id: u16,
}

impl StreamMap {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
            next_id: 1,
        }
    }

    /// Allocate an unused stream ID (2 bytes, never 0).
    pub fn allocate(&mut self, host: &str, port: u16) -> u16 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            if !self.streams.contains_key(&id) {
                self.streams.insert(
                    id,
                    Stream {
                        id,
                        state: StreamState::New,
                        send_window: SendWindow::stream(),
                        recv_window: RecvWindow::stream(),
                        inbound: VecDeque::new(),
                        end_reason: None,
                        host: host.to_string(),
                        port,
                    },
                );
                return id;
            }
        }
    }

    pub fn get(&self, id: u16) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn remove(&mut self, id: u16) -> Option<Stream> {
        self.streams.remove(&id)
    }

    pub fn open_ids(&self) -> Vec<u16> {
        self.streams
            .values()
            .filter(|s| {
                matches!(
                    s.state,
                    StreamState::Connecting | StreamState::Open | StreamState::HalfClosed
                )
            })
            .map(|s| s.id)
            .collect()
    }

    pub fn close_all(&mut self) {
        for stream in self.streams.values_mut() {
            stream.state = StreamState::Closed;
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for StreamMap {
    fn default() -> Self {
        Self::new()
    }
}

impl Circuit {
    /// Open a stream to `host:port`: RELAY_BEGIN with the address, a NUL,
    /// and a 4-byte flags word, then wait for CONNECTED (or END with the
    /// refusal reason).
    pub async fn open_stream(&mut self, host: &str, port: u16) -> Result<u16> {
        if self.state() != CircuitState::Ready {
            return Err(TorError::bad_state(format!(
                "open_stream on {:?} circuit",
                self.state()
            )));
        }

        let stream_id = self.streams.allocate(host, port);

        let mut body = format!("{host}:{port}").into_bytes();
        body.push(0);
        body.extend_from_slice(&0u32.to_be_bytes()); // flags
        if body.len() > RELAY_DATA_LEN {
            self.streams.remove(stream_id);
            return Err(TorError::Protocol("BEGIN target too long".into()));
        }

        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.state = StreamState::Connecting;
        }
        self.send_relay(stream_id, RelayCommand::Begin, body).await?;
        log::debug!("stream {stream_id}: BEGIN {host}:{port}");

        // Pump until this stream resolves; unrelated events are deferred
        // for the next next_event() call.
        loop {
            let event = match self.pump_one().await? {
                Some(ev) => ev,
                None => continue,
            };
            match event {
                Event::StreamOpened { stream_id: sid, .. } if sid == stream_id => {
                    return Ok(stream_id);
                }
                Event::StreamClosed {
                    stream_id: sid,
                    reason,
                    ..
                } if sid == stream_id => {
                    self.streams.remove(stream_id);
                    return Err(TorError::StreamEnd(reason));
                }
                Event::CircuitFailed { .. } => {
                    self.deferred_events.push_back(event);
                    return Err(TorError::CircuitClosed);
                }
                other => self.deferred_events.push_back(other),
            }
        }
    }

    /// Write bytes to an open stream, splitting into <=498-byte RELAY_DATA
    /// cells and honoring both window levels. Blocks (cooperatively) on a
    /// zero window until SENDMEs credit it.
    pub async fn write_stream(&mut self, stream_id: u16, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(RELAY_DATA_LEN) {
            loop {
                let stream = self
                    .streams
                    .get(stream_id)
                    .ok_or(TorError::StreamEnd(0))?;
                match stream.state {
                    StreamState::Open => {}
                    StreamState::HalfClosed | StreamState::Closed => {
                        return Err(TorError::StreamEnd(
                            stream.end_reason.unwrap_or(END_REASON_DONE),
                        ));
                    }
                    _ => return Err(TorError::bad_state("write before CONNECTED")),
                }

                if stream.send_window.can_send() && self.circuit_window_open() {
                    break;
                }
                // Window exhausted: wait for the peer's SENDME.
                if let Some(ev) = self.pump_one().await? {
                    self.deferred_events.push_back(ev);
                }
            }

            let cell = RelayCell::new(RelayCommand::Data, stream_id, chunk.to_vec());
            let digest = self.send_relay_cell(cell, false).await?;
            self.note_data_sent(digest)?;
            self.streams
                .get_mut(stream_id)
                .expect("stream checked above")
                .send_window
                .record_sent(digest)?;
        }
        Ok(())
    }

    /// Read whatever contiguous bytes are available, pumping the circuit
    /// until the stream has data, hits EOF, or fails. Partial reads are
    /// normal; `Ok(0)` means the stream ended.
    pub async fn read_stream(&mut self, stream_id: u16, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let stream = self
                .streams
                .get_mut(stream_id)
                .ok_or(TorError::StreamEnd(0))?;

            if !stream.inbound.is_empty() {
                let n = buf.len().min(stream.inbound.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = stream.inbound.pop_front().expect("checked non-empty");
                }
                return Ok(n);
            }

            if stream.state == StreamState::Closed {
                return Ok(0);
            }

            if let Some(ev) = self.pump_one().await? {
                match ev {
                    Event::CircuitFailed { .. } => {
                        self.deferred_events.push_back(ev);
                        return Err(TorError::CircuitClosed);
                    }
                    other => self.deferred_events.push_back(other),
                }
            }
        }
    }

    /// Close a stream with END reason DONE. The stream goes half-closed
    /// (we may still drain inbound data) until the remote's END lands.
    /// Closing twice is a no-op; a race with the peer's close is harmless
    /// because remote END is always accepted.
    pub async fn close_stream(&mut self, stream_id: u16) -> Result<()> {
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return Ok(());
        };
        if matches!(stream.state, StreamState::Closed | StreamState::HalfClosed) {
            return Ok(());
        }
        stream.state = StreamState::HalfClosed;
        stream.end_reason = Some(END_REASON_DONE);

        self.send_relay(stream_id, RelayCommand::End, vec![END_REASON_DONE])
            .await?;
        self.deferred_events.push_back(Event::StreamClosed {
            circuit_id: self.id(),
            stream_id,
            reason: END_REASON_DONE,
        });
        Ok(())
    }

    /// The END reason recorded for a closed stream.
    pub fn stream_end_reason(&self, stream_id: u16) -> Option<u8> {
        self.streams.get(stream_id).and_then(|s| s.end_reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_skips_zero_and_reuses_gaps() {
        let mut map = StreamMap::new();
        let a = map.allocate("example.com", 80);
        let b = map.allocate("example.com", 443);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);

        map.remove(a);
        // wrap the counter: the freed ID must eventually come back without
        // colliding with the live one
        map.next_id = u16::MAX;
        let c = map.allocate("x", 1);
        assert_eq!(c, u16::MAX);
        let d = map.allocate("x", 1);
        assert_ne!(d, 0);
        assert_ne!(d, b);
        assert_ne!(d, c);
    }

    #[test]
    fn open_ids_reflect_live_states() {
        let mut map = StreamMap::new();
        let a = map.allocate("a", 1);
        let b = map.allocate("b", 2);
        map.get_mut(a).unwrap().state = StreamState::Open;
        map.get_mut(b).unwrap().state = StreamState::Closed;
        assert_eq!(map.open_ids(), vec![a]);

        map.close_all();
        assert!(map.open_ids().is_empty());
    }
}
