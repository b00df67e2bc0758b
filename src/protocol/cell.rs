//! Cell codec
//!
//! The atomic unit of the link protocol. Fixed-length cells are exactly
//! 514 bytes on link protocol >= 4 (4-byte circuit ID, 1-byte command,
//! 509-byte payload); variable-length cells carry a 2-byte length prefix.
//! VERSIONS is special twice over: it is variable-length regardless of the
//! negotiated version, and it is framed with a 2-byte circuit ID because it
//! is exchanged before negotiation settles the width.
//!
//! Carriers deliver bytes, not cells, so decoding is incremental:
//! `CellCodec::decode_one` consumes a reassembly buffer and reports when it
//! needs more bytes.

use crate::error::CellError;

/// Total size of a fixed-length cell on link protocol >= 4.
pub const CELL_LEN: usize = 514;

/// Payload size of a fixed-length cell.
pub const PAYLOAD_LEN: usize = 509;

/// Relay sub-cell header: cmd(1) recognized(2) stream(2) digest(4) len(2).
pub const RELAY_HEADER_LEN: usize = 11;

/// Maximum data bytes carried by one RELAY cell.
pub const RELAY_DATA_LEN: usize = PAYLOAD_LEN - RELAY_HEADER_LEN;

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    Padding = 0,
    Create = 1,
    Created = 2,
    Relay = 3,
    Destroy = 4,
    CreateFast = 5,
    CreatedFast = 6,
    Versions = 7,
    Netinfo = 8,
    RelayEarly = 9,
    Create2 = 10,
    Created2 = 11,
    PaddingNegotiate = 12,
    Vpadding = 128,
    Certs = 129,
    AuthChallenge = 130,
    Authenticate = 131,
    Authorize = 132,
}

impl CellCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Variable-length framing applies to VERSIONS (always, even before
    /// negotiation) and every command >= 128.
    pub fn is_variable_length(cmd: u8) -> bool {
        cmd == CellCommand::Versions as u8 || cmd >= 128
    }
}

/// One link cell, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (4 bytes on link protocol >= 4; 0 for link-level cells)
    pub circuit_id: u32,

    pub command: CellCommand,

    /// Payload. Fixed-length cells keep their zero padding on decode;
    /// shorter payloads are padded out on encode.
    pub payload: Vec<u8>,
}

impl Cell {
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    pub fn relay(circuit_id: u32, payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::Relay, payload)
    }

    pub fn relay_early(circuit_id: u32, payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::RelayEarly, payload)
    }

    /// A PADDING cell whose payload the caller fills from the CSPRNG.
    pub fn padding(circuit_id: u32, payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::Padding, payload)
    }
}

/// Stateful cell codec for one link.
///
/// Starts in the pre-negotiation layout (2-byte circuit IDs, VERSIONS
/// only); after VERSIONS negotiation the caller promotes it with
/// `set_link_version`.
#[derive(Debug, Clone)]
pub struct CellCodec {
    link_version: u16,
}

impl CellCodec {
    /// Codec for a fresh link, before VERSIONS negotiation.
    pub fn new() -> Self {
        Self { link_version: 0 }
    }

    pub fn set_link_version(&mut self, version: u16) {
        self.link_version = version;
    }

    pub fn link_version(&self) -> u16 {
        self.link_version
    }

    fn circ_id_width(&self) -> usize {
        if self.link_version >= 4 {
            4
        } else {
            2
        }
    }

    /// Serialize one cell for the wire.
    pub fn encode(&self, cell: &Cell) -> Result<Vec<u8>, CellError> {
        let width = self.circ_id_width();
        let cmd = cell.command as u8;

        let mut buf = Vec::with_capacity(CELL_LEN);
        if width == 4 {
            buf.extend_from_slice(&cell.circuit_id.to_be_bytes());
        } else {
            buf.extend_from_slice(&(cell.circuit_id as u16).to_be_bytes());
        }
        buf.push(cmd);

        if CellCommand::is_variable_length(cmd) {
            if cell.payload.len() > u16::MAX as usize {
                return Err(CellError::OversizedVariable(cell.payload.len()));
            }
            buf.extend_from_slice(&(cell.payload.len() as u16).to_be_bytes());
            buf.extend_from_slice(&cell.payload);
        } else {
            if cell.payload.len() > PAYLOAD_LEN {
                return Err(CellError::OversizedVariable(cell.payload.len()));
            }
            buf.extend_from_slice(&cell.payload);
            buf.resize(width + 1 + PAYLOAD_LEN, 0);
        }

        Ok(buf)
    }

    /// Try to pull one complete cell off the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a whole cell;
    /// the consumed bytes are drained only on success.
    pub fn decode_one(&self, buf: &mut Vec<u8>) -> Result<Option<Cell>, CellError> {
        let width = self.circ_id_width();

        if buf.len() < width + 1 {
            return Ok(None);
        }

        let circuit_id = if width == 4 {
            u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
        } else {
            u16::from_be_bytes([buf[0], buf[1]]) as u32
        };
        let cmd_byte = buf[width];

        let (payload_off, total_len) = if CellCommand::is_variable_length(cmd_byte) {
            if buf.len() < width + 3 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[width + 1], buf[width + 2]]) as usize;
            (width + 3, width + 3 + len)
        } else {
            (width + 1, width + 1 + PAYLOAD_LEN)
        };

        if buf.len() < total_len {
            return Ok(None);
        }

        // Only reject the command once the frame is complete, so an unknown
        // command surfaces as a parse error rather than a stall.
        let command = CellCommand::from_u8(cmd_byte).ok_or(CellError::UnknownCommand(cmd_byte))?;

        let payload = buf[payload_off..total_len].to_vec();
        buf.drain(..total_len);

        Ok(Some(Cell {
            circuit_id,
            command,
            payload,
        }))
    }
}

impl Default for CellCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay command types (sub-commands inside RELAY cells)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    Begin = 1,
    Data = 2,
    End = 3,
    Connected = 4,
    Sendme = 5,
    Extend = 6,
    Extended = 7,
    Truncate = 8,
    Truncated = 9,
    Drop = 10,
    Resolve = 11,
    Resolved = 12,
    BeginDir = 13,
    Extend2 = 14,
    Extended2 = 15,
}

impl RelayCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }
}

/// A decoded relay sub-cell.
///
/// Layout inside the 509-byte payload: cmd(1) recognized(2) stream_id(2)
/// digest(4) length(2) data(<=498).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    pub command: RelayCommand,

    /// MUST be 0 in a fully decrypted cell; kept so the onion layer can
    /// check it jointly with the digest.
    pub recognized: u16,

    /// 0 for circuit-level relay commands.
    pub stream_id: u16,

    pub digest: [u8; 4],

    pub data: Vec<u8>,
}

impl RelayCell {
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= RELAY_DATA_LEN);
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// Serialize into a full 509-byte relay payload with the digest field
    /// zeroed. The caller computes the running digest over the result and
    /// then patches bytes 5..9.
    pub fn encode(&self) -> Result<[u8; PAYLOAD_LEN], CellError> {
        if self.data.len() > RELAY_DATA_LEN {
            return Err(CellError::OversizedVariable(self.data.len()));
        }

        let mut buf = [0u8; PAYLOAD_LEN];
        buf[0] = self.command as u8;
        buf[1..3].copy_from_slice(&self.recognized.to_be_bytes());
        buf[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        // digest bytes 5..9 stay zero
        buf[9..11].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf[11..11 + self.data.len()].copy_from_slice(&self.data);
        Ok(buf)
    }

    /// Parse a fully decrypted 509-byte relay payload.
    pub fn decode(payload: &[u8]) -> Result<Self, CellError> {
        if payload.len() < RELAY_HEADER_LEN {
            return Err(CellError::TruncatedCell {
                needed: RELAY_HEADER_LEN,
                have: payload.len(),
            });
        }

        let command =
            RelayCommand::from_u8(payload[0]).ok_or(CellError::UnknownCommand(payload[0]))?;
        let recognized = u16::from_be_bytes([payload[1], payload[2]]);
        let stream_id = u16::from_be_bytes([payload[3], payload[4]]);
        let digest = [payload[5], payload[6], payload[7], payload[8]];
        let length = u16::from_be_bytes([payload[9], payload[10]]) as usize;

        let data_end = RELAY_HEADER_LEN + length;
        if data_end > payload.len() {
            return Err(CellError::TruncatedCell {
                needed: data_end,
                have: payload.len(),
            });
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: payload[RELAY_HEADER_LEN..data_end].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_codec() -> CellCodec {
        let mut codec = CellCodec::new();
        codec.set_link_version(4);
        codec
    }

    #[test]
    fn fixed_cell_round_trip() {
        let codec = v4_codec();
        let cell = Cell::new(0x8000_2a2a, CellCommand::Create2, vec![1, 2, 3, 4]);
        let bytes = codec.encode(&cell).unwrap();
        assert_eq!(bytes.len(), CELL_LEN);

        let mut buf = bytes;
        let parsed = codec.decode_one(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(parsed.circuit_id, 0x8000_2a2a);
        assert_eq!(parsed.command, CellCommand::Create2);
        // payload is padded to full length; prefix survives
        assert_eq!(&parsed.payload[..4], &[1, 2, 3, 4]);
        assert!(parsed.payload[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn versions_is_variable_before_negotiation() {
        let codec = CellCodec::new();
        let cell = Cell::new(0, CellCommand::Versions, vec![0, 4, 0, 5]);
        let bytes = codec.encode(&cell).unwrap();
        // 2-byte circ id + cmd + 2-byte len + 4-byte payload
        assert_eq!(bytes.len(), 9);

        let mut buf = bytes;
        let parsed = codec.decode_one(&mut buf).unwrap().unwrap();
        assert_eq!(parsed.command, CellCommand::Versions);
        assert_eq!(parsed.payload, vec![0, 4, 0, 5]);
    }

    #[test]
    fn versions_is_variable_after_negotiation_too() {
        let codec = v4_codec();
        let cell = Cell::new(0, CellCommand::Versions, vec![0, 4]);
        let bytes = codec.encode(&cell).unwrap();
        assert_eq!(bytes.len(), 4 + 1 + 2 + 2);
        let mut buf = bytes;
        assert!(codec.decode_one(&mut buf).unwrap().is_some());
    }

    #[test]
    fn decode_reassembles_across_fragments() {
        let codec = v4_codec();
        let cell = Cell::relay(7, vec![0xab; PAYLOAD_LEN]);
        let bytes = codec.encode(&cell).unwrap();

        let mut buf = Vec::new();
        for chunk in bytes.chunks(100) {
            let before = codec.decode_one(&mut buf).unwrap();
            if buf.len() + chunk.len() < CELL_LEN {
                assert!(before.is_none());
            }
            buf.extend_from_slice(chunk);
        }
        let parsed = codec.decode_one(&mut buf).unwrap().unwrap();
        assert_eq!(parsed, cell);
    }

    #[test]
    fn decode_two_cells_from_one_buffer() {
        let codec = v4_codec();
        let a = Cell::relay(1, vec![1; PAYLOAD_LEN]);
        let b = Cell::new(2, CellCommand::Destroy, vec![5]);
        let mut buf = codec.encode(&a).unwrap();
        buf.extend(codec.encode(&b).unwrap());

        let first = codec.decode_one(&mut buf).unwrap().unwrap();
        assert_eq!(first.circuit_id, 1);
        let second = codec.decode_one(&mut buf).unwrap().unwrap();
        assert_eq!(second.command, CellCommand::Destroy);
        assert_eq!(second.payload[0], 5);
        assert!(codec.decode_one(&mut buf).unwrap().is_none());
    }

    #[test]
    fn unknown_command_is_reported_not_swallowed() {
        let codec = v4_codec();
        let mut buf = vec![0, 0, 0, 1, 42];
        buf.resize(CELL_LEN, 0);
        let err = codec.decode_one(&mut buf).unwrap_err();
        assert_eq!(err, CellError::UnknownCommand(42));
    }

    #[test]
    fn oversized_fixed_payload_rejected() {
        let codec = v4_codec();
        let cell = Cell::relay(1, vec![0; PAYLOAD_LEN + 1]);
        assert!(matches!(
            codec.encode(&cell),
            Err(CellError::OversizedVariable(_))
        ));
    }

    #[test]
    fn relay_cell_round_trip() {
        let relay = RelayCell::new(RelayCommand::Begin, 100, b"example.invalid:80\0".to_vec());
        let payload = relay.encode().unwrap();
        assert_eq!(payload.len(), PAYLOAD_LEN);
        // digest field zeroed by encode
        assert_eq!(&payload[5..9], &[0, 0, 0, 0]);

        let parsed = RelayCell::decode(&payload).unwrap();
        assert_eq!(parsed.command, RelayCommand::Begin);
        assert_eq!(parsed.stream_id, 100);
        assert_eq!(parsed.recognized, 0);
        assert_eq!(parsed.data, relay.data);
    }

    #[test]
    fn relay_cell_truncated_length_field() {
        let relay = RelayCell::new(RelayCommand::Data, 3, vec![9; 10]);
        let mut payload = relay.encode().unwrap();
        // claim more data than the payload holds
        payload[9..11].copy_from_slice(&600u16.to_be_bytes());
        assert!(matches!(
            RelayCell::decode(&payload),
            Err(CellError::TruncatedCell { .. })
        ));
    }
}
