//! Wire formats: uplinked command frames, the remote-channel RPC used to
//! reach simulated peripherals, and the portmapper that names them.
//!
//! All multi-byte integers are big-endian.

use crate::error::{Error, Result};
use crate::frame::Frame;
use static_assertions::{const_assert, const_assert_eq};
use std::io::{Read, Write};

// Command frame: [MAC:3][SEQ:3][SSID:1][CMD:1][payload]
pub const MAC_SIZE: usize = 3;
pub const SEQUENCE_SIZE: usize = 3;
pub const COMMAND_HEADER_SIZE: usize = 8;
// Response frame: [SEQ:3][SSID:1][RESULT:1][output]
pub const RESPONSE_HEADER_SIZE: usize = 5;

pub const MAX_SEQUENCE_NUMBER: u32 = 0x00FF_FFF0;
pub const IMAGE_FRAGMENT_SEQUENCE: u32 = 0x00FF_FFFD;
pub const TEST_SEQUENCE: u32 = 0x00FF_FFFE;
pub const BEACON_SEQUENCE: u32 = 0x00FF_FFFF;

const_assert_eq!(COMMAND_HEADER_SIZE, MAC_SIZE + SEQUENCE_SIZE + 2);
const_assert_eq!(RESPONSE_HEADER_SIZE, SEQUENCE_SIZE + 2);
const_assert!(MAX_SEQUENCE_NUMBER < IMAGE_FRAGMENT_SEQUENCE);

/// Decoded command frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub mac: u32,
    pub sequence: u32,
    pub ssid: u8,
    pub command: u8,
}

/// Writes a complete authenticated command frame and leaves it ready for
/// reading from the MAC field.
pub fn encode_command(
    frame: &mut Frame,
    key: &[u8],
    sequence: u32,
    ssid: u8,
    command: u8,
    payload: &[u8],
) -> Result<()> {
    frame.reset();
    frame.put_u24(0)?;
    frame.put_u24(sequence)?;
    frame.put_u8(ssid)?;
    frame.put_u8(command)?;
    frame.put_bytes(payload)?;
    frame.reset_for_reading();

    frame.advance(MAC_SIZE as isize)?;
    let mac = frame.compute_mac(sequence, key);
    frame.advance(-(MAC_SIZE as isize))?;
    frame.put_u24(mac)?;
    frame.advance(-(MAC_SIZE as isize))
}

/// Response header fields of a downlinked frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub sequence: u32,
    pub ssid: u8,
    pub result: Result<()>,
}

pub fn decode_response(frame: &mut Frame) -> Result<ResponseHeader> {
    if !frame.has_enough_data(RESPONSE_HEADER_SIZE) {
        return Err(Error::NoSpace);
    }
    let sequence = frame.get_u24_unchecked();
    let ssid = frame.get_u8_unchecked();
    let result = Error::from_code(frame.get_u8_unchecked());
    Ok(ResponseHeader { sequence, ssid, result })
}

// Link record: [LEN:2][command or response frame]. The uplink and downlink
// are byte streams; records are what keep frames apart on them.
pub const LINK_LENGTH_SIZE: usize = 2;

/// `[LEN:2][payload]` as bytes for a byte-stream link.
pub fn link_record(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| Error::NoSpace)?;
    let mut out = Vec::with_capacity(LINK_LENGTH_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Writes a link record into `frame`: a length prefix, then whatever
/// `fill` writes after it. On error the frame holds a partial record.
pub fn write_link_record<F>(frame: &mut Frame, fill: F) -> Result<()>
where
    F: FnOnce(&mut Frame) -> Result<()>,
{
    let start = frame.position();
    frame.put_u16(0)?;
    fill(frame)?;

    let len = frame.position() - start - LINK_LENGTH_SIZE;
    let prefix = u16::try_from(len).map_err(|_| Error::NoSpace)?;
    frame.advance(-((len + LINK_LENGTH_SIZE) as isize))?;
    frame.put_u16(prefix)?;
    frame.advance(len as isize)
}

/// Reassembles link records from the chunks a byte-stream recv returns.
///
/// Records may be split across chunks or share one. A record longer than
/// `max_record` is reported once as `NoSpace` and its bytes are skipped as
/// they arrive.
#[derive(Debug)]
pub struct LinkDeframer {
    pending: Vec<u8>,
    skip: usize,
    max_record: usize,
}

impl LinkDeframer {
    pub fn new(max_record: usize) -> Self {
        Self {
            pending: Vec::new(),
            skip: 0,
            max_record,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Buffered bytes not yet returned as a record.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// The next complete record, `None` until one has fully arrived.
    pub fn next_record(&mut self) -> Option<Result<Vec<u8>>> {
        if self.skip > 0 {
            let n = self.skip.min(self.pending.len());
            self.pending.drain(..n);
            self.skip -= n;
            if self.skip > 0 {
                return None;
            }
        }
        if self.pending.len() < LINK_LENGTH_SIZE {
            return None;
        }

        let len = usize::from(u16::from_be_bytes([self.pending[0], self.pending[1]]));
        if len > self.max_record {
            self.pending.drain(..LINK_LENGTH_SIZE);
            self.skip = len;
            return Some(Err(Error::NoSpace));
        }
        if self.pending.len() < LINK_LENGTH_SIZE + len {
            return None;
        }
        let record = self.pending[LINK_LENGTH_SIZE..LINK_LENGTH_SIZE + len].to_vec();
        self.pending.drain(..LINK_LENGTH_SIZE + len);
        Some(Ok(record))
    }
}

// Remote channel opcodes.
pub const OP_OPEN: u8 = 1;
pub const OP_CLOSE: u8 = 2;
pub const OP_SEND: u8 = 3;
pub const OP_RECV: u8 = 4;
pub const OP_TRANSACT: u8 = 5;

// Portmapper opcodes.
pub const PORTMAP_PING: u8 = 1;
pub const PORTMAP_GET_STATUS: u8 = 2;
pub const PORTMAP_PONG: &[u8; 5] = b"PONG1";

/// Upper bound on any length field accepted from the wire.
pub const MAX_REMOTE_PAYLOAD: u32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRequest {
    Open { config: String },
    Close,
    Send { data: Vec<u8> },
    Recv { len: u32 },
    Transact { delay_ms: u32, recv_len: u32, data: Vec<u8> },
}

impl RemoteRequest {
    pub fn opcode(&self) -> u8 {
        match self {
            RemoteRequest::Open { .. } => OP_OPEN,
            RemoteRequest::Close => OP_CLOSE,
            RemoteRequest::Send { .. } => OP_SEND,
            RemoteRequest::Recv { .. } => OP_RECV,
            RemoteRequest::Transact { .. } => OP_TRANSACT,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode()];
        match self {
            RemoteRequest::Open { config } => {
                out.extend_from_slice(&(config.len() as u32).to_be_bytes());
                out.extend_from_slice(config.as_bytes());
            }
            RemoteRequest::Close => {}
            RemoteRequest::Send { data } => {
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
            }
            RemoteRequest::Recv { len } => {
                out.extend_from_slice(&len.to_be_bytes());
            }
            RemoteRequest::Transact { delay_ms, recv_len, data } => {
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(&delay_ms.to_be_bytes());
                out.extend_from_slice(&recv_len.to_be_bytes());
                out.extend_from_slice(data);
            }
        }
        out
    }
}

/// Reply to a [`RemoteRequest`]. `written` is only on the wire for SEND and
/// TRANSACT, `data` only for RECV and TRANSACT.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteResponse {
    pub result: u8,
    pub written: u32,
    pub data: Vec<u8>,
}

impl RemoteResponse {
    pub fn status(code: u8) -> Self {
        Self {
            result: code,
            ..Self::default()
        }
    }

    pub fn encode(&self, opcode: u8) -> Vec<u8> {
        let mut out = vec![self.result];
        if matches!(opcode, OP_SEND | OP_TRANSACT) {
            out.extend_from_slice(&self.written.to_be_bytes());
        }
        if matches!(opcode, OP_RECV | OP_TRANSACT) {
            out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
            out.extend_from_slice(&self.data);
        }
        out
    }

    pub fn read_from<R: Read>(reader: &mut R, opcode: u8) -> Result<Self> {
        let mut response = Self::status(read_u8(reader)?);
        if matches!(opcode, OP_SEND | OP_TRANSACT) {
            response.written = read_u32(reader)?;
        }
        if matches!(opcode, OP_RECV | OP_TRANSACT) {
            let len = read_u32(reader)?;
            if len > MAX_REMOTE_PAYLOAD {
                return Err(Error::NoSpace);
            }
            response.data = vec![0u8; len as usize];
            reader.read_exact(&mut response.data)?;
        }
        Ok(response)
    }
}

/// Sends one request and waits for its reply.
pub fn call<S: Read + Write>(stream: &mut S, request: &RemoteRequest) -> Result<RemoteResponse> {
    stream.write_all(&request.encode())?;
    stream.flush()?;
    RemoteResponse::read_from(stream, request.opcode())
}

pub fn encode_get_status(name: &str) -> Vec<u8> {
    let mut out = vec![PORTMAP_GET_STATUS];
    out.extend_from_slice(&(name.len() as u32).to_be_bytes());
    out.extend_from_slice(name.as_bytes());
    out
}

/// Port and run state a portmapper reports for one peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeripheralStatus {
    pub port: u16,
    pub running: bool,
}

impl PeripheralStatus {
    pub const SIZE: usize = 3;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let [hi, lo] = self.port.to_be_bytes();
        [hi, lo, u8::from(self.running)]
    }

    pub fn decode(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            port: u16::from_be_bytes([bytes[0], bytes[1]]),
            running: bytes[2] != 0,
        }
    }
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transact_request_layout() {
        let request = RemoteRequest::Transact {
            delay_ms: 5,
            recv_len: 2,
            data: vec![0xAA],
        };
        assert_eq!(
            request.encode(),
            vec![OP_TRANSACT, 0, 0, 0, 1, 0, 0, 0, 5, 0, 0, 0, 2, 0xAA]
        );
    }

    #[test]
    fn test_response_fields_depend_on_opcode() {
        let response = RemoteResponse {
            result: 0,
            written: 3,
            data: vec![1, 2],
        };
        assert_eq!(response.encode(OP_CLOSE), vec![0]);
        assert_eq!(response.encode(OP_SEND), vec![0, 0, 0, 0, 3]);
        assert_eq!(response.encode(OP_RECV), vec![0, 0, 0, 0, 2, 1, 2]);

        let bytes = response.encode(OP_TRANSACT);
        let decoded = RemoteResponse::read_from(&mut bytes.as_slice(), OP_TRANSACT).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_encoded_command_authenticates() {
        let key = b"ground-key";
        let mut frame = Frame::with_capacity(32);
        encode_command(&mut frame, key, 42, 1, 7, &[0xDE, 0xAD]).unwrap();

        assert_eq!(frame.position(), 0);
        assert_eq!(frame.available_data(), COMMAND_HEADER_SIZE + 2);
        let mac = frame.get_u24().unwrap();
        frame.verify_mac(mac, 42, key).unwrap();
        assert_eq!(frame.get_u24().unwrap(), 42);
        assert_eq!(frame.get_u8().unwrap(), 1);
        assert_eq!(frame.get_u8().unwrap(), 7);
    }

    #[test]
    fn test_deframer_splits_and_joins_chunks() {
        let mut stream = link_record(b"one").unwrap();
        stream.extend(link_record(b"three").unwrap());

        let mut deframer = LinkDeframer::new(16);
        deframer.push(&stream[..6]);
        assert_eq!(deframer.next_record(), Some(Ok(b"one".to_vec())));
        assert_eq!(deframer.next_record(), None);
        deframer.push(&stream[6..]);
        assert_eq!(deframer.next_record(), Some(Ok(b"three".to_vec())));
        assert_eq!(deframer.next_record(), None);
        assert_eq!(deframer.pending(), 0);
    }

    #[test]
    fn test_deframer_skips_oversized_record() {
        let mut stream = link_record(&[0xEE; 20]).unwrap();
        stream.extend(link_record(b"ok").unwrap());

        let mut deframer = LinkDeframer::new(8);
        deframer.push(&stream[..10]);
        assert_eq!(deframer.next_record(), Some(Err(Error::NoSpace)));
        assert_eq!(deframer.next_record(), None);
        deframer.push(&stream[10..]);
        assert_eq!(deframer.next_record(), Some(Ok(b"ok".to_vec())));
    }

    #[test]
    fn test_write_link_record_prefixes_length() {
        let mut frame = Frame::with_capacity(8);
        write_link_record(&mut frame, |f| f.put_bytes(&[7, 8, 9])).unwrap();
        assert_eq!(frame.written(), &[0, 3, 7, 8, 9]);
    }

    #[test]
    fn test_peripheral_status_layout() {
        let status = PeripheralStatus { port: 0x1F90, running: true };
        assert_eq!(status.encode(), [0x1F, 0x90, 1]);
        assert_eq!(PeripheralStatus::decode(status.encode()), status);
    }
}
