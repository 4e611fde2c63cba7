use bytes::{Buf, Bytes, BytesMut};

use super::{PeerError, Result, PROTOCOL};
use crate::BlockInfo;

// Largest message length field we accept; enough for any block a sane peer
// sends plus the piece header, and for bitfields of very large torrents.
const MAX_MESSAGE_LEN: usize = (1 << 17) + 9;

// Handshake prefix: pstrlen + pstr + reserved.
const SHAKE_PSTR_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InState {
    ShakePstr,
    ShakeInfoHash,
    ShakeId,
    MsgLen,
    MsgId { len: usize },
    Payload { id: u8, len: usize },
    PieceHeader { data_len: usize },
    PieceData { index: u32, begin: u32 },
    // A protocol error was seen; no further input is accepted.
    Poisoned,
}

// Decoded wire traffic, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    InfoHash([u8; 20]),
    Shake([u8; 20]),
    KeepAlive,
    Choke,
    Unchoke,
    Interest,
    Uninterest,
    Have(u32),
    Bitfield(Bytes),
    Request(BlockInfo),
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel(BlockInfo),
}

// Incremental decoder. Buffers input until the current state's byte count
// is available, then steps; partial reads resume transparently.
#[derive(Debug)]
pub struct PeerInbound {
    state: InState,
    needed: usize,
    buf: BytesMut,
}

impl Default for PeerInbound {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerInbound {
    pub fn new() -> PeerInbound {
        PeerInbound {
            state: InState::ShakePstr,
            needed: SHAKE_PSTR_LEN,
            buf: BytesMut::new(),
        }
    }

    fn set(&mut self, state: InState, needed: usize) {
        self.state = state;
        self.needed = needed;
    }

    // Feed bytes off the socket. Decoded events are appended to `out`;
    // events decoded before a protocol error still get delivered.
    pub fn receive(&mut self, data: &[u8], out: &mut Vec<WireEvent>) -> Result<()> {
        if self.state == InState::Poisoned {
            return Ok(());
        }
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.needed {
            let chunk = self.buf.split_to(self.needed).freeze();
            if let Err(e) = self.step(chunk, out) {
                self.set(InState::Poisoned, usize::MAX);
                return Err(e);
            }
        }
        Ok(())
    }

    fn step(&mut self, mut chunk: Bytes, out: &mut Vec<WireEvent>) -> Result<()> {
        match self.state {
            InState::ShakePstr => {
                if chunk[0] != 19 || chunk[1..20] != PROTOCOL {
                    return Err(PeerError::IncorrectProtocol);
                }
                // Reserved bytes are ignored; we speak no extensions.
                self.set(InState::ShakeInfoHash, 20);
            }
            InState::ShakeInfoHash => {
                let mut hash = [0; 20];
                chunk.copy_to_slice(&mut hash);
                out.push(WireEvent::InfoHash(hash));
                self.set(InState::ShakeId, 20);
            }
            InState::ShakeId => {
                let mut id = [0; 20];
                chunk.copy_to_slice(&mut id);
                out.push(WireEvent::Shake(id));
                self.set(InState::MsgLen, 4);
            }
            InState::MsgLen => {
                let len = chunk.get_u32() as usize;
                if len == 0 {
                    out.push(WireEvent::KeepAlive);
                } else if len > MAX_MESSAGE_LEN {
                    return Err(PeerError::OversizedMessage(len as u32));
                } else {
                    self.set(InState::MsgId { len }, 1);
                }
            }
            InState::MsgId { len } => {
                let id = chunk[0];
                let payload = len - 1;
                match (id, payload) {
                    (0, 0) => self.emit(out, WireEvent::Choke),
                    (1, 0) => self.emit(out, WireEvent::Unchoke),
                    (2, 0) => self.emit(out, WireEvent::Interest),
                    (3, 0) => self.emit(out, WireEvent::Uninterest),
                    (4, 4) | (6, 12) | (8, 12) => self.set(InState::Payload { id, len: payload }, payload),
                    (5, 0) => self.emit(out, WireEvent::Bitfield(Bytes::new())),
                    (5, _) => self.set(InState::Payload { id, len: payload }, payload),
                    (7, _) if payload >= 8 => self.set(InState::PieceHeader { data_len: payload - 8 }, 8),
                    (0..=8, _) => return Err(PeerError::InvalidMessage),
                    _ => return Err(PeerError::InvalidMessageId(id)),
                }
            }
            InState::Payload { id, .. } => {
                let ev = match id {
                    4 => WireEvent::Have(chunk.get_u32()),
                    5 => WireEvent::Bitfield(chunk),
                    6 | 8 => {
                        let block = BlockInfo {
                            index: chunk.get_u32(),
                            begin: chunk.get_u32(),
                            length: chunk.get_u32(),
                        };
                        if id == 6 {
                            WireEvent::Request(block)
                        } else {
                            WireEvent::Cancel(block)
                        }
                    }
                    _ => unreachable!("payload state for id {}", id),
                };
                self.emit(out, ev);
            }
            InState::PieceHeader { data_len } => {
                let index = chunk.get_u32();
                let begin = chunk.get_u32();
                if data_len == 0 {
                    self.emit(out, WireEvent::Piece { index, begin, data: Bytes::new() });
                } else {
                    self.set(InState::PieceData { index, begin }, data_len);
                }
            }
            InState::PieceData { index, begin } => {
                self.emit(out, WireEvent::Piece { index, begin, data: chunk });
            }
            InState::Poisoned => unreachable!(),
        }
        Ok(())
    }

    // Message complete: hand it up and wait for the next length prefix.
    fn emit(&mut self, out: &mut Vec<WireEvent>, ev: WireEvent) {
        out.push(ev);
        self.set(InState::MsgLen, 4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::NetBuf;

    fn shaken() -> (PeerInbound, Vec<WireEvent>) {
        let mut dec = PeerInbound::new();
        let mut out = Vec::new();
        let shake = NetBuf::shake([0xab; 20], [0x2d; 20]);
        dec.receive(shake.data(), &mut out).unwrap();
        (dec, out)
    }

    #[test]
    fn test_decode_handshake() {
        let (_, out) = shaken();
        assert_eq!(out, vec![WireEvent::InfoHash([0xab; 20]), WireEvent::Shake([0x2d; 20])]);
    }

    #[test]
    fn test_decode_msg_stream() {
        let (mut dec, mut out) = shaken();
        out.clear();

        let mut buf = Vec::new();
        // Keep alive
        buf.extend_from_slice(&[0, 0, 0, 0]);
        // Choke, unchoke, interested, not interested
        buf.extend_from_slice(&[0, 0, 0, 1, 0]);
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);
        buf.extend_from_slice(&[0, 0, 0, 1, 3]);
        // Have
        buf.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 0xb]);
        // Bitfield
        buf.extend_from_slice(&[0, 0, 0, 4, 5, 0x1, 0x2, 0x3]);
        // Request
        buf.extend_from_slice(&[0, 0, 0, 0xd, 6, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Piece
        buf.extend_from_slice(&[0, 0, 0, 12, 7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1, 0x2, 0x3]);
        // Cancel
        buf.extend_from_slice(&[0, 0, 0, 0xd, 8, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);

        dec.receive(&buf, &mut out).unwrap();
        let block = BlockInfo { index: 0xb, begin: 0x134000, length: 0x4000 };
        assert_eq!(
            out,
            vec![
                WireEvent::KeepAlive,
                WireEvent::Choke,
                WireEvent::Unchoke,
                WireEvent::Interest,
                WireEvent::Uninterest,
                WireEvent::Have(0xb),
                WireEvent::Bitfield(Bytes::from_static(&[0x1, 0x2, 0x3])),
                WireEvent::Request(block),
                WireEvent::Piece {
                    index: 0xb,
                    begin: 0x134000,
                    data: Bytes::from_static(&[0x1, 0x2, 0x3])
                },
                WireEvent::Cancel(block),
            ]
        );
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let mut dec = PeerInbound::new();
        let mut out = Vec::new();
        let mut stream = NetBuf::shake([0x11; 20], [0x22; 20]).data().to_vec();
        stream.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 7]);
        for b in stream {
            dec.receive(&[b], &mut out).unwrap();
        }
        assert_eq!(
            out,
            vec![
                WireEvent::InfoHash([0x11; 20]),
                WireEvent::Shake([0x22; 20]),
                WireEvent::Have(7),
            ]
        );
    }

    #[test]
    fn test_decode_bad_protocol() {
        let mut dec = PeerInbound::new();
        let mut out = Vec::new();
        let mut shake = NetBuf::shake([0; 20], [0; 20]).data().to_vec();
        shake[3] = b'x';
        let err = dec.receive(&shake, &mut out).unwrap_err();
        assert!(matches!(err, PeerError::IncorrectProtocol));
        // Poisoned: further input is ignored.
        dec.receive(&[0, 0, 0, 0], &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_decode_invalid_id() {
        let (mut dec, mut out) = shaken();
        let err = dec.receive(&[0, 0, 0, 1, 255], &mut out).unwrap_err();
        assert!(matches!(err, PeerError::InvalidMessageId(255)));
    }

    #[test]
    fn test_decode_length_mismatch() {
        // A choke with a payload is garbage.
        let (mut dec, mut out) = shaken();
        let err = dec.receive(&[0, 0, 0, 2, 0, 0], &mut out).unwrap_err();
        assert!(matches!(err, PeerError::InvalidMessage));
    }

    #[test]
    fn test_decode_oversized_length() {
        let (mut dec, mut out) = shaken();
        let err = dec.receive(&[0x7f, 0, 0, 0], &mut out).unwrap_err();
        assert!(matches!(err, PeerError::OversizedMessage(_)));
    }

    #[test]
    fn test_events_before_error_are_kept() {
        let (mut dec, mut out) = shaken();
        out.clear();
        let mut buf = vec![0, 0, 0, 1, 0]; // choke
        buf.extend_from_slice(&[0, 0, 0, 1, 9]); // unknown id
        let err = dec.receive(&buf, &mut out).unwrap_err();
        assert!(matches!(err, PeerError::InvalidMessageId(9)));
        assert_eq!(out, vec![WireEvent::Choke]);
    }
}
