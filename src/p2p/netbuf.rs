use bytes::{BufMut, Bytes, BytesMut};

use super::PROTOCOL;
use crate::BlockInfo;

// Message tag. Request/piece/cancel keep their fields readable for logging
// and for matching queue entries against cancellations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbKind {
    Shake,

    KeepAlive,

    Choke,

    Unchoke,

    Interest,

    Uninterest,

    Have { index: u32 },

    // Bitfield is split in two buffers: the length-and-id header, and the
    // raw field bytes, so the field itself can be shared without copying.
    Bitfield,

    BitData,

    // A run of have messages; an alternative encoding of our bitmap chosen
    // when it is the shorter of the two.
    Multihave,

    Request(BlockInfo),

    // The 13-byte prefix of a piece message. The block bytes follow in a
    // separate TorrentData buffer.
    Piece(BlockInfo),

    TorrentData,

    Cancel(BlockInfo),
}

// One wire message, fully serialized. Holds are cheap: cloning shares the
// backing storage, so the same request buffer can sit in several peers'
// queues at once.
#[derive(Debug, Clone)]
pub struct NetBuf {
    kind: NbKind,
    data: Bytes,
}

impl NetBuf {
    pub fn kind(&self) -> NbKind {
        self.kind
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    // Field accessors for the tags that carry a block range.
    pub fn block(&self) -> Option<BlockInfo> {
        match self.kind {
            NbKind::Request(b) | NbKind::Piece(b) | NbKind::Cancel(b) => Some(b),
            _ => None,
        }
    }

    pub fn index(&self) -> Option<u32> {
        match self.kind {
            NbKind::Have { index } => Some(index),
            _ => self.block().map(|b| b.index),
        }
    }

    // True when two holds refer to the same underlying buffer.
    pub fn same_buf(&self, other: &NetBuf) -> bool {
        self.data.as_ptr() == other.data.as_ptr() && self.data.len() == other.data.len()
    }

    pub fn shake(info_hash: [u8; 20], peer_id: [u8; 20]) -> NetBuf {
        let mut buf = BytesMut::with_capacity(68);
        buf.put_u8(19);
        buf.extend_from_slice(&PROTOCOL);
        buf.extend_from_slice(&[0; 8]);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);
        debug_assert_eq!(buf.len(), 68);
        NetBuf { kind: NbKind::Shake, data: buf.freeze() }
    }

    // [0, 0, 0, 0]
    pub fn keepalive() -> NetBuf {
        NetBuf { kind: NbKind::KeepAlive, data: Bytes::from_static(&[0, 0, 0, 0]) }
    }

    // [0, 0, 0, 1, 0]
    pub fn choke() -> NetBuf {
        NetBuf { kind: NbKind::Choke, data: Bytes::from_static(&[0, 0, 0, 1, 0]) }
    }

    // [0, 0, 0, 1, 1]
    pub fn unchoke() -> NetBuf {
        NetBuf { kind: NbKind::Unchoke, data: Bytes::from_static(&[0, 0, 0, 1, 1]) }
    }

    // [0, 0, 0, 1, 2]
    pub fn interest() -> NetBuf {
        NetBuf { kind: NbKind::Interest, data: Bytes::from_static(&[0, 0, 0, 1, 2]) }
    }

    // [0, 0, 0, 1, 3]
    pub fn uninterest() -> NetBuf {
        NetBuf { kind: NbKind::Uninterest, data: Bytes::from_static(&[0, 0, 0, 1, 3]) }
    }

    // have: <len=0005><id=4><piece index>
    pub fn have(index: u32) -> NetBuf {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u32(5);
        buf.put_u8(4);
        buf.put_u32(index);
        NetBuf { kind: NbKind::Have { index }, data: buf.freeze() }
    }

    // bitfield: <len=0001+X><id=5>; the X field bytes travel in bit_data.
    pub fn bitfield(field_len: u32) -> NetBuf {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u32(1 + field_len);
        buf.put_u8(5);
        NetBuf { kind: NbKind::Bitfield, data: buf.freeze() }
    }

    pub fn bit_data(field: Bytes) -> NetBuf {
        NetBuf { kind: NbKind::BitData, data: field }
    }

    // One have message per set bit of `field`, concatenated.
    pub fn multihave(field: &[u8], npieces: u32) -> NetBuf {
        let mut buf = BytesMut::new();
        for index in 0..npieces {
            if has_bit(field, index) {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(index);
            }
        }
        NetBuf { kind: NbKind::Multihave, data: buf.freeze() }
    }

    // request: <len=0013><id=6><index><begin><length>
    pub fn request(block: BlockInfo) -> NetBuf {
        NetBuf { kind: NbKind::Request(block), data: block_msg(6, block) }
    }

    // cancel: <len=0013><id=8><index><begin><length>
    pub fn cancel(block: BlockInfo) -> NetBuf {
        NetBuf { kind: NbKind::Cancel(block), data: block_msg(8, block) }
    }

    // piece: <len=0009+X><id=7><index><begin>; X data bytes follow in a
    // TorrentData buffer.
    pub fn piece(block: BlockInfo) -> NetBuf {
        let mut buf = BytesMut::with_capacity(13);
        buf.put_u32(9 + block.length);
        buf.put_u8(7);
        buf.put_u32(block.index);
        buf.put_u32(block.begin);
        NetBuf { kind: NbKind::Piece(block), data: buf.freeze() }
    }

    pub fn torrent_data(data: Bytes) -> NetBuf {
        NetBuf { kind: NbKind::TorrentData, data }
    }
}

fn block_msg(id: u8, block: BlockInfo) -> Bytes {
    let mut buf = BytesMut::with_capacity(17);
    buf.put_u32(13);
    buf.put_u8(id);
    buf.put_u32(block.index);
    buf.put_u32(block.begin);
    buf.put_u32(block.length);
    buf.freeze()
}

pub(crate) fn has_bit(field: &[u8], index: u32) -> bool {
    let byte = (index / 8) as usize;
    byte < field.len() && field[byte] & (0x80 >> (index % 8)) != 0
}

impl std::fmt::Display for NetBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            NbKind::Shake => write!(f, "shake"),
            NbKind::KeepAlive => write!(f, "keep alive"),
            NbKind::Choke => write!(f, "choke"),
            NbKind::Unchoke => write!(f, "unchoke"),
            NbKind::Interest => write!(f, "interest"),
            NbKind::Uninterest => write!(f, "uninterest"),
            NbKind::Have { index } => write!(f, "have({})", index),
            NbKind::Bitfield => write!(f, "bitfield"),
            NbKind::BitData => write!(f, "bitdata with {} bytes", self.data.len()),
            NbKind::Multihave => write!(f, "multihave with {} haves", self.data.len() / 9),
            NbKind::Request(b) => write!(f, "request({},{},{})", b.index, b.begin, b.length),
            NbKind::Piece(b) => write!(f, "piece({},{},{})", b.index, b.begin, b.length),
            NbKind::TorrentData => write!(f, "data with {} bytes", self.data.len()),
            NbKind::Cancel(b) => write!(f, "cancel({},{},{})", b.index, b.begin, b.length),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_control_encodings() {
        assert_eq!(NetBuf::keepalive().data()[..], [0, 0, 0, 0]);
        assert_eq!(NetBuf::choke().data()[..], [0, 0, 0, 1, 0]);
        assert_eq!(NetBuf::unchoke().data()[..], [0, 0, 0, 1, 1]);
        assert_eq!(NetBuf::interest().data()[..], [0, 0, 0, 1, 2]);
        assert_eq!(NetBuf::uninterest().data()[..], [0, 0, 0, 1, 3]);
    }

    #[test]
    fn test_have_encoding() {
        let nb = NetBuf::have(0xb);
        assert_eq!(nb.data()[..], [0, 0, 0, 5, 4, 0, 0, 0, 0xb]);
        assert_eq!(nb.index(), Some(0xb));
    }

    #[test]
    fn test_request_encoding() {
        let block = BlockInfo { index: 0xb, begin: 0x134000, length: 0x4000 };
        let nb = NetBuf::request(block);
        assert_eq!(
            nb.data()[..],
            [0, 0, 0, 0xd, 6, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]
        );
        assert_eq!(nb.block(), Some(block));
    }

    #[test]
    fn test_piece_split_encoding() {
        let block = BlockInfo { index: 1, begin: 0, length: 3 };
        let hdr = NetBuf::piece(block);
        let data = NetBuf::torrent_data(Bytes::from_static(&[0xa, 0xb, 0xc]));
        assert_eq!(hdr.data()[..], [0, 0, 0, 12, 7, 0, 0, 0, 1, 0, 0, 0, 0]);
        assert_eq!(data.data()[..], [0xa, 0xb, 0xc]);
    }

    #[test]
    fn test_shake_encoding() {
        let info_hash = hex!("a0a1a2a3a4a5a6a7a8a9aaabacadaeafb0b1b2b3");
        let nb = NetBuf::shake(info_hash, *b"-PW0010-000000000000");
        assert_eq!(nb.len(), 68);
        assert_eq!(nb.data()[0], 19);
        assert_eq!(&nb.data()[1..20], b"BitTorrent protocol");
        assert_eq!(&nb.data()[28..48], &info_hash);
    }

    #[test]
    fn test_bitfield_split_encoding() {
        let hdr = NetBuf::bitfield(3);
        assert_eq!(hdr.data()[..], [0, 0, 0, 4, 5]);
        let data = NetBuf::bit_data(Bytes::from_static(&[0x1, 0x2, 0x3]));
        assert_eq!(data.data()[..], [0x1, 0x2, 0x3]);
    }

    #[test]
    fn test_multihave_encoding() {
        // bits 0 and 10 set
        let nb = NetBuf::multihave(&[0x80, 0x20], 16);
        assert_eq!(nb.data()[..], [0, 0, 0, 5, 4, 0, 0, 0, 0, 0, 0, 0, 5, 4, 0, 0, 0, 10]);
    }

    #[test]
    fn test_shared_holds() {
        let nb = NetBuf::request(BlockInfo { index: 1, begin: 2, length: 3 });
        let other = nb.clone();
        assert!(nb.same_buf(&other));
        assert!(!nb.same_buf(&NetBuf::request(BlockInfo { index: 1, begin: 2, length: 3 })));
    }
}
