mod block;
mod config;
pub mod net;
pub mod p2p;
pub mod sched;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use block::BlockInfo;
pub use config::{random_client_id, Config};

// Opaque socket handle. The I/O layer owns the actual sockets and maps
// handles back to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sd(pub u64);

impl std::fmt::Display for Sd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TorrentId(pub u32);

impl std::fmt::Display for TorrentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "torrent#{}", self.0)
    }
}

// Identifies an outstanding block request. Allocated and owned by the
// download scheduler; the peer only carries it back in on_block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);
