mod inbound;
mod netbuf;
mod outq;
mod peer;

pub use inbound::{PeerInbound, WireEvent};
pub use netbuf::{NbKind, NetBuf};
pub use outq::OutQueue;
pub use peer::{OutRequest, Peer};

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

type Result<T> = std::result::Result<T, PeerError>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no torrent with the offered info-hash")]
    UnknownTorrent,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("message length {0} out of range")]
    OversizedMessage(u32),

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("bitfield after piece announcements")]
    UnexpectedBitfield,

    #[error("connection timeout")]
    Timeout,
}
