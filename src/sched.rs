//! Seams to the rest of the client. The connection core calls out through
//! these traits and never the other way around.

use std::{io, net::SocketAddr};

use bytes::Bytes;

use crate::{BlockInfo, RequestId, Sd, TorrentId};

// Socket plumbing. `connect` may resolve asynchronously on the event loop;
// the returned handle is valid immediately.
pub trait Connector {
    fn connect(&mut self, addr: SocketAddr) -> io::Result<Sd>;

    fn close(&mut self, sd: Sd);
}

// Read access to verified piece data.
pub trait ContentStore {
    // Number of complete pieces we have for the torrent.
    fn have_count(&self, torrent: TorrentId) -> u32;

    // Our piece bitmap in wire order, ⌈npieces/8⌉ bytes.
    fn piece_field(&self, torrent: TorrentId) -> Bytes;

    // Bytes for a block, or None if the range cannot be served.
    fn block(&mut self, torrent: TorrentId, block: BlockInfo) -> Option<Bytes>;
}

// Upload side policy: choking decisions and upload accounting.
pub trait UploadSched {
    fn on_new_peer(&mut self, peer: Sd);

    fn on_lost_peer(&mut self, peer: Sd);

    fn on_interest(&mut self, peer: Sd);

    fn on_uninterest(&mut self, peer: Sd);
}

// Download side policy: piece picking and block completion.
pub trait DownloadSched {
    fn on_new_peer(&mut self, peer: Sd);

    fn on_lost_peer(&mut self, peer: Sd);

    fn on_choke(&mut self, peer: Sd);

    fn on_unchoke(&mut self, peer: Sd);

    // Peer announced a piece, via have or bitfield.
    fn on_piece_ann(&mut self, peer: Sd, index: u32);

    // A requested block arrived.
    fn on_block(&mut self, peer: Sd, req: RequestId, block: BlockInfo, data: Bytes);
}

// Collaborators threaded through every entry point that can touch them.
pub struct Ctx<'a> {
    pub ul: &'a mut dyn UploadSched,
    pub dl: &'a mut dyn DownloadSched,
    pub cm: &'a mut dyn ContentStore,
    pub conn: &'a mut dyn Connector,
}
