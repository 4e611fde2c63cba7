use std::collections::VecDeque;

use super::{
    inbound::PeerInbound,
    netbuf::{NbKind, NetBuf},
    outq::OutQueue,
};
use crate::{Bitfield, BlockInfo, RequestId, Sd, TorrentId};

// An outstanding block request of ours: the scheduler's handle for it plus
// a hold on the shared request buffer, kept for matching the reply and for
// pulling the message back out of the outq on cancellation.
#[derive(Debug, Clone)]
pub struct OutRequest {
    pub id: RequestId,
    pub msg: NetBuf,
}

// One live connection.
#[derive(Debug)]
pub struct Peer {
    pub(crate) sd: Sd,

    // Set at creation for outbound peers, on handshake for inbound.
    pub(crate) torrent: Option<TorrentId>,

    // The peer's 20-byte id, known once the handshake completes.
    pub(crate) id: Option<[u8; 20]>,

    pub(crate) incoming: bool,
    pub(crate) attached: bool,
    pub(crate) on_readq: bool,
    pub(crate) on_writeq: bool,

    // Choke state: both sides start choked.
    pub(crate) am_choking: bool,
    pub(crate) peer_choking: bool,

    // Interest state: both sides start uninterested.
    pub(crate) am_interested: bool,
    pub(crate) peer_interested: bool,

    // Requests are ignored until the next unchoke of ours hits the wire.
    pub(crate) no_requests: bool,

    // An uninterest is owed once the last outstanding reply arrives.
    pub(crate) deferred_uninterest: bool,

    // Pieces the peer claims to have; empty until attach.
    pub(crate) piece_field: Bitfield,
    pub(crate) total_pieces: u32,
    pub(crate) npieces: u32,

    // Pieces in the field that we still want.
    pub(crate) nwant: u32,

    // Outbound block requests awaiting replies, oldest first.
    pub(crate) my_reqs: VecDeque<OutRequest>,

    // Piece messages currently held in the outq.
    pub(crate) npiece_msgs: u32,

    pub(crate) outq: OutQueue,
    pub(crate) write_armed: bool,

    pub(crate) inbound: PeerInbound,

    // Caps copied out of the config at creation.
    pub(crate) max_piped_requests: u32,
    pub(crate) max_piece_msgs: u32,
}

impl Peer {
    pub(crate) fn new(sd: Sd, max_piped_requests: u32, max_piece_msgs: u32) -> Peer {
        Peer {
            sd,
            torrent: None,
            id: None,
            incoming: false,
            attached: false,
            on_readq: false,
            on_writeq: false,
            am_choking: true,
            peer_choking: true,
            am_interested: false,
            peer_interested: false,
            no_requests: false,
            deferred_uninterest: false,
            piece_field: Bitfield::new(),
            total_pieces: 0,
            npieces: 0,
            nwant: 0,
            my_reqs: VecDeque::new(),
            npiece_msgs: 0,
            outq: OutQueue::new(),
            write_armed: false,
            inbound: PeerInbound::new(),
            max_piped_requests,
            max_piece_msgs,
        }
    }

    pub fn sd(&self) -> Sd {
        self.sd
    }

    pub fn torrent(&self) -> Option<TorrentId> {
        self.torrent
    }

    pub fn id(&self) -> Option<[u8; 20]> {
        self.id
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn nreqs_out(&self) -> u32 {
        self.my_reqs.len() as u32
    }

    pub fn npiece_msgs(&self) -> u32 {
        self.npiece_msgs
    }

    pub fn npieces(&self) -> u32 {
        self.npieces
    }

    pub fn nwant(&self) -> u32 {
        self.nwant
    }

    pub fn outq(&self) -> &OutQueue {
        &self.outq
    }

    pub fn write_armed(&self) -> bool {
        self.write_armed
    }

    // Outstanding requests, oldest first, for the download scheduler to
    // walk when it reassigns work.
    pub fn outstanding(&self) -> impl Iterator<Item = (RequestId, BlockInfo)> + '_ {
        self.my_reqs.iter().filter_map(|r| r.msg.block().map(|b| (r.id, b)))
    }

    // Whether the peer currently chokes us.
    pub fn chokes(&self) -> bool {
        self.peer_choking
    }

    pub fn has(&self, index: u32) -> bool {
        self.piece_field.get(index as usize).map(|b| *b).unwrap_or(false)
    }

    // Request pipeline is at capacity.
    pub fn laden(&self) -> bool {
        self.my_reqs.len() as u32 >= self.max_piped_requests
    }

    pub fn wanted(&self) -> bool {
        self.am_interested
    }

    // We may request: interested and not choked by the peer.
    pub fn leech_ok(&self) -> bool {
        self.am_interested && !self.peer_choking
    }

    pub fn active_down(&self) -> bool {
        self.leech_ok() || !self.my_reqs.is_empty()
    }

    pub fn active_up(&self) -> bool {
        (self.peer_interested && !self.am_choking) || self.npiece_msgs > 0
    }

    // The peer claims every piece of the torrent.
    pub fn full(&self) -> bool {
        self.attached && self.npieces == self.total_pieces
    }

    // Whether `block` is already on request to this peer.
    pub fn requested(&self, block: BlockInfo) -> bool {
        self.my_reqs.iter().any(|r| r.msg.block() == Some(block))
    }

    // Hold a buffer for writing; arms the write event on the empty-queue
    // transition.
    pub(crate) fn send(&mut self, nb: NetBuf) {
        tracing::trace!("queue {} for {}", nb, self.sd);
        if self.outq.push(nb) {
            debug_assert!(!self.on_writeq);
            self.write_armed = true;
        }
    }

    // Allocate the availability map once the torrent is known.
    pub(crate) fn attach(&mut self, total_pieces: u32) {
        self.piece_field = Bitfield::repeat(false, total_pieces as usize);
        self.total_pieces = total_pieces;
        self.attached = true;
    }

    // Bookkeeping for a buffer that hit the wire in full.
    pub(crate) fn sent(&mut self, nb: &NetBuf) {
        tracing::trace!("sent {} to {}", nb, self.sd);
        match nb.kind() {
            NbKind::Unchoke => self.no_requests = false,
            NbKind::TorrentData => {
                debug_assert!(self.npiece_msgs > 0);
                self.npiece_msgs -= 1;
            }
            _ => {}
        }
    }

    // The last outstanding reply came in (or was written off); settle a
    // deferred uninterest.
    pub(crate) fn on_no_reqs(&mut self) {
        if self.deferred_uninterest {
            debug_assert_eq!(self.nwant, 0);
            self.deferred_uninterest = false;
            self.send(NetBuf::uninterest());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_flags() {
        let p = Peer::new(Sd(1), 10, 64);
        assert!(p.am_choking && p.peer_choking);
        assert!(!p.am_interested && !p.peer_interested);
        assert!(!p.attached && !p.write_armed);
        assert_eq!(p.nreqs_out(), 0);
    }

    #[test]
    fn test_predicates_follow_flags() {
        let mut p = Peer::new(Sd(1), 2, 64);
        p.attach(4);
        assert!(p.chokes());
        assert!(!p.wanted() && !p.leech_ok() && !p.active_down() && !p.active_up());

        p.peer_choking = false;
        p.am_interested = true;
        assert!(p.leech_ok() && p.active_down());

        p.peer_interested = true;
        assert!(!p.active_up());
        p.am_choking = false;
        assert!(p.active_up());

        assert!(!p.full());
        p.piece_field = Bitfield::repeat(true, 4);
        p.npieces = 4;
        assert!(p.full());
    }

    #[test]
    fn test_laden_and_requested() {
        let mut p = Peer::new(Sd(1), 2, 64);
        let block = BlockInfo { index: 0, begin: 0, length: 0x4000 };
        p.my_reqs.push_back(OutRequest { id: RequestId(1), msg: NetBuf::request(block) });
        assert!(p.requested(block));
        assert!(!p.laden());
        let other = BlockInfo { index: 1, begin: 0, length: 0x4000 };
        p.my_reqs.push_back(OutRequest { id: RequestId(2), msg: NetBuf::request(other) });
        assert!(p.laden());
    }

    #[test]
    fn test_sent_effects() {
        let mut p = Peer::new(Sd(1), 10, 64);
        p.no_requests = true;
        p.npiece_msgs = 1;
        p.sent(&NetBuf::torrent_data(bytes::Bytes::from_static(&[0])));
        assert_eq!(p.npiece_msgs, 0);
        assert!(p.no_requests);
        p.sent(&NetBuf::unchoke());
        assert!(!p.no_requests);
    }
}
