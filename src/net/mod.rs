pub mod driver;

use std::{
    collections::{HashMap, VecDeque},
    net::{Ipv4Addr, SocketAddr},
};

use bytes::Bytes;

use crate::{
    config::Config,
    p2p::{NbKind, NetBuf, OutRequest, Peer, PeerError, WireEvent},
    sched::Ctx,
    Bitfield, BlockInfo, RequestId, Sd, TorrentId,
};

// Connection-side view of one torrent.
#[derive(Debug)]
pub struct Torrent {
    pub(crate) info_hash: [u8; 20],
    // Piece count from the metainfo.
    pub(crate) npieces: u32,
    // Attached peers, most recently attached first.
    pub(crate) peers: Vec<Sd>,
    pub(crate) active: bool,
}

impl Torrent {
    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn npieces(&self) -> u32 {
        self.npieces
    }

    pub fn peers(&self) -> &[Sd] {
        &self.peers
    }

    pub fn npeers(&self) -> usize {
        self.peers.len()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

// The connection registry: every live peer, which lists it is on, and the
// bandwidth queues. All protocol events and commands enter through here;
// fatal conditions never propagate out, they kill the peer.
pub struct Net {
    cfg: Config,
    peers: HashMap<Sd, Peer>,
    // Peers that have not completed a handshake yet.
    unattached: Vec<Sd>,
    torrents: HashMap<TorrentId, Torrent>,
    next_torrent: u32,
    // Peers parked by the bandwidth scheduler instead of having their raw
    // events armed.
    bw_readq: VecDeque<Sd>,
    bw_writeq: VecDeque<Sd>,
}

impl Net {
    pub fn new(cfg: Config) -> Net {
        Net {
            cfg,
            peers: HashMap::new(),
            unattached: Vec::new(),
            torrents: HashMap::new(),
            next_torrent: 0,
            bw_readq: VecDeque::new(),
            bw_writeq: VecDeque::new(),
        }
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub fn npeers(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, sd: Sd) -> Option<&Peer> {
        self.peers.get(&sd)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn unattached(&self) -> &[Sd] {
        &self.unattached
    }

    pub fn torrent(&self, torrent: TorrentId) -> Option<&Torrent> {
        self.torrents.get(&torrent)
    }

    pub fn add_torrent(&mut self, info_hash: [u8; 20], npieces: u32) -> TorrentId {
        let tid = TorrentId(self.next_torrent);
        self.next_torrent += 1;
        tracing::info!("{} registered, info hash {}", tid, hex::encode(info_hash));
        self.torrents.insert(
            tid,
            Torrent { info_hash, npieces, peers: Vec::new(), active: true },
        );
        tid
    }

    pub fn set_torrent_active(&mut self, torrent: TorrentId, active: bool) {
        if let Some(t) = self.torrents.get_mut(&torrent) {
            t.active = active;
        }
    }

    // ---- lifecycle --------------------------------------------------------

    fn create_common(&mut self, sd: Sd) -> &mut Peer {
        tracing::info!("new peer {}", sd);
        let peer = Peer::new(sd, self.cfg.max_piped_requests, self.cfg.max_piece_msgs);
        let prev = self.peers.insert(sd, peer);
        debug_assert!(prev.is_none(), "socket handle reused while peer alive");
        self.unattached.push(sd);
        self.peers.get_mut(&sd).expect("peer just inserted")
    }

    // An accepted connection. We hold our handshake until the peer's
    // info hash tells us which torrent it is for.
    pub fn create_in(&mut self, sd: Sd) {
        let p = self.create_common(sd);
        p.incoming = true;
    }

    pub fn create_out(&mut self, torrent: TorrentId, addr: SocketAddr, cx: &mut Ctx) {
        let Some(t) = self.torrents.get(&torrent) else {
            tracing::warn!("connect for unknown {}", torrent);
            return;
        };
        let info_hash = t.info_hash;
        let sd = match cx.conn.connect(addr) {
            Ok(sd) => sd,
            Err(e) => {
                tracing::warn!("connect to {} failed: {}", addr, e);
                return;
            }
        };
        let client_id = self.cfg.client_id;
        let p = self.create_common(sd);
        p.torrent = Some(torrent);
        tracing::info!("send handshake to {}", sd);
        p.send(NetBuf::shake(info_hash, client_id));
    }

    // A compact tracker entry: four IP bytes then two port bytes, both in
    // network order. Short entries are rejected.
    pub fn create_out_compact(&mut self, torrent: TorrentId, compact: &[u8], cx: &mut Ctx) {
        if compact.len() < 6 {
            tracing::warn!("short compact peer entry: {} bytes", compact.len());
            return;
        }
        let ip = Ipv4Addr::new(compact[0], compact[1], compact[2], compact[3]);
        let port = u16::from_be_bytes([compact[4], compact[5]]);
        self.create_out(torrent, SocketAddr::from((ip, port)), cx);
    }

    // Drop a peer and release everything it holds. Safe to call for an
    // already-dead handle.
    pub fn kill(&mut self, sd: Sd, cx: &mut Ctx) {
        let Some(p) = self.peers.remove(&sd) else { return };
        tracing::info!("killed {}", sd);
        if p.attached {
            if let Some(t) = p.torrent.and_then(|tid| self.torrents.get_mut(&tid)) {
                t.peers.retain(|&s| s != sd);
                if t.active {
                    cx.ul.on_lost_peer(sd);
                    cx.dl.on_lost_peer(sd);
                }
            }
        } else {
            self.unattached.retain(|&s| s != sd);
        }
        if p.on_readq {
            self.bw_readq.retain(|&s| s != sd);
        }
        if p.on_writeq {
            self.bw_writeq.retain(|&s| s != sd);
        }
        cx.conn.close(sd);
        // outq holds, input buffer and piece field drop with the peer
    }

    // ---- inbound ----------------------------------------------------------

    // Feed bytes read off the peer's socket. Decoded events are handled in
    // arrival order; a protocol error kills the peer after the events that
    // preceded it.
    pub fn receive(&mut self, sd: Sd, data: &[u8], cx: &mut Ctx) {
        let mut events = Vec::new();
        let res = match self.peers.get_mut(&sd) {
            Some(p) => p.inbound.receive(data, &mut events),
            None => return,
        };
        for ev in events {
            if !self.peers.contains_key(&sd) {
                return;
            }
            self.handle_event(sd, ev, cx);
        }
        if let Err(e) = res {
            if self.peers.contains_key(&sd) {
                tracing::warn!("{} from {}", e, sd);
                self.kill(sd, cx);
            }
        }
    }

    fn handle_event(&mut self, sd: Sd, ev: WireEvent, cx: &mut Ctx) {
        match ev {
            WireEvent::InfoHash(hash) => self.on_info_hash(sd, hash, cx),
            WireEvent::Shake(id) => self.on_shake(sd, id, cx),
            WireEvent::KeepAlive => self.on_keepalive(sd),
            WireEvent::Choke => self.on_choke(sd, cx),
            WireEvent::Unchoke => self.on_unchoke(sd, cx),
            WireEvent::Interest => self.on_interest(sd, cx),
            WireEvent::Uninterest => self.on_uninterest(sd, cx),
            WireEvent::Have(index) => self.on_have(sd, index, cx),
            WireEvent::Bitfield(field) => self.on_bitfield(sd, field, cx),
            WireEvent::Request(block) => self.on_request(sd, block, cx),
            WireEvent::Piece { index, begin, data } => self.on_piece(sd, index, begin, data, cx),
            WireEvent::Cancel(block) => self.on_cancel(sd, block),
        }
    }

    // The peer named its torrent. Outbound connections verify it against
    // the one they dialed for; inbound connections attach to it and get
    // our handshake in reply.
    fn on_info_hash(&mut self, sd: Sd, hash: [u8; 20], cx: &mut Ctx) {
        let (expected, incoming) = match self.peers.get(&sd) {
            Some(p) => (p.torrent, p.incoming),
            None => return,
        };
        let tid = if let Some(tid) = expected {
            match self.torrents.get(&tid) {
                Some(t) if t.info_hash == hash => tid,
                _ => {
                    tracing::warn!("{} from {}", PeerError::IncorrectInfoHash, sd);
                    self.kill(sd, cx);
                    return;
                }
            }
        } else {
            match self.torrents.iter().find(|(_, t)| t.info_hash == hash) {
                Some((&tid, _)) => tid,
                None => {
                    tracing::warn!("{} from {}", PeerError::UnknownTorrent, sd);
                    self.kill(sd, cx);
                    return;
                }
            }
        };
        let client_id = self.cfg.client_id;
        let Some(p) = self.peers.get_mut(&sd) else { return };
        p.torrent = Some(tid);
        if incoming {
            tracing::info!("send handshake to {}", sd);
            p.send(NetBuf::shake(hash, client_id));
        }
    }

    // Handshake complete: allocate the availability map, announce our own
    // pieces, move the peer onto its torrent and tell the schedulers.
    fn on_shake(&mut self, sd: Sd, id: [u8; 20], cx: &mut Ctx) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        let Some(tid) = p.torrent else {
            self.kill(sd, cx);
            return;
        };
        let Some(npieces) = self.torrents.get(&tid).map(|t| t.npieces) else { return };
        tracing::info!("received shake({}) from {}", String::from_utf8_lossy(&id), sd);
        p.id = Some(id);
        p.attach(npieces);

        // Announce what we have, in whichever encoding is shorter.
        let have = cx.cm.have_count(tid);
        if have > 0 {
            let field_len = (npieces + 7) / 8;
            if 9 * have < 5 + field_len {
                p.send(NetBuf::multihave(&cx.cm.piece_field(tid), npieces));
            } else {
                p.send(NetBuf::bitfield(field_len));
                p.send(NetBuf::bit_data(cx.cm.piece_field(tid)));
            }
        }

        self.unattached.retain(|&s| s != sd);
        if let Some(t) = self.torrents.get_mut(&tid) {
            t.peers.insert(0, sd);
        }
        cx.ul.on_new_peer(sd);
        cx.dl.on_new_peer(sd);
    }

    fn on_keepalive(&self, sd: Sd) {
        // Nothing to do; the I/O layer resets its read timer.
        tracing::trace!("received keep alive from {}", sd);
    }

    fn on_choke(&mut self, sd: Sd, cx: &mut Ctx) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        tracing::info!("received choke from {}", sd);
        if p.peer_choking {
            return;
        }
        if !p.my_reqs.is_empty() {
            p.on_no_reqs();
        }
        p.peer_choking = true;
        cx.dl.on_choke(sd);
        // Queued requests will not be answered under choke; pull them back.
        let mut i = 0;
        while i < p.outq.len() {
            if matches!(p.outq.get(i).map(NetBuf::kind), Some(NbKind::Request(_)))
                && unsend(p, &mut self.bw_writeq, i).is_some()
            {
                continue;
            }
            i += 1;
        }
    }

    fn on_unchoke(&mut self, sd: Sd, cx: &mut Ctx) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        tracing::info!("received unchoke from {}", sd);
        if !p.peer_choking {
            return;
        }
        p.peer_choking = false;
        cx.dl.on_unchoke(sd);
    }

    fn on_interest(&mut self, sd: Sd, cx: &mut Ctx) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        tracing::info!("received interest from {}", sd);
        if p.peer_interested {
            return;
        }
        p.peer_interested = true;
        cx.ul.on_interest(sd);
    }

    fn on_uninterest(&mut self, sd: Sd, cx: &mut Ctx) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        tracing::info!("received uninterest from {}", sd);
        if !p.peer_interested {
            return;
        }
        p.peer_interested = false;
        cx.ul.on_uninterest(sd);
    }

    fn on_have(&mut self, sd: Sd, index: u32, cx: &mut Ctx) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        tracing::info!("received have({}) from {}", index, sd);
        if index >= p.total_pieces {
            tracing::warn!("have with invalid index {} from {}", index, sd);
            self.kill(sd, cx);
            return;
        }
        if !p.piece_field[index as usize] {
            p.piece_field.set(index as usize, true);
            p.npieces += 1;
            cx.dl.on_piece_ann(sd, index);
        }
    }

    // A bitfield is only valid as the first piece announcement and must be
    // exactly ⌈npieces/8⌉ bytes.
    fn on_bitfield(&mut self, sd: Sd, field: Bytes, cx: &mut Ctx) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        tracing::info!("received bitfield from {}", sd);
        if p.npieces != 0 {
            tracing::warn!("{} from {}", PeerError::UnexpectedBitfield, sd);
            self.kill(sd, cx);
            return;
        }
        let expected = (p.total_pieces as usize + 7) / 8;
        if field.len() != expected {
            tracing::warn!("bitfield of {} bytes, expected {}, from {}", field.len(), expected, sd);
            self.kill(sd, cx);
            return;
        }
        let mut bits = Bitfield::from_vec(field.to_vec());
        bits.truncate(p.total_pieces as usize);
        let announced: Vec<u32> = bits.iter_ones().map(|i| i as u32).collect();
        p.npieces = announced.len() as u32;
        p.piece_field = bits;
        tracing::info!("{} has {}/{} pieces", sd, p.npieces, p.total_pieces);
        for index in announced {
            cx.dl.on_piece_ann(sd, index);
        }
    }

    // A block came in. Replies that match nothing outstanding (a late
    // answer to a cancelled request) are dropped.
    fn on_piece(&mut self, sd: Sd, index: u32, begin: u32, data: Bytes, cx: &mut Ctx) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        let block = BlockInfo { index, begin, length: data.len() as u32 };
        let Some(pos) = p.my_reqs.iter().position(|r| r.msg.block() == Some(block)) else {
            tracing::warn!("discarded piece({},{},{}) from {}", index, begin, data.len(), sd);
            return;
        };
        tracing::info!("received piece({},{},{}) from {}", index, begin, data.len(), sd);
        let Some(req) = p.my_reqs.remove(pos) else { return };
        cx.dl.on_block(sd, req.id, block, data);
        if p.my_reqs.is_empty() {
            p.on_no_reqs();
        }
    }

    fn on_request(&mut self, sd: Sd, block: BlockInfo, cx: &mut Ctx) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        tracing::info!(
            "received request({},{},{}) from {}",
            block.index,
            block.begin,
            block.length,
            sd
        );
        if p.no_requests {
            tracing::trace!("not serving {} until our unchoke is written", sd);
            return;
        }
        let Some(tid) = p.torrent else { return };
        let Some(content) = cx.cm.block(tid, block) else {
            tracing::warn!(
                "no content for request({},{},{}) from {}",
                block.index,
                block.begin,
                block.length,
                sd
            );
            return;
        };
        debug_assert_eq!(content.len() as u32, block.length);
        p.send(NetBuf::piece(block));
        p.send(NetBuf::torrent_data(content));
        p.npiece_msgs += 1;
        if p.npiece_msgs >= p.max_piece_msgs {
            // Flush the pipeline and stop serving until the unchoke has
            // actually been written out.
            p.send(NetBuf::choke());
            p.send(NetBuf::unchoke());
            p.no_requests = true;
        }
    }

    fn on_cancel(&mut self, sd: Sd, block: BlockInfo) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        tracing::info!(
            "received cancel({},{},{}) from {}",
            block.index,
            block.begin,
            block.length,
            sd
        );
        let pos = p.outq.iter().position(|nb| nb.kind() == NbKind::Piece(block));
        if let Some(pos) = pos {
            if unsend(p, &mut self.bw_writeq, pos).is_some() {
                // The data buffer follows its header; they go as a pair.
                let data = unsend(p, &mut self.bw_writeq, pos);
                debug_assert!(matches!(data.map(|nb| nb.kind()), Some(NbKind::TorrentData)));
            }
        }
    }

    // ---- commands ---------------------------------------------------------

    // Put a block on request. The caller checks `laden` first.
    pub fn request(&mut self, sd: Sd, req: OutRequest) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        assert!(!p.laden(), "request pipeline overflow for {}", sd);
        debug_assert!(matches!(req.msg.kind(), NbKind::Request(_)));
        tracing::info!("send {} to {}", req.msg, sd);
        let msg = req.msg.clone();
        p.my_reqs.push_back(req);
        p.send(msg);
    }

    // Take a request back. If its message has not started onto the wire it
    // is simply unsent; otherwise `cancel_msg` chases it.
    pub fn cancel(&mut self, sd: Sd, id: RequestId, cancel_msg: NetBuf) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        let Some(pos) = p.my_reqs.iter().position(|r| r.id == id) else {
            tracing::warn!("cancel for unknown request on {}", sd);
            return;
        };
        let Some(req) = p.my_reqs.remove(pos) else { return };
        let queued = p.outq.iter().position(|nb| nb.same_buf(&req.msg));
        let removed = queued.and_then(|i| unsend(p, &mut self.bw_writeq, i)).is_some();
        if !removed {
            tracing::info!("send {} to {}", cancel_msg, sd);
            p.send(cancel_msg);
        }
        if p.my_reqs.is_empty() {
            p.on_no_reqs();
        }
    }

    pub fn unchoke(&mut self, sd: Sd) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        tracing::info!("send unchoke to {}", sd);
        p.am_choking = false;
        p.send(NetBuf::unchoke());
    }

    // Choke the peer. Piece messages that are still speculative are pulled
    // back out of the queue first, header and data as a pair.
    pub fn choke(&mut self, sd: Sd) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        tracing::info!("send choke to {}", sd);
        let mut i = 0;
        while i < p.outq.len() {
            if matches!(p.outq.get(i).map(NetBuf::kind), Some(NbKind::Piece(_))) {
                if unsend(p, &mut self.bw_writeq, i).is_some() {
                    let data = unsend(p, &mut self.bw_writeq, i);
                    debug_assert!(matches!(data.map(|nb| nb.kind()), Some(NbKind::TorrentData)));
                } else {
                    // Header already on the wire: it keeps its data.
                    i += 2;
                }
                continue;
            }
            i += 1;
        }
        p.am_choking = true;
        p.send(NetBuf::choke());
    }

    // Another piece of this peer's became interesting.
    pub fn want(&mut self, sd: Sd, index: u32) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        tracing::trace!("want({}) for {}", index, sd);
        debug_assert!(p.nwant < p.npieces);
        p.nwant += 1;
        if p.nwant == 1 {
            if p.my_reqs.is_empty() {
                debug_assert!(!p.deferred_uninterest);
                // An uninterest still waiting at the tail cancels out.
                let unsent = match p.outq.len().checked_sub(1) {
                    Some(i)
                        if matches!(p.outq.get(i).map(NetBuf::kind), Some(NbKind::Uninterest)) =>
                    {
                        unsend(p, &mut self.bw_writeq, i).is_some()
                    }
                    _ => false,
                };
                if !unsent {
                    p.send(NetBuf::interest());
                }
            } else {
                debug_assert!(p.deferred_uninterest);
                p.deferred_uninterest = false;
            }
            p.am_interested = true;
        }
    }

    // The last interesting piece stopped being so. With requests still in
    // flight the uninterest is deferred until the final reply.
    pub fn unwant(&mut self, sd: Sd, index: u32) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        tracing::trace!("unwant({}) for {}", index, sd);
        debug_assert!(p.nwant > 0);
        p.nwant -= 1;
        if p.nwant == 0 {
            p.am_interested = false;
            if p.my_reqs.is_empty() {
                p.send(NetBuf::uninterest());
            } else {
                p.deferred_uninterest = true;
            }
        }
    }

    pub fn keepalive(&mut self, sd: Sd) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        tracing::trace!("send keep alive to {}", sd);
        p.send(NetBuf::keepalive());
    }

    // ---- I/O surface ------------------------------------------------------

    // (read, write) interest for the socket, or None for a dead handle.
    pub fn interest(&self, sd: Sd) -> Option<(bool, bool)> {
        let p = self.peers.get(&sd)?;
        Some((!p.on_readq, p.write_armed))
    }

    // The unwritten head of the peer's queue.
    pub fn next_write(&self, sd: Sd) -> Option<&[u8]> {
        self.peers.get(&sd)?.outq.head_chunk()
    }

    // Account bytes the socket took; applies per-message sent effects and
    // disarms the write event when the queue drains.
    pub fn wrote(&mut self, sd: Sd, n: usize) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        for nb in p.outq.advance(n) {
            p.sent(&nb);
        }
        if p.outq.is_empty() {
            if p.on_writeq {
                p.on_writeq = false;
                self.bw_writeq.retain(|&s| s != sd);
            } else {
                p.write_armed = false;
            }
        }
    }

    // ---- bandwidth queues -------------------------------------------------

    // Park the peer on the rate limiter's read queue instead of its raw
    // read event.
    pub fn defer_read(&mut self, sd: Sd) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        if !p.on_readq {
            p.on_readq = true;
            self.bw_readq.push_back(sd);
        }
    }

    // Only peers with pending output wait for write bandwidth.
    pub fn defer_write(&mut self, sd: Sd) {
        let Some(p) = self.peers.get_mut(&sd) else { return };
        if !p.on_writeq && !p.outq.is_empty() {
            p.on_writeq = true;
            p.write_armed = false;
            self.bw_writeq.push_back(sd);
        }
    }

    pub fn pop_readq(&mut self) -> Option<Sd> {
        loop {
            let sd = self.bw_readq.pop_front()?;
            if let Some(p) = self.peers.get_mut(&sd) {
                p.on_readq = false;
                return Some(sd);
            }
        }
    }

    pub fn pop_writeq(&mut self) -> Option<Sd> {
        loop {
            let sd = self.bw_writeq.pop_front()?;
            if let Some(p) = self.peers.get_mut(&sd) {
                p.on_writeq = false;
                if !p.outq.is_empty() {
                    p.write_armed = true;
                }
                return Some(sd);
            }
        }
    }
}

// Remove the outq hold at `idx` unless it has started onto the wire.
// Settles the piece-message count and the write event on success.
fn unsend(p: &mut Peer, bw_writeq: &mut VecDeque<Sd>, idx: usize) -> Option<NetBuf> {
    let nb = p.outq.unsend(idx)?;
    if nb.kind() == NbKind::TorrentData {
        debug_assert!(p.npiece_msgs > 0);
        p.npiece_msgs -= 1;
    }
    if p.outq.is_empty() {
        if p.on_writeq {
            p.on_writeq = false;
            bw_writeq.retain(|&s| s != p.sd);
        } else {
            p.write_armed = false;
        }
    }
    Some(nb)
}
