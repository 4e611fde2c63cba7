//! The event loop around the connection core. One task owns the core and
//! every socket; readiness-driven reads feed the decoder and writes drain
//! each peer's outq head, so the core's byte accounting stays exact.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use tokio::{
    io::Interest,
    net::{TcpListener, TcpStream},
    time,
};

use super::Net;
use crate::{
    p2p::PeerError,
    sched::{Connector, ContentStore, Ctx, DownloadSched, UploadSched},
    Config, Sd, TorrentId,
};

const READ_CHUNK: usize = 16 * 1024;

// Hands out socket handles synchronously; the actual dials and closes are
// settled on the event loop afterwards.
struct SocketTable {
    next_sd: u64,
    dialing: Vec<(Sd, SocketAddr)>,
    closing: Vec<Sd>,
}

impl SocketTable {
    fn alloc(&mut self) -> Sd {
        let sd = Sd(self.next_sd);
        self.next_sd += 1;
        sd
    }
}

impl Connector for SocketTable {
    fn connect(&mut self, addr: SocketAddr) -> io::Result<Sd> {
        let sd = self.alloc();
        self.dialing.push((sd, addr));
        Ok(sd)
    }

    fn close(&mut self, sd: Sd) {
        self.closing.push(sd);
    }
}

enum Ev {
    Accepted(TcpStream, SocketAddr),
    Dialed(Sd, io::Result<TcpStream>),
    Ready(Sd, io::Result<tokio::io::Ready>),
    Tick,
}

pub struct Driver {
    core: Net,
    ul: Box<dyn UploadSched>,
    dl: Box<dyn DownloadSched>,
    cm: Box<dyn ContentStore>,
    table: SocketTable,
    socks: HashMap<Sd, TcpStream>,
    listener: TcpListener,
    connecting: FuturesUnordered<BoxFuture<'static, (Sd, io::Result<TcpStream>)>>,
    // When each peer's pending output last made progress.
    stalled: HashMap<Sd, Instant>,
    last_keepalive: Instant,
}

impl Driver {
    pub fn new(
        cfg: Config,
        listener: TcpListener,
        ul: Box<dyn UploadSched>,
        dl: Box<dyn DownloadSched>,
        cm: Box<dyn ContentStore>,
    ) -> Driver {
        Driver {
            core: Net::new(cfg),
            ul,
            dl,
            cm,
            table: SocketTable { next_sd: 0, dialing: Vec::new(), closing: Vec::new() },
            socks: HashMap::new(),
            listener,
            connecting: FuturesUnordered::new(),
            stalled: HashMap::new(),
            last_keepalive: Instant::now(),
        }
    }

    pub fn core(&self) -> &Net {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Net {
        &mut self.core
    }

    pub fn connect_peer(&mut self, torrent: TorrentId, addr: SocketAddr) {
        {
            let (core, mut cx) = self.split();
            core.create_out(torrent, addr, &mut cx);
        }
        self.sweep();
    }

    #[tracing::instrument(skip_all, name = "net")]
    pub async fn run(&mut self) -> io::Result<()> {
        let mut ticker = time::interval(Duration::from_secs(1));
        loop {
            let ev = {
                let core = &self.core;
                let mut ready: FuturesUnordered<_> = self
                    .socks
                    .iter()
                    .filter_map(|(&sd, sock)| {
                        let interest = match core.interest(sd)? {
                            (true, true) => Interest::READABLE | Interest::WRITABLE,
                            (true, false) => Interest::READABLE,
                            (false, true) => Interest::WRITABLE,
                            (false, false) => return None,
                        };
                        Some(async move { (sd, sock.ready(interest).await) })
                    })
                    .collect();

                tokio::select! {
                    r = self.listener.accept() => {
                        let (sock, addr) = r?;
                        Ev::Accepted(sock, addr)
                    }
                    Some((sd, r)) = self.connecting.next() => Ev::Dialed(sd, r),
                    Some((sd, r)) = ready.next() => Ev::Ready(sd, r),
                    _ = ticker.tick() => Ev::Tick,
                }
            };

            match ev {
                Ev::Accepted(sock, addr) => {
                    let sd = self.table.alloc();
                    tracing::info!("accepted connection to {} from {}", sd, addr);
                    self.socks.insert(sd, sock);
                    self.core.create_in(sd);
                }
                Ev::Dialed(sd, Ok(sock)) => {
                    if self.core.peer(sd).is_some() {
                        tracing::info!("outbound connection for {} established", sd);
                        self.socks.insert(sd, sock);
                    }
                }
                Ev::Dialed(sd, Err(e)) => self.kill(sd, PeerError::Io(e)),
                Ev::Ready(sd, Ok(ready)) => {
                    if ready.is_readable() || ready.is_read_closed() {
                        self.read_ready(sd);
                    }
                    if ready.is_writable() && self.core.peer(sd).is_some() {
                        self.write_ready(sd);
                    }
                }
                Ev::Ready(sd, Err(e)) => self.kill(sd, PeerError::Io(e)),
                Ev::Tick => self.tick(),
            }

            self.sweep();
        }
    }

    fn split(&mut self) -> (&mut Net, Ctx<'_>) {
        (
            &mut self.core,
            Ctx {
                ul: &mut *self.ul,
                dl: &mut *self.dl,
                cm: &mut *self.cm,
                conn: &mut self.table,
            },
        )
    }

    // Settle dials and closes the core asked for since the last pass.
    fn sweep(&mut self) {
        for sd in self.table.closing.drain(..) {
            self.socks.remove(&sd);
            self.stalled.remove(&sd);
        }
        for (sd, addr) in self.table.dialing.drain(..) {
            self.connecting
                .push(Box::pin(async move { (sd, TcpStream::connect(addr).await) }));
        }
    }

    fn kill(&mut self, sd: Sd, err: PeerError) {
        tracing::warn!("dropping {}: {}", sd, err);
        let (core, mut cx) = self.split();
        core.kill(sd, &mut cx);
    }

    fn read_ready(&mut self, sd: Sd) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let res = match self.socks.get(&sd) {
                Some(sock) => sock.try_read(&mut buf),
                None => return,
            };
            match res {
                Ok(0) => {
                    self.kill(sd, PeerError::Io(io::ErrorKind::UnexpectedEof.into()));
                    return;
                }
                Ok(n) => {
                    {
                        let (core, mut cx) = self.split();
                        core.receive(sd, &buf[..n], &mut cx);
                    }
                    if self.core.peer(sd).is_none() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.kill(sd, PeerError::Io(e));
                    return;
                }
            }
        }
    }

    fn write_ready(&mut self, sd: Sd) {
        loop {
            let res = {
                let Some(sock) = self.socks.get(&sd) else { return };
                let Some(chunk) = self.core.next_write(sd) else { break };
                sock.try_write(chunk)
            };
            match res {
                Ok(n) => {
                    self.core.wrote(sd, n);
                    self.stalled.insert(sd, Instant::now());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.kill(sd, PeerError::Io(e));
                    return;
                }
            }
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();

        // Queued output that cannot drain means a dead or wedged peer.
        let timeout = self.core.cfg().write_timeout;
        let mut stuck = Vec::new();
        for &sd in self.socks.keys() {
            if matches!(self.core.interest(sd), Some((_, true))) {
                let since = *self.stalled.entry(sd).or_insert(now);
                if now.duration_since(since) >= timeout {
                    stuck.push(sd);
                }
            } else {
                self.stalled.remove(&sd);
            }
        }
        for sd in stuck {
            self.kill(sd, PeerError::Timeout);
        }

        if now.duration_since(self.last_keepalive) >= self.core.cfg().keepalive_interval {
            self.last_keepalive = now;
            let idle: Vec<Sd> = self
                .core
                .peers()
                .filter(|p| p.is_attached() && p.outq().is_empty())
                .map(|p| p.sd())
                .collect();
            for sd in idle {
                self.core.keepalive(sd);
            }
        }
    }
}
