use std::collections::VecDeque;

use super::netbuf::NetBuf;

// FIFO of buffers waiting for the wire. Only the head may have been
// partially written; everything behind it is still speculative and can be
// pulled back out.
#[derive(Debug, Default)]
pub struct OutQueue {
    bufs: VecDeque<NetBuf>,
    // Bytes of the head buffer already written.
    head_off: usize,
}

impl OutQueue {
    pub fn new() -> OutQueue {
        OutQueue::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn head_off(&self) -> usize {
        self.head_off
    }

    pub fn get(&self, idx: usize) -> Option<&NetBuf> {
        self.bufs.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetBuf> {
        self.bufs.iter()
    }

    // Appends a hold. Returns true when the queue was empty, i.e. the
    // caller must arm the write event.
    pub fn push(&mut self, nb: NetBuf) -> bool {
        let was_empty = self.bufs.is_empty();
        debug_assert!(!was_empty || self.head_off == 0);
        self.bufs.push_back(nb);
        was_empty
    }

    // The unwritten remainder of the head buffer.
    pub fn head_chunk(&self) -> Option<&[u8]> {
        self.bufs.front().map(|nb| &nb.data()[self.head_off..])
    }

    // Account `n` bytes written off the head. Returns the buffers that
    // became fully written, in order.
    pub fn advance(&mut self, mut n: usize) -> Vec<NetBuf> {
        let mut done = Vec::new();
        while let Some(head) = self.bufs.front() {
            let remaining = head.len() - self.head_off;
            if n >= remaining {
                n -= remaining;
                self.head_off = 0;
                done.extend(self.bufs.pop_front());
            } else {
                self.head_off += n;
                return done;
            }
        }
        debug_assert_eq!(n, 0, "advanced past queued bytes");
        done
    }

    // Remove the hold at `idx` unless it is the partially written head,
    // which is already committed to the wire.
    pub fn unsend(&mut self, idx: usize) -> Option<NetBuf> {
        if idx == 0 && self.head_off > 0 {
            return None;
        }
        let nb = self.bufs.remove(idx);
        debug_assert!(!self.bufs.is_empty() || self.head_off == 0);
        nb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::NbKind;
    use crate::p2p::NetBuf;
    use crate::BlockInfo;

    fn req(index: u32) -> NetBuf {
        NetBuf::request(BlockInfo { index, begin: 0, length: 0x4000 })
    }

    #[test]
    fn test_push_reports_empty_transition() {
        let mut q = OutQueue::new();
        assert!(q.push(NetBuf::choke()));
        assert!(!q.push(NetBuf::unchoke()));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_advance_across_boundaries() {
        let mut q = OutQueue::new();
        q.push(NetBuf::choke()); // 5 bytes
        q.push(NetBuf::have(3)); // 9 bytes
        assert!(q.advance(2).is_empty());
        assert_eq!(q.head_off(), 2);
        // Finishes the choke and eats into the have.
        let done = q.advance(4);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].kind(), NbKind::Choke);
        assert_eq!(q.head_off(), 1);
        let done = q.advance(8);
        assert_eq!(done.len(), 1);
        assert!(q.is_empty());
        assert_eq!(q.head_off(), 0);
    }

    #[test]
    fn test_unsend_guards_partial_head() {
        let mut q = OutQueue::new();
        q.push(req(0));
        q.push(req(1));
        q.advance(1);
        // Head has a byte on the wire: not removable.
        assert!(q.unsend(0).is_none());
        // Entries behind it are.
        assert!(q.unsend(1).is_some());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_unsend_unwritten_head() {
        let mut q = OutQueue::new();
        q.push(req(0));
        let nb = q.unsend(0).unwrap();
        assert_eq!(nb.block().unwrap().index, 0);
        assert!(q.is_empty());
        assert_eq!(q.head_off(), 0);
    }
}
