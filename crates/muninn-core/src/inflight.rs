//! Correlation of written requests to eventual replies.
//!
//! Replies on a connection arrive in the order their requests were written,
//! so the table is fundamentally a FIFO queue. Correlation indices are
//! reused through a free list to bound memory; a sequence number guards
//! each slot so a stale deadline can never fire against a reused index.
//!
//! A timed-out or cancelled entry is *orphaned*, not removed: it keeps its
//! position in the queue and swallows the reply that eventually arrives for
//! it. Removing it would desynchronize every later reply on the wire.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use muninn_proto::Frame;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::Error;

/// Completion sink for one request.
pub type Responder = oneshot::Sender<Result<Frame, Error>>;

struct Entry {
    seq: u64,
    responder: Option<Responder>,
    deadline: Option<Instant>,
}

/// The per-connection table of written-but-unanswered requests.
#[derive(Default)]
pub struct Inflight {
    slots: Vec<Option<Entry>>,
    free: Vec<u32>,
    order: VecDeque<u32>,
    // Reverse for a min-heap; seq disambiguates reused indices.
    deadlines: BinaryHeap<Reverse<(Instant, u64, u32)>>,
    next_seq: u64,
}

impl Inflight {
    pub fn new() -> Self {
        Inflight::default()
    }

    /// Number of entries, orphans included.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Record a request at the back of the wire order.
    ///
    /// Must be called in the same order frames are written to the socket.
    pub fn register(&mut self, responder: Responder, deadline: Option<Instant>) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = Entry {
            seq,
            responder: Some(responder),
            deadline,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(entry);
                index
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Some(entry));
                index
            }
        };
        if let Some(deadline) = deadline {
            self.deadlines.push(Reverse((deadline, seq, index)));
        }
        self.order.push_back(index);
        index
    }

    /// Deliver the next reply to the oldest pending entry.
    ///
    /// Returns `false` when nothing was pending, which means the reply
    /// stream and the request stream have skewed, which is fatal for the
    /// caller.
    pub fn complete_next(&mut self, result: Result<Frame, Error>) -> bool {
        let Some(index) = self.order.pop_front() else {
            return false;
        };
        let entry = self.slots[index as usize]
            .take()
            .expect("ordered index must have a live slot");
        self.free.push(index);
        if let Some(responder) = entry.responder {
            // A dropped receiver is a cancelled caller; the reply is
            // discarded, which is exactly the orphan contract.
            let _ = responder.send(result);
        }
        true
    }

    /// Earliest live deadline, skipping entries that already completed.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, seq, index))) = self.deadlines.peek().copied() {
            match &self.slots[index as usize] {
                Some(entry) if entry.seq == seq && entry.responder.is_some() => {
                    return Some(deadline);
                }
                _ => {
                    self.deadlines.pop();
                }
            }
        }
        None
    }

    /// Fail every entry whose deadline has passed and orphan it in place.
    pub fn expire_due(&mut self, now: Instant) {
        while let Some(Reverse((deadline, seq, index))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if let Some(entry) = self.slots[index as usize].as_mut() {
                if entry.seq == seq && entry.deadline == Some(deadline) {
                    if let Some(responder) = entry.responder.take() {
                        let _ = responder.send(Err(Error::timeout()));
                    }
                }
            }
        }
    }

    /// Fail every entry, orphans included, and reset the table.
    ///
    /// Used when the connection is lost: the wire order is gone, so no
    /// entry can ever be matched again.
    pub fn fail_all(&mut self, error: impl Fn() -> Error) {
        while let Some(index) = self.order.pop_front() {
            if let Some(entry) = self.slots[index as usize].take() {
                if let Some(responder) = entry.responder {
                    let _ = responder.send(Err(error()));
                }
            }
        }
        self.slots.clear();
        self.free.clear();
        self.deadlines.clear();
    }
}
