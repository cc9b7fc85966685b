//! Per-direction TCP reassembly.
//!
//! Each directed flow gets its own bounded segment channel; the assembler
//! announces new flows on a channel the consumer owns, then pushes in-order
//! payload bytes (with wire timestamps) as they become contiguous.  Closing
//! the segment sender is the only EOF signal a consumer sees.
//!
//! Out-of-order segments are buffered by relative sequence number and
//! released once the gap fills.  At flush time remaining buffered data is
//! released in sequence order with gaps skipped — lost segments are never
//! reconstructed, the stream just continues past the hole.
//!
//! Relative sequence numbers are not wrap-aware: a single direction that
//! carries more than 4 GiB will confuse the buffer ordering.  Offline
//! captures of that size are out of scope here.

use crate::decode::decode_packet;
use crate::flow::FlowKey;
use crate::pcap::RawPacket;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Capacity of each per-flow segment channel; small, so a stalled consumer
/// backpressures the capture loop instead of buffering the file in memory.
const SEGMENT_CHANNEL_CAPACITY: usize = 64;

/// A contiguous run of reassembled payload bytes.
#[derive(Debug, Clone)]
pub struct Segment {
    pub data: Bytes,
    /// Wire timestamp of the packet that carried these bytes.
    pub seen: DateTime<Utc>,
}

/// Announcement of a newly observed directed flow.
#[derive(Debug)]
pub struct NewFlow {
    pub key: FlowKey,
    pub segments: mpsc::Receiver<Segment>,
}

struct FlowState {
    tx: Option<mpsc::Sender<Segment>>,
    /// Base sequence number (ISN when a SYN was observed, else first seen).
    base: u32,
    /// Next expected relative sequence offset.
    next: u32,
    pending: BTreeMap<u32, Segment>,
    fin_seen: bool,
}

impl FlowState {
    async fn deliver(&mut self, data: Bytes, seen: DateTime<Utc>) {
        if data.is_empty() {
            return;
        }
        self.next = self.next.wrapping_add(data.len() as u32);
        if let Some(tx) = &self.tx {
            if tx.send(Segment { data, seen }).await.is_err() {
                // Consumer is gone; stop queueing work for this flow.
                self.tx = None;
            }
        }
    }

    /// Deliver `seg` at relative offset `rel`, trimming any prefix that was
    /// already delivered.
    async fn deliver_from(&mut self, rel: u32, seg: Segment) {
        let already = self.next.wrapping_sub(rel) as usize;
        if already < seg.data.len() {
            self.deliver(seg.data.slice(already..), seg.seen).await;
        }
    }

    /// Release buffered segments that have become contiguous.
    async fn drain_pending(&mut self) {
        loop {
            let Some((&rel, _)) = self.pending.first_key_value() else {
                break;
            };
            if rel > self.next {
                break;
            }
            if let Some(seg) = self.pending.remove(&rel) {
                self.deliver_from(rel, seg).await;
            }
        }
    }

    fn close_if_done(&mut self) {
        if self.fin_seen && self.pending.is_empty() {
            self.tx = None;
        }
    }
}

/// Routes decoded TCP segments onto per-flow ordered byte streams.
pub struct Assembler {
    announce: mpsc::Sender<NewFlow>,
    flows: HashMap<FlowKey, FlowState>,
}

impl Assembler {
    pub fn new(announce: mpsc::Sender<NewFlow>) -> Assembler {
        Assembler {
            announce,
            flows: HashMap::new(),
        }
    }

    /// Decode one captured frame and feed its payload into the owning flow.
    /// Non-TCP frames and unusable fragments are skipped.
    pub async fn feed(&mut self, pkt: &RawPacket) {
        let Some(tcp) = decode_packet(pkt.link, &pkt.data) else {
            trace!("skipping non-TCP frame");
            return;
        };

        if !self.flows.contains_key(&tcp.key) {
            let (tx, rx) = mpsc::channel(SEGMENT_CHANNEL_CAPACITY);
            let announced = self
                .announce
                .send(NewFlow {
                    key: tcp.key,
                    segments: rx,
                })
                .await;
            debug!(flow = %tcp.key, "new flow");
            self.flows.insert(
                tcp.key,
                FlowState {
                    tx: if announced.is_ok() { Some(tx) } else { None },
                    base: tcp.seq,
                    next: if tcp.syn { 1 } else { 0 },
                    pending: BTreeMap::new(),
                    fin_seen: false,
                },
            );
        }
        let Some(state) = self.flows.get_mut(&tcp.key) else {
            return;
        };

        if !tcp.payload.is_empty() {
            // Payload carried on a SYN occupies sequence space after the ISN.
            let rel = tcp
                .seq
                .wrapping_add(u32::from(tcp.syn))
                .wrapping_sub(state.base);
            let seg = Segment {
                data: tcp.payload,
                seen: pkt.ts,
            };
            if rel <= state.next {
                state.deliver_from(rel, seg).await;
                state.drain_pending().await;
            } else {
                // Out of order: hold until the gap fills (first copy wins).
                state.pending.entry(rel).or_insert(seg);
            }
        }

        if tcp.fin || tcp.rst {
            state.fin_seen = true;
        }
        state.close_if_done();
    }

    /// End of capture: release everything still buffered, skipping over
    /// sequence gaps, and close every flow channel.
    pub async fn flush(&mut self) {
        for (key, mut state) in self.flows.drain() {
            let pending = std::mem::take(&mut state.pending);
            for (rel, seg) in pending {
                if rel > state.next {
                    debug!(flow = %key, gap = rel - state.next, "skipping gap at flush");
                    state.next = rel;
                }
                state.deliver_from(rel, seg).await;
            }
            // Dropping the state drops the sender, closing the stream.
        }
    }
}
