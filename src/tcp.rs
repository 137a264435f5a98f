// DNS-over-TCP stream reassembly.
//
// A fixed pool of shard actors, each owning the flows hashed to it. A flow
// buffer keeps a contiguous assembled prefix plus an out-of-order stash
// keyed by relative sequence offset. Messages are length-prefixed with a
// 16-bit big-endian byte count; each complete message is emitted on the
// shared return queue and the logical start advances past it.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select};
use rustc_hash::{FxHashMap, FxHasher};

use crate::pipeline::{PipelineCounters, Shutdown, send_guarded};

/// DNS-over-TCP messages are bounded by their 16-bit length prefix; cap
/// the per-flow buffer a little above that so one flow cannot hoard memory.
const MAX_FLOW_BUFFER: usize = 2 + u16::MAX as usize;

/// Directional 4-tuple. Both directions of one exchange are distinct flows,
/// so a query stream and its response stream assemble independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl FlowKey {
    /// Stable flow-to-shard mapping: every segment of one flow lands in the
    /// same shard for the lifetime of the process.
    pub fn shard(&self, shard_count: usize) -> usize {
        let mut hasher = FxHasher::default();
        self.hash(&mut hasher);
        (hasher.finish() % shard_count as u64) as usize
    }
}

/// One TCP segment routed to a shard.
#[derive(Debug)]
pub struct TcpSegment {
    pub flow: FlowKey,
    pub ts_micros: u64,
    pub seq: u32,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
}

/// A complete length-stripped DNS message leaving the assembler pool.
#[derive(Debug)]
pub struct TcpDnsMessage {
    pub flow: FlowKey,
    pub ts_micros: u64,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Per-flow buffer
// ---------------------------------------------------------------------------

struct FlowBuffer {
    /// Sequence number of `assembled[0]`.
    base_seq: u32,
    /// Contiguous bytes from `base_seq`, not yet consumed by a message.
    assembled: Vec<u8>,
    /// Out-of-order segments, keyed by offset relative to `base_seq`.
    pending: BTreeMap<u32, Vec<u8>>,
    /// Timestamp of the most recent segment, stamped into emitted messages.
    ts_micros: u64,
    last_activity: Instant,
}

/// Outcome of merging one segment into a flow.
#[derive(Debug, Default)]
struct SegmentMerge {
    /// Overlapping bytes disagreed with an earlier arrival (later wins).
    conflict: bool,
}

impl FlowBuffer {
    fn new(seq: u32, ts_micros: u64) -> Self {
        Self {
            base_seq: seq,
            assembled: Vec::new(),
            pending: BTreeMap::new(),
            ts_micros,
            last_activity: Instant::now(),
        }
    }

    fn insert(&mut self, seq: u32, payload: &[u8], ts_micros: u64) -> SegmentMerge {
        let mut merge = SegmentMerge::default();
        self.ts_micros = ts_micros;
        self.last_activity = Instant::now();

        if payload.is_empty() {
            return merge;
        }

        // Offset of the segment relative to the logical buffer start,
        // modulo sequence wraparound. A large value means the segment
        // starts before `base_seq` (retransmission of consumed data).
        let rel = seq.wrapping_sub(self.base_seq);
        let (rel, payload) = if rel > u32::MAX / 2 {
            let skip = self.base_seq.wrapping_sub(seq) as usize;
            if skip >= payload.len() {
                return merge; // entirely before the buffer start
            }
            (0u32, &payload[skip..])
        } else {
            (rel, payload)
        };

        if rel as usize > self.assembled.len() {
            // Beyond the contiguous prefix: stash for later. Later arrivals
            // for the same offset win.
            self.pending.insert(rel, payload.to_vec());
        } else {
            self.merge_at(rel as usize, payload, &mut merge);
            self.drain_pending(&mut merge);
        }
        merge
    }

    /// Merge a segment that starts at or before the assembled frontier.
    fn merge_at(&mut self, at: usize, payload: &[u8], merge: &mut SegmentMerge) {
        let overlap = (self.assembled.len() - at).min(payload.len());
        if overlap > 0 {
            if self.assembled[at..at + overlap] != payload[..overlap] {
                merge.conflict = true;
            }
            self.assembled[at..at + overlap].copy_from_slice(&payload[..overlap]);
        }
        if payload.len() > overlap {
            self.assembled.extend_from_slice(&payload[overlap..]);
        }
    }

    fn drain_pending(&mut self, merge: &mut SegmentMerge) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() as usize > self.assembled.len() {
                break;
            }
            let (rel, payload) = entry.remove_entry();
            self.merge_at(rel as usize, &payload, merge);
        }
    }

    /// Pull every complete length-prefixed message off the front.
    fn extract_messages(&mut self) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        loop {
            if self.assembled.len() < 2 {
                break;
            }
            let msg_len = u16::from_be_bytes([self.assembled[0], self.assembled[1]]) as usize;
            if self.assembled.len() < 2 + msg_len {
                break;
            }
            let consumed = 2 + msg_len;
            let message: Vec<u8> = self.assembled[2..consumed].to_vec();
            self.assembled.drain(..consumed);
            self.base_seq = self.base_seq.wrapping_add(consumed as u32);
            // Rebase the out-of-order stash onto the new logical start.
            let old = std::mem::take(&mut self.pending);
            for (rel, payload) in old {
                if let Some(new_rel) = rel.checked_sub(consumed as u32) {
                    self.pending.insert(new_rel, payload);
                }
            }
            if msg_len > 0 {
                messages.push(message);
            }
        }
        messages
    }

    fn oversized(&self) -> bool {
        self.assembled.len() > MAX_FLOW_BUFFER
    }
}

// ---------------------------------------------------------------------------
// Shard actor
// ---------------------------------------------------------------------------

/// One assembler shard: owns every flow hashed to it, nothing else.
pub fn run_tcp_assembler(
    input: Receiver<TcpSegment>,
    output: Sender<TcpDnsMessage>,
    gc_interval: Duration,
    shutdown: Shutdown,
    counters: Arc<PipelineCounters>,
) {
    let mut flows: FxHashMap<FlowKey, FlowBuffer> = FxHashMap::default();
    let gc_tick = crossbeam_channel::tick(gc_interval);

    loop {
        select! {
            recv(input) -> segment => match segment {
                Ok(segment) => {
                    if !handle_segment(&mut flows, segment, &output, &shutdown, &counters) {
                        return;
                    }
                }
                Err(_) => return,
            },
            recv(gc_tick) -> _ => {
                let before = flows.len();
                flows.retain(|_, flow| flow.last_activity.elapsed() < gc_interval);
                let evicted = before - flows.len();
                if evicted > 0 {
                    counters.tcp_timeouts.fetch_add(evicted as u64, Ordering::Relaxed);
                    log::debug!("tcp assembler evicted {} idle flow(s)", evicted);
                }
            },
            recv(shutdown.notify()) -> _ => {
                if shutdown.orderly() {
                    while let Ok(segment) = input.try_recv() {
                        if !handle_segment(&mut flows, segment, &output, &shutdown, &counters) {
                            return;
                        }
                    }
                }
                return;
            }
        }
    }
}

/// Returns false when the output side is gone and the shard should exit.
fn handle_segment(
    flows: &mut FxHashMap<FlowKey, FlowBuffer>,
    segment: TcpSegment,
    output: &Sender<TcpDnsMessage>,
    shutdown: &Shutdown,
    counters: &PipelineCounters,
) -> bool {
    let closing = segment.fin || segment.rst;
    let flow = flows
        .entry(segment.flow)
        .or_insert_with(|| FlowBuffer::new(segment.seq, segment.ts_micros));

    let merge = flow.insert(segment.seq, &segment.payload, segment.ts_micros);
    if merge.conflict {
        counters.tcp_conflicts.fetch_add(1, Ordering::Relaxed);
        log::debug!("tcp segment overlap with diverging bytes; keeping later arrival");
    }

    let messages = flow.extract_messages();
    let oversized = flow.oversized();
    let ts_micros = flow.ts_micros;

    // A flow that can no longer frame a message (lost sync or a hostile
    // length prefix) is dropped; GC would reap it anyway.
    if closing || oversized {
        flows.remove(&segment.flow);
    }

    for payload in messages {
        let msg = TcpDnsMessage {
            flow: segment.flow,
            ts_micros,
            payload,
        };
        if !send_guarded(output, msg, shutdown) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn flow() -> FlowKey {
        FlowKey {
            src_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            src_port: 53,
            dst_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)),
            dst_port: 41000,
        }
    }

    /// `[len][msg]` framing helper.
    fn framed(msg: &[u8]) -> Vec<u8> {
        let mut out = (msg.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(msg);
        out
    }

    fn feed(buf: &mut FlowBuffer, seq: u32, payload: &[u8]) -> Vec<Vec<u8>> {
        buf.insert(seq, payload, 1);
        buf.extract_messages()
    }

    #[test]
    fn whole_message_in_one_segment() {
        let mut buf = FlowBuffer::new(1000, 1);
        let msgs = feed(&mut buf, 1000, &framed(b"hello"));
        assert_eq!(msgs, vec![b"hello".to_vec()]);
    }

    #[test]
    fn segmented_message_matches_unsegmented() {
        let stream = framed(b"a dns message");
        // Split into arbitrary non-overlapping pieces.
        for split_points in [vec![1], vec![2, 5], vec![3, 4, 9], vec![1, 2, 3, 4]] {
            let mut buf = FlowBuffer::new(5000, 1);
            let mut collected = Vec::new();
            let mut start = 0usize;
            let mut bounds = split_points.clone();
            bounds.push(stream.len());
            for end in bounds {
                collected.extend(feed(&mut buf, 5000 + start as u32, &stream[start..end]));
                start = end;
            }
            assert_eq!(collected, vec![b"a dns message".to_vec()], "{:?}", split_points);
        }
    }

    #[test]
    fn two_interleaved_messages_in_order() {
        let mut stream = framed(b"first");
        stream.extend_from_slice(&framed(b"second"));
        // 5 pieces straddling both messages.
        let cuts = [0, 3, 6, 9, 12, stream.len()];
        let mut buf = FlowBuffer::new(100, 1);
        let mut collected = Vec::new();
        for w in cuts.windows(2) {
            collected.extend(feed(&mut buf, 100 + w[0] as u32, &stream[w[0]..w[1]]));
        }
        assert_eq!(collected, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn out_of_order_segments_assemble() {
        let stream = framed(b"reordered");
        let mut buf = FlowBuffer::new(0, 1);
        let mid = 4usize;
        // Tail first, then head.
        assert!(feed(&mut buf, mid as u32, &stream[mid..]).is_empty());
        let msgs = feed(&mut buf, 0, &stream[..mid]);
        assert_eq!(msgs, vec![b"reordered".to_vec()]);
    }

    #[test]
    fn duplicate_segment_is_idempotent() {
        let stream = framed(b"dup");
        let mut buf = FlowBuffer::new(10, 1);
        let merge = buf.insert(10, &stream, 1);
        assert!(!merge.conflict);
        let merge = buf.insert(10, &stream, 2);
        assert!(!merge.conflict);
        assert_eq!(buf.extract_messages(), vec![b"dup".to_vec()]);
    }

    #[test]
    fn conflicting_overlap_later_wins() {
        let mut buf = FlowBuffer::new(0, 1);
        buf.insert(0, &framed(b"aaaa"), 1);
        // Same range, different bytes.
        let merge = buf.insert(2, b"bb", 2);
        assert!(merge.conflict);
        assert_eq!(buf.extract_messages(), vec![b"bbaa".to_vec()]);
    }

    #[test]
    fn retransmission_before_base_is_clipped() {
        let mut buf = FlowBuffer::new(100, 1);
        buf.insert(100, &framed(b"keep"), 1);
        assert_eq!(buf.extract_messages(), vec![b"keep".to_vec()]);
        // base_seq advanced to 106; a stale retransmission overlapping the
        // consumed range only contributes its tail.
        let mut stale = framed(b"keep");
        stale.extend_from_slice(&framed(b"x"));
        let merge = buf.insert(100, &stale, 2);
        assert!(!merge.conflict);
        assert_eq!(buf.extract_messages(), vec![b"x".to_vec()]);
    }

    #[test]
    fn sequence_wraparound_assembles() {
        let start = u32::MAX - 2;
        let stream = framed(b"wrap");
        let mut buf = FlowBuffer::new(start, 1);
        let mid = 3usize;
        assert!(feed(&mut buf, start, &stream[..mid]).is_empty());
        let msgs = feed(&mut buf, start.wrapping_add(mid as u32), &stream[mid..]);
        assert_eq!(msgs, vec![b"wrap".to_vec()]);
    }

    #[test]
    fn zero_length_message_is_skipped() {
        let mut buf = FlowBuffer::new(0, 1);
        let mut stream = framed(b"");
        stream.extend_from_slice(&framed(b"real"));
        let msgs = feed(&mut buf, 0, &stream);
        assert_eq!(msgs, vec![b"real".to_vec()]);
    }

    #[test]
    fn shard_mapping_is_stable_and_in_range() {
        let key = flow();
        let shard = key.shard(4);
        assert!(shard < 4);
        for _ in 0..100 {
            assert_eq!(key.shard(4), shard);
        }
        // Opposite direction is a distinct flow and may map anywhere.
        let reverse = FlowKey {
            src_ip: key.dst_ip,
            src_port: key.dst_port,
            dst_ip: key.src_ip,
            dst_port: key.src_port,
        };
        assert_ne!(key, reverse);
        assert!(reverse.shard(4) < 4);
    }

    #[test]
    fn actor_emits_and_closes_on_fin() {
        let (in_tx, in_rx) = crossbeam_channel::bounded(16);
        let (out_tx, out_rx) = crossbeam_channel::bounded(16);
        let (trigger, shutdown) = crate::pipeline::shutdown_channel();
        let counters = Arc::new(PipelineCounters::default());

        let actor_counters = Arc::clone(&counters);
        let handle = std::thread::spawn(move || {
            run_tcp_assembler(
                in_rx,
                out_tx,
                Duration::from_secs(10),
                shutdown,
                actor_counters,
            );
        });

        let stream = framed(b"over tcp");
        in_tx
            .send(TcpSegment {
                flow: flow(),
                ts_micros: 42,
                seq: 7,
                fin: false,
                rst: false,
                payload: stream[..4].to_vec(),
            })
            .unwrap();
        in_tx
            .send(TcpSegment {
                flow: flow(),
                ts_micros: 43,
                seq: 7 + 4,
                fin: true,
                rst: false,
                payload: stream[4..].to_vec(),
            })
            .unwrap();

        let msg = out_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(msg.payload, b"over tcp");
        assert_eq!(msg.ts_micros, 43);

        drop(trigger);
        drop(in_tx);
        handle.join().unwrap();
    }
}
