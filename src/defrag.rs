// IP datagram reassembly — RFC 815 hole-list algorithm.
//
// One single-threaded actor per IP version owns a map from fragmentation
// key to in-progress buffer. Contexts either complete (whole datagram
// emitted on the return queue) or expire on the GC ticker; an expired
// context is discarded without emission.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select};
use rustc_hash::FxHashMap;

use crate::packet::{Ipv4FragKey, Ipv6FragKey};
use crate::pipeline::{PipelineCounters, Shutdown, send_guarded};

/// IPv4 datagrams are bounded by the 16-bit total length field; IPv6
/// fragmentable parts by the 16-bit fragment offset range.
const MAX_DATAGRAM: u32 = 65_535;

/// Key types that can address a fragmentation context.
pub trait FragKey: Copy + Eq + std::hash::Hash + Send + 'static {
    fn endpoints(&self) -> (IpAddr, IpAddr);
}

impl FragKey for Ipv4FragKey {
    fn endpoints(&self) -> (IpAddr, IpAddr) {
        (IpAddr::V4(self.src), IpAddr::V4(self.dst))
    }
}

impl FragKey for Ipv6FragKey {
    fn endpoints(&self) -> (IpAddr, IpAddr) {
        (IpAddr::V6(self.src), IpAddr::V6(self.dst))
    }
}

/// One fragment on its way to a defragmenter actor.
#[derive(Debug)]
pub struct FragmentJob<K> {
    pub key: K,
    /// Transport protocol of the reassembled payload. For IPv4 this is the
    /// header protocol field; for IPv6 the fragment header's Next Header.
    pub proto: u8,
    pub ts_micros: u64,
    /// Byte offset of this fragment within the original datagram.
    pub offset: u32,
    pub more: bool,
    pub payload: Vec<u8>,
}

/// A whole reassembled datagram, ready to re-enter transport dispatch.
#[derive(Debug)]
pub struct DefraggedDatagram {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: u8,
    pub ts_micros: u64,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Hole-list buffer
// ---------------------------------------------------------------------------

/// A gap `[start, end)` still missing from the datagram.
#[derive(Debug, Clone, Copy)]
struct Hole {
    start: u32,
    end: u32,
}

/// Outcome of inserting one fragment.
#[derive(Debug, Default)]
pub struct FragInsert {
    /// The whole datagram payload, present once reassembly completed.
    pub completed: Option<Vec<u8>>,
    /// A previously received byte range was overwritten with different
    /// bytes (later arrival wins).
    pub conflict: bool,
}

/// Reassembly state for one fragmentation key.
pub struct FragmentBuffer {
    /// Sorted, disjoint list of unfilled ranges.
    holes: Vec<Hole>,
    /// Payload bytes indexed by absolute offset; grows as fragments land.
    data: Vec<u8>,
    /// Declared datagram length, known once the MF=0 fragment arrives.
    total_len: Option<u32>,
    /// Transport protocol, recorded from the offset-0 fragment.
    proto: Option<u8>,
    /// Timestamp of the first fragment; stamped into the result.
    pub ts_micros: u64,
    /// Wall-clock arrival of the first fragment, used by GC.
    pub first_arrival: Instant,
}

impl FragmentBuffer {
    pub fn new(ts_micros: u64) -> Self {
        Self {
            holes: vec![Hole { start: 0, end: MAX_DATAGRAM }],
            data: Vec::new(),
            total_len: None,
            proto: None,
            ts_micros,
            first_arrival: Instant::now(),
        }
    }

    /// Fold one fragment into the buffer.
    pub fn insert(&mut self, offset: u32, more: bool, proto: u8, payload: &[u8]) -> FragInsert {
        let mut out = FragInsert::default();

        // Zero-length fragments carry nothing; the context is unchanged.
        if payload.is_empty() {
            return out;
        }

        let end = offset.saturating_add(payload.len() as u32);
        if end > MAX_DATAGRAM {
            return out;
        }
        // Data past the declared total length cannot belong to this datagram.
        if matches!(self.total_len, Some(total) if end > total) {
            return out;
        }

        if offset == 0 {
            self.proto = Some(proto);
        }

        // Compare against already-filled subranges of [offset, end). The
        // holes are sorted and disjoint, so everything between them within
        // the fragment span is filled.
        if (self.data.len() as u32) < end {
            self.data.resize(end as usize, 0);
        }
        let mut cursor = offset;
        for hole in &self.holes {
            if hole.start >= end {
                break;
            }
            let filled_end = hole.start.min(end);
            if filled_end > cursor
                && self.data[cursor as usize..filled_end as usize]
                    != payload[(cursor - offset) as usize..(filled_end - offset) as usize]
            {
                out.conflict = true;
            }
            cursor = cursor.max(hole.end);
        }
        if cursor < end
            && self.data[cursor as usize..end as usize]
                != payload[(cursor - offset) as usize..]
        {
            out.conflict = true;
        }

        // Split every overlapping hole around the fragment.
        let mut new_holes = Vec::with_capacity(self.holes.len() + 1);
        for hole in self.holes.drain(..) {
            if hole.end <= offset || hole.start >= end {
                new_holes.push(hole);
                continue;
            }
            if hole.start < offset {
                new_holes.push(Hole { start: hole.start, end: offset });
            }
            if end < hole.end {
                new_holes.push(Hole { start: end, end: hole.end });
            }
        }
        self.holes = new_holes;

        self.data[offset as usize..end as usize].copy_from_slice(payload);

        if !more {
            if matches!(self.total_len, Some(total) if total != end) {
                out.conflict = true;
            }
            self.total_len = Some(end);
            self.holes.retain_mut(|hole| {
                if hole.start >= end {
                    return false;
                }
                hole.end = hole.end.min(end);
                true
            });
            self.data.truncate(end as usize);
        }

        if let Some(total) = self.total_len {
            if self.holes.is_empty() {
                let mut payload = std::mem::take(&mut self.data);
                payload.truncate(total as usize);
                out.completed = Some(payload);
            }
        }
        out
    }

    pub fn proto(&self) -> Option<u8> {
        self.proto
    }
}

// ---------------------------------------------------------------------------
// Defragmenter actor
// ---------------------------------------------------------------------------

/// Actor loop: owns the context map, consumes fragments, emits whole
/// datagrams, evicts stale contexts on the GC ticker.
pub fn run_defragger<K: FragKey>(
    input: Receiver<FragmentJob<K>>,
    output: Sender<DefraggedDatagram>,
    gc_interval: Duration,
    shutdown: Shutdown,
    counters: Arc<PipelineCounters>,
) {
    let mut contexts: FxHashMap<K, FragmentBuffer> = FxHashMap::default();
    let gc_tick = crossbeam_channel::tick(gc_interval);

    loop {
        select! {
            recv(input) -> job => match job {
                Ok(job) => {
                    if !handle_job(&mut contexts, job, &output, &shutdown, &counters) {
                        return;
                    }
                }
                Err(_) => return,
            },
            recv(gc_tick) -> _ => {
                let before = contexts.len();
                contexts.retain(|_, ctx| ctx.first_arrival.elapsed() < gc_interval);
                let evicted = before - contexts.len();
                if evicted > 0 {
                    counters.frag_timeouts.fetch_add(evicted as u64, Ordering::Relaxed);
                    log::debug!("defragger evicted {} stale context(s)", evicted);
                }
            },
            recv(shutdown.notify()) -> _ => {
                if shutdown.orderly() {
                    while let Ok(job) = input.try_recv() {
                        if !handle_job(&mut contexts, job, &output, &shutdown, &counters) {
                            return;
                        }
                    }
                }
                return;
            }
        }
    }
}

/// Returns false when the output side is gone and the actor should exit.
fn handle_job<K: FragKey>(
    contexts: &mut FxHashMap<K, FragmentBuffer>,
    job: FragmentJob<K>,
    output: &Sender<DefraggedDatagram>,
    shutdown: &Shutdown,
    counters: &PipelineCounters,
) -> bool {
    let ctx = contexts
        .entry(job.key)
        .or_insert_with(|| FragmentBuffer::new(job.ts_micros));
    let result = ctx.insert(job.offset, job.more, job.proto, &job.payload);

    if result.conflict {
        counters.frag_conflicts.fetch_add(1, Ordering::Relaxed);
        log::debug!("conflicting duplicate fragment bytes; keeping later arrival");
    }

    if let Some(payload) = result.completed {
        let proto = ctx.proto().unwrap_or(job.proto);
        let ts_micros = ctx.ts_micros;
        contexts.remove(&job.key);
        let (src, dst) = job.key.endpoints();
        let datagram = DefraggedDatagram { src, dst, proto, ts_micros, payload };
        return send_guarded(output, datagram, shutdown);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use crate::packet::PROTO_UDP;
    use crate::pipeline::shutdown_channel;

    fn key(ident: u16) -> Ipv4FragKey {
        Ipv4FragKey {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
            proto: PROTO_UDP,
            ident,
        }
    }

    // Three 8-byte chunks forming a 24-byte datagram.
    fn chunks() -> [(u32, bool, Vec<u8>); 3] {
        [
            (0, true, vec![0xAA; 8]),
            (8, true, vec![0xBB; 8]),
            (16, false, vec![0xCC; 8]),
        ]
    }

    fn expected() -> Vec<u8> {
        let mut d = vec![0xAA; 8];
        d.extend_from_slice(&[0xBB; 8]);
        d.extend_from_slice(&[0xCC; 8]);
        d
    }

    #[test]
    fn reassembles_in_every_arrival_order() {
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let parts = chunks();
            let mut buf = FragmentBuffer::new(1);
            let mut completed = None;
            for &i in &order {
                let (offset, more, ref payload) = parts[i];
                let r = buf.insert(offset, more, PROTO_UDP, payload);
                assert!(!r.conflict, "order {:?}", order);
                if let Some(d) = r.completed {
                    completed = Some(d);
                }
            }
            assert_eq!(completed.as_deref(), Some(expected().as_slice()), "order {:?}", order);
        }
    }

    #[test]
    fn single_fragment_completes_immediately() {
        let mut buf = FragmentBuffer::new(1);
        let r = buf.insert(0, false, PROTO_UDP, &[1, 2, 3, 4]);
        assert_eq!(r.completed.as_deref(), Some(&[1, 2, 3, 4][..]));
    }

    #[test]
    fn zero_length_fragment_is_ignored() {
        let mut buf = FragmentBuffer::new(1);
        let r = buf.insert(0, false, PROTO_UDP, &[]);
        assert!(r.completed.is_none());
        assert!(!r.conflict);
        // The context is unchanged: a real fragment still completes.
        let r = buf.insert(0, false, PROTO_UDP, &[9, 9]);
        assert_eq!(r.completed.as_deref(), Some(&[9, 9][..]));
    }

    #[test]
    fn identical_duplicate_is_idempotent() {
        let mut buf = FragmentBuffer::new(1);
        assert!(buf.insert(0, true, PROTO_UDP, &[5; 8]).completed.is_none());
        let dup = buf.insert(0, true, PROTO_UDP, &[5; 8]);
        assert!(!dup.conflict);
        let done = buf.insert(8, false, PROTO_UDP, &[6; 8]);
        let data = done.completed.unwrap();
        assert_eq!(&data[..8], &[5; 8]);
        assert_eq!(&data[8..], &[6; 8]);
    }

    #[test]
    fn conflicting_duplicate_later_wins() {
        let mut buf = FragmentBuffer::new(1);
        assert!(buf.insert(0, true, PROTO_UDP, &[5; 8]).completed.is_none());
        let dup = buf.insert(0, true, PROTO_UDP, &[7; 8]);
        assert!(dup.conflict);
        let done = buf.insert(8, false, PROTO_UDP, &[6; 8]);
        assert_eq!(&done.completed.unwrap()[..8], &[7; 8]);
    }

    #[test]
    fn fragment_beyond_total_is_ignored() {
        let mut buf = FragmentBuffer::new(1);
        assert!(buf.insert(0, false, PROTO_UDP, &[1; 8]).completed.is_some());
        // Buffer already drained; a late overlong fragment does nothing.
        let late = buf.insert(16, true, PROTO_UDP, &[2; 8]);
        assert!(late.completed.is_none());
    }

    #[test]
    fn overlapping_fragment_fills_partial_hole() {
        let mut buf = FragmentBuffer::new(1);
        // [0,8) then an overlapping [4,12) that also finishes the datagram.
        assert!(buf.insert(0, true, PROTO_UDP, &[1; 8]).completed.is_none());
        let r = buf.insert(4, false, PROTO_UDP, &[1, 1, 1, 1, 2, 2, 2, 2]);
        let data = r.completed.unwrap();
        assert_eq!(data.len(), 12);
        assert_eq!(&data[8..], &[2, 2, 2, 2]);
        assert!(!r.conflict); // overlap bytes matched
    }

    #[test]
    fn actor_reassembles_and_evicts() {
        let (in_tx, in_rx) = crossbeam_channel::bounded(16);
        let (out_tx, out_rx) = crossbeam_channel::bounded(16);
        let (trigger, shutdown) = shutdown_channel();
        let counters = Arc::new(PipelineCounters::default());

        let gc = Duration::from_millis(40);
        let actor_counters = Arc::clone(&counters);
        let handle = std::thread::spawn(move || {
            run_defragger(in_rx, out_tx, gc, shutdown, actor_counters);
        });

        // A complete datagram in reversed order.
        let parts = chunks();
        for &i in &[2usize, 0, 1] {
            let (offset, more, ref payload) = parts[i];
            in_tx
                .send(FragmentJob {
                    key: key(1),
                    proto: PROTO_UDP,
                    ts_micros: 77,
                    offset,
                    more,
                    payload: payload.clone(),
                })
                .unwrap();
        }
        let datagram = out_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(datagram.payload, expected());
        assert_eq!(datagram.ts_micros, 77);
        assert_eq!(datagram.proto, PROTO_UDP);

        // An incomplete context must be GC'd without emission.
        in_tx
            .send(FragmentJob {
                key: key(2),
                proto: PROTO_UDP,
                ts_micros: 78,
                offset: 0,
                more: true,
                payload: vec![1; 8],
            })
            .unwrap();
        std::thread::sleep(gc * 3);
        assert!(out_rx.try_recv().is_err());
        assert!(counters.frag_timeouts.load(Ordering::Relaxed) >= 1);

        drop(trigger);
        drop(in_tx);
        handle.join().unwrap();
    }
}
