// Capture pipeline supervisor.
//
// Wires the stages together with bounded channels and owns the
// termination protocol. Thread layout:
//
//   source ─> [frame channel] ─> decoder workers ─┬─> ip4 defragger ─> drain ─┐
//                                                 ├─> ip6 defragger ─> drain ─┤
//                                                 ├─> tcp shards ─> tcp drain ┤
//                                                 └──────────────────────────> [result channel]
//
// Every worker loop is a select over {input, shutdown}. Orderly shutdown
// drains queued input before exiting; immediate shutdown exits at the next
// select. Once the source stops, channel disconnection cascades stage by
// stage until every result sender is dropped and the result channel closes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use serde::Serialize;

use crate::capture::{self, Frame, PacketSource};
use crate::config::CaptureConfig;
use crate::defrag::{DefraggedDatagram, FragmentJob, run_defragger};
use crate::dns;
use crate::error::DnsWatchError;
use crate::model::{CaptureStatsRecord, DnsResult, Transport};
use crate::packet::{self, Decoded, Ipv4FragKey, Ipv6FragKey, TcpView, UdpView};
use crate::sampler::Sampler;
use crate::tcp::{FlowKey, TcpDnsMessage, TcpSegment, run_tcp_assembler};

// ---------------------------------------------------------------------------
// Shutdown protocol
// ---------------------------------------------------------------------------

/// Broadcast termination signal observed by every worker.
///
/// The signal fires when the trigger's guard sender is dropped, so a
/// `recv` on `notify()` unblocks every select at once. `orderly` tells
/// workers whether to drain their input queue before exiting.
#[derive(Clone)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    orderly: Arc<AtomicBool>,
    notify: Receiver<()>,
}

impl Shutdown {
    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    pub fn orderly(&self) -> bool {
        self.orderly.load(Ordering::Relaxed)
    }

    pub fn notify(&self) -> &Receiver<()> {
        &self.notify
    }
}

/// The firing side of the shutdown signal. Dropping it unfired is an
/// orderly shutdown.
pub struct ShutdownTrigger {
    requested: Arc<AtomicBool>,
    orderly: Arc<AtomicBool>,
    guard: Option<Sender<()>>,
}

impl ShutdownTrigger {
    pub fn fire(&mut self, orderly: bool) {
        self.orderly.store(orderly, Ordering::Relaxed);
        self.requested.store(true, Ordering::Relaxed);
        self.guard.take();
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (guard, notify) = bounded(0);
    let requested = Arc::new(AtomicBool::new(false));
    let orderly = Arc::new(AtomicBool::new(true));
    (
        ShutdownTrigger {
            requested: Arc::clone(&requested),
            orderly: Arc::clone(&orderly),
            guard: Some(guard),
        },
        Shutdown {
            requested,
            orderly,
            notify,
        },
    )
}

/// Blocking send that stays interruptible. Under a requested shutdown a
/// full queue means the frame is abandoned rather than blocking the drain.
/// Returns false when the message was not delivered and the caller should
/// wind down.
pub(crate) fn send_guarded<T>(tx: &Sender<T>, msg: T, shutdown: &Shutdown) -> bool {
    if shutdown.requested() {
        return tx.try_send(msg).is_ok();
    }
    select! {
        send(tx, msg) -> res => res.is_ok(),
        recv(shutdown.notify()) -> _ => false,
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Per-stage counters, owned by the pipeline and threaded explicitly to
/// every worker. No module-scope state.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub frames_processed: AtomicU64,
    pub parse_errors: AtomicU64,
    pub frag_conflicts: AtomicU64,
    pub frag_timeouts: AtomicU64,
    pub tcp_conflicts: AtomicU64,
    pub tcp_timeouts: AtomicU64,
    pub results_emitted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub frames_processed: u64,
    pub parse_errors: u64,
    pub frag_conflicts: u64,
    pub frag_timeouts: u64,
    pub tcp_conflicts: u64,
    pub tcp_timeouts: u64,
    pub results_emitted: u64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            frag_conflicts: self.frag_conflicts.load(Ordering::Relaxed),
            frag_timeouts: self.frag_timeouts.load(Ordering::Relaxed),
            tcp_conflicts: self.tcp_conflicts.load(Ordering::Relaxed),
            tcp_timeouts: self.tcp_timeouts.load(Ordering::Relaxed),
            results_emitted: self.results_emitted.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Shared decode context. Worker threads carry the fragment senders; the
/// defragger drain threads do not, so that channel disconnection cascades
/// source -> decoders -> defraggers -> drains without a cycle.
struct DecoderCtx {
    port: u16,
    server: String,
    ip4_tx: Option<Sender<FragmentJob<Ipv4FragKey>>>,
    ip6_tx: Option<Sender<FragmentJob<Ipv6FragKey>>>,
    tcp_txs: Vec<Sender<TcpSegment>>,
    result_tx: Sender<DnsResult>,
    counters: Arc<PipelineCounters>,
    shutdown: Shutdown,
}

impl DecoderCtx {
    fn port_match(&self, a: u16, b: u16) -> bool {
        self.port == 0 || a == self.port || b == self.port
    }

    /// Returns false once downstream is gone and the worker should exit.
    fn handle_frame(&self, frame: &Frame) -> bool {
        self.counters.frames_processed.fetch_add(1, Ordering::Relaxed);
        match packet::decode_frame(&frame.data, frame.link) {
            Some(Decoded::Ipv4Fragment(frag)) => {
                let job = FragmentJob {
                    key: frag.key,
                    proto: frag.key.proto,
                    ts_micros: frame.ts_micros,
                    offset: frag.offset,
                    more: frag.more,
                    payload: frag.payload.to_vec(),
                };
                match &self.ip4_tx {
                    Some(tx) => send_guarded(tx, job, &self.shutdown),
                    None => true,
                }
            }
            Some(Decoded::Ipv6Fragment(frag)) => {
                let job = FragmentJob {
                    key: frag.key,
                    proto: frag.proto,
                    ts_micros: frame.ts_micros,
                    offset: frag.offset,
                    more: frag.more,
                    payload: frag.payload.to_vec(),
                };
                match &self.ip6_tx {
                    Some(tx) => send_guarded(tx, job, &self.shutdown),
                    None => true,
                }
            }
            Some(Decoded::Udp(udp)) => self.handle_udp(frame.ts_micros, &udp),
            Some(Decoded::Tcp(tcp)) => self.handle_tcp(frame.ts_micros, &tcp),
            None => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Re-entry point for reassembled datagrams.
    fn handle_datagram(&self, datagram: &DefraggedDatagram) -> bool {
        match packet::decode_transport(
            datagram.proto,
            datagram.src,
            datagram.dst,
            &datagram.payload,
        ) {
            Some(Decoded::Udp(udp)) => self.handle_udp(datagram.ts_micros, &udp),
            Some(Decoded::Tcp(tcp)) => self.handle_tcp(datagram.ts_micros, &tcp),
            _ => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    fn handle_udp(&self, ts_micros: u64, udp: &UdpView<'_>) -> bool {
        if !self.port_match(udp.src_port, udp.dst_port) {
            return true;
        }
        match dns::parse_dns(udp.payload) {
            Ok(message) => self.emit(DnsResult {
                ts_micros,
                src_ip: udp.src,
                src_port: udp.src_port,
                dst_ip: udp.dst,
                dst_port: udp.dst_port,
                transport: Transport::Udp,
                message,
                server: self.server.clone(),
            }),
            Err(e) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("udp dns parse error: {e}");
                true
            }
        }
    }

    fn handle_tcp(&self, ts_micros: u64, tcp: &TcpView<'_>) -> bool {
        if !self.port_match(tcp.src_port, tcp.dst_port) {
            return true;
        }
        if tcp.payload.is_empty() && !tcp.fin && !tcp.rst {
            return true;
        }
        let flow = FlowKey {
            src_ip: tcp.src,
            src_port: tcp.src_port,
            dst_ip: tcp.dst,
            dst_port: tcp.dst_port,
        };
        let segment = TcpSegment {
            flow,
            ts_micros,
            seq: tcp.seq,
            fin: tcp.fin,
            rst: tcp.rst,
            payload: tcp.payload.to_vec(),
        };
        let shard = flow.shard(self.tcp_txs.len());
        send_guarded(&self.tcp_txs[shard], segment, &self.shutdown)
    }

    fn emit(&self, result: DnsResult) -> bool {
        if send_guarded(&self.result_tx, result, &self.shutdown) {
            self.counters.results_emitted.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Worker loops
// ---------------------------------------------------------------------------

/// Generic worker: consume one input channel until shutdown or disconnect.
/// The handler returns false to stop early (downstream gone).
fn run_worker<T>(input: Receiver<T>, shutdown: Shutdown, mut handle: impl FnMut(T) -> bool) {
    loop {
        select! {
            recv(input) -> msg => match msg {
                Ok(msg) => {
                    if !handle(msg) {
                        return;
                    }
                }
                Err(_) => return,
            },
            recv(shutdown.notify()) -> _ => {
                if shutdown.orderly() {
                    while let Ok(msg) = input.try_recv() {
                        if !handle(msg) {
                            return;
                        }
                    }
                }
                return;
            }
        }
    }
}

/// Source loop: reads frames, applies the sampler, feeds the decoders, and
/// keeps the capture stats record fresh.
fn run_source(
    mut source: Box<dyn PacketSource>,
    frame_tx: Sender<Frame>,
    mut sampler: Sampler,
    shutdown: Shutdown,
    capture_stats_delay: Duration,
    print_stats_delay: Duration,
) {
    let stats_tick = tick(capture_stats_delay);
    let print_tick = tick(print_stats_delay);
    let mut record = CaptureStatsRecord::default();
    let mut forwarded: u64 = 0;

    loop {
        if shutdown.requested() {
            return;
        }
        if stats_tick.try_recv().is_ok() {
            record = match source.stats() {
                Some(s) => CaptureStatsRecord::from_counters(s.received, s.dropped),
                // No kernel counters (offline source): everything we
                // forwarded arrived, nothing was lost.
                None => CaptureStatsRecord::from_counters(forwarded, 0),
            };
        }
        if print_tick.try_recv().is_ok() {
            log::info!("capture stats: {:?}", record);
        }

        match source.next_frame() {
            Ok(Some(frame)) => {
                if !sampler.accept() {
                    continue;
                }
                select! {
                    send(frame_tx, frame) -> res => {
                        if res.is_err() {
                            return;
                        }
                        forwarded += 1;
                    }
                    recv(shutdown.notify()) -> _ => return,
                }
            }
            Ok(None) => {} // poll timeout; loop to re-check tickers/shutdown
            Err(DnsWatchError::Exhausted) => {
                log::info!("packet source exhausted, draining pipeline");
                return;
            }
            Err(e) => {
                log::warn!("capture read error: {e}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline construction
// ---------------------------------------------------------------------------

/// Running pipeline. Dropping the handle without calling [`shutdown`]
/// leaves the workers draining naturally; [`join`] blocks until every
/// thread has exited.
///
/// [`shutdown`]: PipelineHandle::shutdown
/// [`join`]: PipelineHandle::join
pub struct PipelineHandle {
    trigger: ShutdownTrigger,
    threads: Vec<JoinHandle<()>>,
    counters: Arc<PipelineCounters>,
}

impl PipelineHandle {
    /// Request termination. `orderly` lets workers drain queued input;
    /// otherwise they exit at their next select.
    pub fn shutdown(&mut self, orderly: bool) {
        self.trigger.fire(orderly);
    }

    /// Wait for every pipeline thread to exit.
    pub fn join(self) {
        for handle in self.threads {
            let _ = handle.join();
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}

/// Open the configured packet source and start the pipeline.
pub fn start(config: CaptureConfig) -> Result<(PipelineHandle, Receiver<DnsResult>), DnsWatchError> {
    config.validate()?;
    let source = capture::open_source(&config)?;
    start_with_source(config, source)
}

/// Start the pipeline on an already-open source.
pub fn start_with_source(
    config: CaptureConfig,
    source: Box<dyn PacketSource>,
) -> Result<(PipelineHandle, Receiver<DnsResult>), DnsWatchError> {
    config.validate()?;

    let counters = Arc::new(PipelineCounters::default());
    let (trigger, shutdown) = shutdown_channel();

    let (frame_tx, frame_rx) = bounded::<Frame>(config.packet_channel_size);
    let (result_tx, result_rx) = bounded::<DnsResult>(config.result_channel_size);
    let (ip4_tx, ip4_rx) = bounded::<FragmentJob<Ipv4FragKey>>(config.defragger_channel_size);
    let (ip6_tx, ip6_rx) = bounded::<FragmentJob<Ipv6FragKey>>(config.defragger_channel_size);
    let (ip4_ret_tx, ip4_ret_rx) =
        bounded::<DefraggedDatagram>(config.defragger_channel_return_size);
    let (ip6_ret_tx, ip6_ret_rx) =
        bounded::<DefraggedDatagram>(config.defragger_channel_return_size);
    let (tcp_ret_tx, tcp_ret_rx) = bounded::<TcpDnsMessage>(config.tcp_result_channel_size);

    let mut tcp_txs = Vec::with_capacity(config.tcp_handler_count);
    let mut threads = Vec::new();

    let spawn = |name: String, f: Box<dyn FnOnce() + Send>| -> Result<JoinHandle<()>, DnsWatchError> {
        thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(|e| DnsWatchError::Fatal(format!("spawn {name}: {e}")))
    };

    // TCP assembler shards.
    for i in 0..config.tcp_handler_count {
        let (seg_tx, seg_rx) = bounded::<TcpSegment>(config.tcp_assembly_channel_size);
        tcp_txs.push(seg_tx);
        let out = tcp_ret_tx.clone();
        let sd = shutdown.clone();
        let ctrs = Arc::clone(&counters);
        let gc = config.gc_interval;
        threads.push(spawn(
            format!("dnswatch-tcp-{i}"),
            Box::new(move || run_tcp_assembler(seg_rx, out, gc, sd, ctrs)),
        )?);
    }
    drop(tcp_ret_tx);

    // Defragmenter actors.
    {
        let out = ip4_ret_tx;
        let sd = shutdown.clone();
        let ctrs = Arc::clone(&counters);
        let gc = config.gc_interval;
        threads.push(spawn(
            "dnswatch-defrag4".to_string(),
            Box::new(move || run_defragger(ip4_rx, out, gc, sd, ctrs)),
        )?);
    }
    {
        let out = ip6_ret_tx;
        let sd = shutdown.clone();
        let ctrs = Arc::clone(&counters);
        let gc = config.gc_interval;
        threads.push(spawn(
            "dnswatch-defrag6".to_string(),
            Box::new(move || run_defragger(ip6_rx, out, gc, sd, ctrs)),
        )?);
    }

    // Decoder worker pool.
    for i in 0..config.packet_handler_count {
        let ctx = DecoderCtx {
            port: config.port,
            server: config.server.clone(),
            ip4_tx: Some(ip4_tx.clone()),
            ip6_tx: Some(ip6_tx.clone()),
            tcp_txs: tcp_txs.clone(),
            result_tx: result_tx.clone(),
            counters: Arc::clone(&counters),
            shutdown: shutdown.clone(),
        };
        let rx = frame_rx.clone();
        let sd = shutdown.clone();
        threads.push(spawn(
            format!("dnswatch-decode-{i}"),
            Box::new(move || run_worker(rx, sd, |frame: Frame| ctx.handle_frame(&frame))),
        )?);
    }
    drop(ip4_tx);
    drop(ip6_tx);
    drop(frame_rx);

    // Defragger return drains: re-enter transport dispatch with the
    // reassembled datagram. No fragment senders here (see DecoderCtx).
    for (name, ret_rx) in [
        ("dnswatch-defrag4-drain", ip4_ret_rx),
        ("dnswatch-defrag6-drain", ip6_ret_rx),
    ] {
        let ctx = DecoderCtx {
            port: config.port,
            server: config.server.clone(),
            ip4_tx: None,
            ip6_tx: None,
            tcp_txs: tcp_txs.clone(),
            result_tx: result_tx.clone(),
            counters: Arc::clone(&counters),
            shutdown: shutdown.clone(),
        };
        let sd = shutdown.clone();
        threads.push(spawn(
            name.to_string(),
            Box::new(move || {
                run_worker(ret_rx, sd, |datagram: DefraggedDatagram| {
                    ctx.handle_datagram(&datagram)
                })
            }),
        )?);
    }
    drop(tcp_txs);

    // TCP return drain: parse each reassembled length-stripped message.
    {
        let out = result_tx.clone();
        let server = config.server.clone();
        let ctrs = Arc::clone(&counters);
        let sd = shutdown.clone();
        let sd_inner = shutdown.clone();
        threads.push(spawn(
            "dnswatch-tcp-drain".to_string(),
            Box::new(move || {
                run_worker(tcp_ret_rx, sd, |msg: TcpDnsMessage| {
                    match dns::parse_dns(&msg.payload) {
                        Ok(message) => {
                            let result = DnsResult {
                                ts_micros: msg.ts_micros,
                                src_ip: msg.flow.src_ip,
                                src_port: msg.flow.src_port,
                                dst_ip: msg.flow.dst_ip,
                                dst_port: msg.flow.dst_port,
                                transport: Transport::Tcp,
                                message,
                                server: server.clone(),
                            };
                            if send_guarded(&out, result, &sd_inner) {
                                ctrs.results_emitted.fetch_add(1, Ordering::Relaxed);
                                true
                            } else {
                                false
                            }
                        }
                        Err(e) => {
                            ctrs.parse_errors.fetch_add(1, Ordering::Relaxed);
                            log::debug!("tcp dns parse error: {e}");
                            true
                        }
                    }
                })
            }),
        )?);
    }
    drop(result_tx);

    // Source loop, gated by the sampler.
    {
        let sampler = Sampler::new(config.sample_ratio);
        let sd = shutdown.clone();
        let stats_delay = config.capture_stats_delay;
        let print_delay = config.print_stats_delay;
        threads.push(spawn(
            "dnswatch-source".to_string(),
            Box::new(move || {
                run_source(source, frame_tx, sampler, sd, stats_delay, print_delay)
            }),
        )?);
    }

    Ok((
        PipelineHandle {
            trigger,
            threads,
            counters,
        },
        result_rx,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;

    use crate::capture::SourceStats;
    use crate::config::SampleRatio;
    use crate::packet::LinkType;

    /// In-memory source for pipeline tests: yields queued frames, then EOF.
    struct VecSource {
        frames: VecDeque<Frame>,
    }

    impl PacketSource for VecSource {
        fn link_type(&self) -> LinkType {
            LinkType::Ethernet
        }

        fn next_frame(&mut self) -> Result<Option<Frame>, DnsWatchError> {
            match self.frames.pop_front() {
                Some(frame) => Ok(Some(frame)),
                None => Err(DnsWatchError::Exhausted),
            }
        }

        fn stats(&mut self) -> Option<SourceStats> {
            None
        }
    }

    /// Source that never yields anything until shutdown.
    struct IdleSource;

    impl PacketSource for IdleSource {
        fn link_type(&self) -> LinkType {
            LinkType::Ethernet
        }

        fn next_frame(&mut self) -> Result<Option<Frame>, DnsWatchError> {
            thread::sleep(Duration::from_millis(5));
            Ok(None)
        }

        fn stats(&mut self) -> Option<SourceStats> {
            Some(SourceStats {
                received: 0,
                dropped: 0,
            })
        }
    }

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            pcap_file: Some(PathBuf::from("unused.pcap")),
            packet_handler_count: 2,
            tcp_handler_count: 2,
            packet_channel_size: 64,
            tcp_assembly_channel_size: 16,
            tcp_result_channel_size: 16,
            defragger_channel_size: 16,
            defragger_channel_return_size: 16,
            result_channel_size: 64,
            ..CaptureConfig::default()
        }
    }

    fn dns_query_frame(id: u16) -> Frame {
        // Ethernet/IPv4/UDP carrying a minimal DNS query for example.com.
        let mut dns = Vec::new();
        dns.extend_from_slice(&id.to_be_bytes());
        dns.extend_from_slice(&[0x01, 0x00]);
        dns.extend_from_slice(&1u16.to_be_bytes());
        dns.extend_from_slice(&0u16.to_be_bytes());
        dns.extend_from_slice(&0u16.to_be_bytes());
        dns.extend_from_slice(&0u16.to_be_bytes());
        dns.extend_from_slice(&[7]);
        dns.extend_from_slice(b"example");
        dns.extend_from_slice(&[3]);
        dns.extend_from_slice(b"com");
        dns.push(0);
        dns.extend_from_slice(&1u16.to_be_bytes());
        dns.extend_from_slice(&1u16.to_be_bytes());

        let mut pkt = Vec::new();
        pkt.extend_from_slice(&[0u8; 12]);
        pkt.extend_from_slice(&[0x08, 0x00]);
        pkt.push(0x45);
        pkt.push(0);
        pkt.extend_from_slice(&((20 + 8 + dns.len()) as u16).to_be_bytes());
        pkt.extend_from_slice(&[0, 0, 0, 0]);
        pkt.push(64);
        pkt.push(17);
        pkt.extend_from_slice(&[0, 0]);
        pkt.extend_from_slice(&Ipv4Addr::new(10, 0, 0, 1).octets());
        pkt.extend_from_slice(&Ipv4Addr::new(10, 0, 0, 2).octets());
        pkt.extend_from_slice(&40000u16.to_be_bytes());
        pkt.extend_from_slice(&53u16.to_be_bytes());
        pkt.extend_from_slice(&((8 + dns.len()) as u16).to_be_bytes());
        pkt.extend_from_slice(&[0, 0]);
        pkt.extend_from_slice(&dns);

        Frame {
            ts_micros: u64::from(id),
            link: LinkType::Ethernet,
            data: pkt,
        }
    }

    #[test]
    fn udp_queries_flow_end_to_end() {
        let frames: VecDeque<Frame> = (0..10).map(dns_query_frame).collect();
        let source = Box::new(VecSource { frames });
        let (handle, results) = start_with_source(test_config(), source).unwrap();

        let mut seen = Vec::new();
        while let Ok(result) = results.recv_timeout(Duration::from_secs(2)) {
            seen.push(result);
        }
        handle.join();

        assert_eq!(seen.len(), 10);
        for result in &seen {
            assert_eq!(result.transport, Transport::Udp);
            assert_eq!(result.src_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
            assert_eq!(result.dst_port, 53);
            assert_eq!(result.message.questions[0].name, "example.com.");
            assert_eq!(result.server, "default");
        }
        // After termination the channel is closed for good.
        assert!(results.try_recv().is_err());
    }

    #[test]
    fn sampler_zero_drops_everything() {
        let frames: VecDeque<Frame> = (0..10).map(dns_query_frame).collect();
        let source = Box::new(VecSource { frames });
        let config = CaptureConfig {
            sample_ratio: SampleRatio { a: 0, b: 2 },
            ..test_config()
        };
        let (handle, results) = start_with_source(config, source).unwrap();
        handle.join();
        assert!(results.try_recv().is_err());
    }

    #[test]
    fn sampler_ratio_applies_before_decoding() {
        let frames: VecDeque<Frame> = (0..10).map(dns_query_frame).collect();
        let source = Box::new(VecSource { frames });
        let config = CaptureConfig {
            sample_ratio: SampleRatio { a: 1, b: 2 },
            ..test_config()
        };
        let (handle, results) = start_with_source(config, source).unwrap();
        let mut count = 0;
        while results.recv_timeout(Duration::from_secs(2)).is_ok() {
            count += 1;
        }
        handle.join();
        assert_eq!(count, 5);
    }

    #[test]
    fn immediate_shutdown_with_no_traffic_terminates_cleanly() {
        let (mut handle, results) = start_with_source(test_config(), Box::new(IdleSource)).unwrap();
        thread::sleep(Duration::from_millis(30));
        handle.shutdown(false);
        let start = std::time::Instant::now();
        handle.join();
        assert!(start.elapsed() < Duration::from_secs(10));
        // Closed and empty.
        assert!(matches!(
            results.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn malformed_frames_are_counted_not_fatal() {
        let mut frames: VecDeque<Frame> = VecDeque::new();
        frames.push_back(Frame {
            ts_micros: 1,
            link: LinkType::Ethernet,
            data: vec![0xFF; 5],
        });
        frames.push_back(dns_query_frame(1));
        let source = Box::new(VecSource { frames });
        let (handle, results) = start_with_source(test_config(), source).unwrap();
        let mut seen = 0;
        while results.recv_timeout(Duration::from_secs(2)).is_ok() {
            seen += 1;
        }
        let counters = handle.counters();
        handle.join();
        assert_eq!(seen, 1);
        assert_eq!(counters.parse_errors, 1);
        assert_eq!(counters.frames_processed, 2);
    }
}
