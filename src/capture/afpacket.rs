// Linux AF_PACKET capture.
//
// Raw socket bound to one interface with a kernel receive buffer sized in
// megabytes. A classic-BPF program attached with SO_ATTACH_FILTER narrows
// the stream to IPv4/IPv6 TCP, UDP, and IPv6 fragments in-kernel; the
// filter deliberately matches by IP protocol rather than port so that
// fragmented datagrams still reach the defraggers. Kernel drop counters
// come from PACKET_STATISTICS.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::capture::{Frame, PacketSource, SourceStats};
use crate::error::DnsWatchError;
use crate::packet::LinkType;

// ---------------------------------------------------------------------------
// AF_PACKET constants
// ---------------------------------------------------------------------------

const ETH_P_ALL: u16 = 0x0003;
const SOL_PACKET: i32 = 263;
const PACKET_ADD_MEMBERSHIP: i32 = 1;
const PACKET_STATISTICS: i32 = 6;
const PACKET_MR_PROMISC: u16 = 1;

// Largest frame we expect off the wire (jumbo-safe).
const FRAME_BUF_LEN: usize = 65_536;

// Classic BPF opcodes
const BPF_LD: u16 = 0x00;
const BPF_H: u16 = 0x08;
const BPF_B: u16 = 0x10;
const BPF_ABS: u16 = 0x20;
const BPF_ALU: u16 = 0x04;
const BPF_AND: u16 = 0x50;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_RET: u16 = 0x06;
const BPF_K: u16 = 0x00;

#[repr(C)]
#[derive(Clone, Copy)]
struct sock_filter {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

#[repr(C)]
struct sock_fprog {
    len: u16,
    filter: *mut sock_filter,
}

#[repr(C)]
struct packet_mreq {
    mr_ifindex: i32,
    mr_type: u16,
    mr_alen: u16,
    mr_address: [u8; 8],
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct tpacket_stats {
    tp_packets: u32,
    tp_drops: u32,
}

pub struct AfpacketSource {
    fd: OwnedFd,
    buffer: Vec<u8>,
    interface: String,
    link: LinkType,
    // PACKET_STATISTICS counters reset on every read; accumulate here.
    received: u64,
    dropped: u64,
}

impl AfpacketSource {
    pub fn open(
        interface: &str,
        buffer_mb: u32,
        no_ethernet_frame: bool,
    ) -> Result<Self, DnsWatchError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (ETH_P_ALL as u32).to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(DnsWatchError::Capture(format!(
                "socket(AF_PACKET) failed: {}",
                io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let if_index = if_nametoindex(interface)?;

        // Bind to the interface.
        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = ETH_P_ALL.to_be();
        sll.sll_ifindex = if_index as i32;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(DnsWatchError::Capture(format!(
                "bind(AF_PACKET, {}) failed: {}",
                interface,
                io::Error::last_os_error()
            )));
        }

        // The filter program must agree with the link framing: byte
        // offsets shift by the 14-byte Ethernet header.
        let link = if no_ethernet_frame {
            LinkType::Raw
        } else {
            LinkType::Ethernet
        };
        let filter = match link {
            LinkType::Ethernet => protocol_filter_ethernet(),
            LinkType::Raw => protocol_filter_raw(),
        };
        install_filter(&fd, &filter)?;

        // Read timeout keeps the source loop responsive to shutdown.
        let timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: 500_000,
        };
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            log::warn!(
                "SO_RCVTIMEO failed on {}: {}",
                interface,
                io::Error::last_os_error()
            );
        }

        // Kernel receive buffer, sized from the configured MB knob. This is
        // what absorbs bursts before the sampler and decoders catch up.
        let buf_size = (buffer_mb.max(1) as i32).saturating_mul(1024 * 1024);
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &buf_size as *const i32 as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            log::warn!(
                "SO_RCVBUF failed on {}: {}",
                interface,
                io::Error::last_os_error()
            );
        }

        // Promiscuous mode.
        let mreq = packet_mreq {
            mr_ifindex: if_index as i32,
            mr_type: PACKET_MR_PROMISC,
            mr_alen: 0,
            mr_address: [0u8; 8],
        };
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                SOL_PACKET,
                PACKET_ADD_MEMBERSHIP,
                &mreq as *const packet_mreq as *const libc::c_void,
                std::mem::size_of::<packet_mreq>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            log::warn!(
                "PACKET_MR_PROMISC failed on {}: {} (continuing without promiscuous mode)",
                interface,
                io::Error::last_os_error()
            );
        }

        log::info!(
            "AF_PACKET capture on {} (if_index={}, buffer={}MB)",
            interface,
            if_index,
            buffer_mb
        );

        Ok(Self {
            fd,
            buffer: vec![0u8; FRAME_BUF_LEN],
            interface: interface.to_string(),
            link,
            received: 0,
            dropped: 0,
        })
    }
}

impl PacketSource for AfpacketSource {
    fn link_type(&self) -> LinkType {
        self.link
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, DnsWatchError> {
        let n = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                self.buffer.as_mut_ptr() as *mut libc::c_void,
                self.buffer.len(),
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN)
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EINTR)
            {
                return Ok(None);
            }
            return Err(DnsWatchError::Capture(format!(
                "recvfrom on {} failed: {}",
                self.interface, err
            )));
        }
        if n == 0 {
            return Ok(None);
        }

        let ts_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Ok(Some(Frame {
            ts_micros,
            link: self.link,
            data: self.buffer[..n as usize].to_vec(),
        }))
    }

    fn stats(&mut self) -> Option<SourceStats> {
        let mut stats = tpacket_stats::default();
        let mut len = std::mem::size_of::<tpacket_stats>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                SOL_PACKET,
                PACKET_STATISTICS,
                &mut stats as *mut tpacket_stats as *mut libc::c_void,
                &mut len,
            )
        };
        if ret == 0 {
            self.received += u64::from(stats.tp_packets);
            self.dropped += u64::from(stats.tp_drops);
        }
        Some(SourceStats {
            received: self.received,
            dropped: self.dropped,
        })
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn if_nametoindex(name: &str) -> Result<u32, DnsWatchError> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| DnsWatchError::Capture("invalid interface name".to_string()))?;
    let idx = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if idx == 0 {
        return Err(DnsWatchError::Capture(format!(
            "if_nametoindex({}) failed: {}",
            name,
            io::Error::last_os_error()
        )));
    }
    Ok(idx)
}

fn install_filter(fd: &OwnedFd, filter: &[sock_filter]) -> Result<(), DnsWatchError> {
    let mut insns = filter.to_vec();
    let prog = sock_fprog {
        len: insns.len() as u16,
        filter: insns.as_mut_ptr(),
    };
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &prog as *const sock_fprog as *const libc::c_void,
            std::mem::size_of::<sock_fprog>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(DnsWatchError::Filter(format!(
            "SO_ATTACH_FILTER failed: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn insn(code: u16, jt: u8, jf: u8, k: u32) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

/// Accept IPv4 TCP/UDP and IPv6 TCP/UDP/fragment on an Ethernet-framed
/// interface, reject everything else.
fn protocol_filter_ethernet() -> Vec<sock_filter> {
    vec![
        // Load EtherType at offset 12
        insn(BPF_LD | BPF_H | BPF_ABS, 0, 0, 12),
        // If IPv4 (0x0800), check the protocol byte; else try IPv6
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 3, 0x0800),
        // Load IPv4 protocol at offset 23 (14 + 9)
        insn(BPF_LD | BPF_B | BPF_ABS, 0, 0, 23),
        // TCP (6) -> accept
        insn(BPF_JMP | BPF_JEQ | BPF_K, 6, 0, 6),
        // UDP (17) -> accept, else reject
        insn(BPF_JMP | BPF_JEQ | BPF_K, 5, 6, 17),
        // If IPv6 (0x86DD), check the next header; else reject
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 5, 0x86DD),
        // Load IPv6 next header at offset 20 (14 + 6)
        insn(BPF_LD | BPF_B | BPF_ABS, 0, 0, 20),
        // TCP (6) -> accept
        insn(BPF_JMP | BPF_JEQ | BPF_K, 2, 0, 6),
        // UDP (17) -> accept
        insn(BPF_JMP | BPF_JEQ | BPF_K, 1, 0, 17),
        // Fragment header (44) -> accept, else reject
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 1, 44),
        // Accept: pass the whole frame
        insn(BPF_RET | BPF_K, 0, 0, 0xFFFF),
        // Reject
        insn(BPF_RET | BPF_K, 0, 0, 0),
    ]
}

/// Same predicate for raw IP framing: the IP header starts at offset 0,
/// so the version comes from the first nibble instead of an EtherType.
fn protocol_filter_raw() -> Vec<sock_filter> {
    vec![
        // Load the first byte and isolate the version nibble
        insn(BPF_LD | BPF_B | BPF_ABS, 0, 0, 0),
        insn(BPF_ALU | BPF_AND | BPF_K, 0, 0, 0xF0),
        // If IPv4 (0x40), check the protocol byte; else try IPv6
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 3, 0x40),
        // Load IPv4 protocol at offset 9
        insn(BPF_LD | BPF_B | BPF_ABS, 0, 0, 9),
        // TCP (6) -> accept
        insn(BPF_JMP | BPF_JEQ | BPF_K, 6, 0, 6),
        // UDP (17) -> accept, else reject
        insn(BPF_JMP | BPF_JEQ | BPF_K, 5, 6, 17),
        // If IPv6 (0x60), check the next header; else reject
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 5, 0x60),
        // Load IPv6 next header at offset 6
        insn(BPF_LD | BPF_B | BPF_ABS, 0, 0, 6),
        // TCP (6) -> accept
        insn(BPF_JMP | BPF_JEQ | BPF_K, 2, 0, 6),
        // UDP (17) -> accept
        insn(BPF_JMP | BPF_JEQ | BPF_K, 1, 0, 17),
        // Fragment header (44) -> accept, else reject
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 1, 44),
        // Accept: pass the whole frame
        insn(BPF_RET | BPF_K, 0, 0, 0xFFFF),
        // Reject
        insn(BPF_RET | BPF_K, 0, 0, 0),
    ]
}
