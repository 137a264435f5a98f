// Link/IP/transport layer decoding for captured frames.
//
// Parses Ethernet + IPv4/IPv6 + TCP/UDP headers from raw capture buffers
// and classifies each frame into the pipeline stage that must handle it
// next: an IP fragment goes to a defragmenter, a whole datagram goes
// straight to transport dispatch. Decoding is zero-copy; every view
// borrows from the frame buffer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// ---------------------------------------------------------------------------
// Data link type
// ---------------------------------------------------------------------------

/// Data link framing of a capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet (DLT_EN10MB): 14-byte header, EtherType at offset 12.
    Ethernet,
    /// Raw IP: no link-layer header, IP version from the first nibble.
    Raw,
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

// Ethernet
const ETH_HLEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;

// IPv4
const IPV4_MIN_HLEN: usize = 20;
const IPV4_TOTAL_LEN_OFFSET: usize = 2;
const IPV4_IDENT_OFFSET: usize = 4;
const IPV4_FLAGS_FRAG_OFFSET: usize = 6;
const IPV4_PROTO_OFFSET: usize = 9;
const IPV4_SRC_OFFSET: usize = 12;
const IPV4_DST_OFFSET: usize = 16;
const IPV4_MF: u16 = 0x2000;
const IPV4_FRAG_OFFSET_MASK: u16 = 0x1FFF;

// IPv6
const IPV6_HLEN: usize = 40;
const IPV6_PAYLOAD_LEN_OFFSET: usize = 4;
const IPV6_NEXT_HDR_OFFSET: usize = 6;
const IPV6_SRC_OFFSET: usize = 8;
const IPV6_DST_OFFSET: usize = 24;
const IPV6_FRAG_HLEN: usize = 8;

// L4 protocol numbers
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

// IPv6 extension header protocol numbers
const EXT_HOP_BY_HOP: u8 = 0;
const EXT_ROUTING: u8 = 43;
const EXT_FRAGMENT: u8 = 44;
const EXT_DEST_OPTIONS: u8 = 60;

// TCP flag bits
const TCP_FIN: u8 = 0x01;
const TCP_RST: u8 = 0x04;

// ---------------------------------------------------------------------------
// Fragment keys
// ---------------------------------------------------------------------------

/// Identifies one IPv4 fragmentation context (RFC 791).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4FragKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub ident: u16,
}

/// Identifies one IPv6 fragmentation context (RFC 8200 §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6FragKey {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub flow_label: u32,
    pub ident: u32,
}

// ---------------------------------------------------------------------------
// Decoded views
// ---------------------------------------------------------------------------

/// An IPv4 fragment awaiting reassembly. `offset` is in bytes.
#[derive(Debug)]
pub struct Ipv4Fragment<'a> {
    pub key: Ipv4FragKey,
    pub offset: u32,
    pub more: bool,
    pub payload: &'a [u8],
}

/// An IPv6 fragment awaiting reassembly. `proto` is the Next Header value
/// carried by the fragment extension header.
#[derive(Debug)]
pub struct Ipv6Fragment<'a> {
    pub key: Ipv6FragKey,
    pub proto: u8,
    pub offset: u32,
    pub more: bool,
    pub payload: &'a [u8],
}

/// A whole UDP datagram.
#[derive(Debug)]
pub struct UdpView<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

/// A whole TCP segment.
#[derive(Debug)]
pub struct TcpView<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub fin: bool,
    pub rst: bool,
    pub payload: &'a [u8],
}

/// Where a decoded frame goes next.
#[derive(Debug)]
pub enum Decoded<'a> {
    Ipv4Fragment(Ipv4Fragment<'a>),
    Ipv6Fragment(Ipv6Fragment<'a>),
    Udp(UdpView<'a>),
    Tcp(TcpView<'a>),
}

// ---------------------------------------------------------------------------
// Frame decoding
// ---------------------------------------------------------------------------

/// Decode a raw frame down to its routing decision.
///
/// Returns `None` for anything the pipeline does not handle: truncated
/// headers, non-IP EtherTypes, transports other than TCP/UDP.
pub fn decode_frame(data: &[u8], link: LinkType) -> Option<Decoded<'_>> {
    match link {
        LinkType::Ethernet => decode_ethernet(data),
        LinkType::Raw => decode_ip(data),
    }
}

fn decode_ethernet(data: &[u8]) -> Option<Decoded<'_>> {
    if data.len() < ETH_HLEN {
        return None;
    }
    let mut ethertype = u16::from_be_bytes([data[12], data[13]]);
    let mut l3_start = ETH_HLEN;

    // Single 802.1Q tag.
    if ethertype == ETHERTYPE_VLAN {
        if data.len() < ETH_HLEN + 4 {
            return None;
        }
        ethertype = u16::from_be_bytes([data[16], data[17]]);
        l3_start = ETH_HLEN + 4;
    }

    match ethertype {
        ETHERTYPE_IPV4 => decode_ipv4(&data[l3_start..]),
        ETHERTYPE_IPV6 => decode_ipv6(&data[l3_start..]),
        _ => None,
    }
}

/// Decode starting at the IP header, version from the first nibble.
pub fn decode_ip(data: &[u8]) -> Option<Decoded<'_>> {
    match data.first()? >> 4 {
        4 => decode_ipv4(data),
        6 => decode_ipv6(data),
        _ => None,
    }
}

fn decode_ipv4(data: &[u8]) -> Option<Decoded<'_>> {
    if data.len() < IPV4_MIN_HLEN {
        return None;
    }

    let ihl = ((data[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_MIN_HLEN || data.len() < ihl {
        return None;
    }

    let total_len = u16::from_be_bytes([
        data[IPV4_TOTAL_LEN_OFFSET],
        data[IPV4_TOTAL_LEN_OFFSET + 1],
    ]) as usize;
    // Clamp to the declared total length so Ethernet padding never leaks
    // into the payload, but never past the captured bytes either.
    let end = total_len.clamp(ihl, data.len());

    let src = Ipv4Addr::new(
        data[IPV4_SRC_OFFSET],
        data[IPV4_SRC_OFFSET + 1],
        data[IPV4_SRC_OFFSET + 2],
        data[IPV4_SRC_OFFSET + 3],
    );
    let dst = Ipv4Addr::new(
        data[IPV4_DST_OFFSET],
        data[IPV4_DST_OFFSET + 1],
        data[IPV4_DST_OFFSET + 2],
        data[IPV4_DST_OFFSET + 3],
    );
    let proto = data[IPV4_PROTO_OFFSET];
    let payload = &data[ihl..end];

    let flags_frag = u16::from_be_bytes([
        data[IPV4_FLAGS_FRAG_OFFSET],
        data[IPV4_FLAGS_FRAG_OFFSET + 1],
    ]);
    let more = flags_frag & IPV4_MF != 0;
    let offset = u32::from(flags_frag & IPV4_FRAG_OFFSET_MASK) * 8;

    if more || offset != 0 {
        let ident = u16::from_be_bytes([data[IPV4_IDENT_OFFSET], data[IPV4_IDENT_OFFSET + 1]]);
        return Some(Decoded::Ipv4Fragment(Ipv4Fragment {
            key: Ipv4FragKey { src, dst, proto, ident },
            offset,
            more,
            payload,
        }));
    }

    decode_transport(proto, IpAddr::V4(src), IpAddr::V4(dst), payload)
}

fn decode_ipv6(data: &[u8]) -> Option<Decoded<'_>> {
    if data.len() < IPV6_HLEN {
        return None;
    }

    let payload_len = u16::from_be_bytes([
        data[IPV6_PAYLOAD_LEN_OFFSET],
        data[IPV6_PAYLOAD_LEN_OFFSET + 1],
    ]) as usize;
    let end = (IPV6_HLEN + payload_len).min(data.len());

    let flow_label = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x000F_FFFF;
    let src_bytes: [u8; 16] = data[IPV6_SRC_OFFSET..IPV6_SRC_OFFSET + 16].try_into().ok()?;
    let dst_bytes: [u8; 16] = data[IPV6_DST_OFFSET..IPV6_DST_OFFSET + 16].try_into().ok()?;
    let src = Ipv6Addr::from(src_bytes);
    let dst = Ipv6Addr::from(dst_bytes);

    let mut next_hdr = data[IPV6_NEXT_HDR_OFFSET];
    let mut pos = IPV6_HLEN;

    loop {
        match next_hdr {
            EXT_HOP_BY_HOP | EXT_ROUTING | EXT_DEST_OPTIONS => {
                if pos + 2 > end {
                    return None;
                }
                let ext_len = (data[pos + 1] as usize + 1) * 8;
                if pos + ext_len > end {
                    return None;
                }
                next_hdr = data[pos];
                pos += ext_len;
            }
            EXT_FRAGMENT => {
                if pos + IPV6_FRAG_HLEN > end {
                    return None;
                }
                let frag_next = data[pos];
                let off_flags = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);
                let offset = u32::from(off_flags >> 3) * 8;
                let more = off_flags & 1 != 0;
                let ident = u32::from_be_bytes([
                    data[pos + 4],
                    data[pos + 5],
                    data[pos + 6],
                    data[pos + 7],
                ]);
                pos += IPV6_FRAG_HLEN;

                // Atomic fragment (offset 0, M=0): nothing to reassemble,
                // keep walking and dispatch directly.
                if offset == 0 && !more {
                    next_hdr = frag_next;
                    continue;
                }

                return Some(Decoded::Ipv6Fragment(Ipv6Fragment {
                    key: Ipv6FragKey { src, dst, flow_label, ident },
                    proto: frag_next,
                    offset,
                    more,
                    payload: &data[pos..end],
                }));
            }
            _ => {
                return decode_transport(
                    next_hdr,
                    IpAddr::V6(src),
                    IpAddr::V6(dst),
                    &data[pos..end],
                );
            }
        }
    }
}

/// Transport dispatch: the entry point for both freshly decoded datagrams
/// and reassembled ones coming back from a defragmenter.
pub fn decode_transport<'a>(
    proto: u8,
    src: IpAddr,
    dst: IpAddr,
    l4: &'a [u8],
) -> Option<Decoded<'a>> {
    match proto {
        PROTO_UDP => {
            if l4.len() < 8 {
                return None;
            }
            let src_port = u16::from_be_bytes([l4[0], l4[1]]);
            let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
            let udp_len = u16::from_be_bytes([l4[4], l4[5]]) as usize;
            let end = udp_len.clamp(8, l4.len());
            Some(Decoded::Udp(UdpView {
                src,
                dst,
                src_port,
                dst_port,
                payload: &l4[8..end],
            }))
        }
        PROTO_TCP => {
            if l4.len() < 20 {
                return None;
            }
            let src_port = u16::from_be_bytes([l4[0], l4[1]]);
            let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
            let seq = u32::from_be_bytes([l4[4], l4[5], l4[6], l4[7]]);
            let data_offset = ((l4[12] >> 4) as usize) * 4;
            if data_offset < 20 || l4.len() < data_offset {
                return None;
            }
            let flags = l4[13];
            Some(Decoded::Tcp(TcpView {
                src,
                dst,
                src_port,
                dst_port,
                seq,
                fin: flags & TCP_FIN != 0,
                rst: flags & TCP_RST != 0,
                payload: &l4[data_offset..],
            }))
        }
        _ => None,
    }
}

// ===========================================================================
// Unit tests
// ===========================================================================
