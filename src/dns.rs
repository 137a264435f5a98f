// DNS wire format parser — RFC 1035 Section 4 implementation.
//
// Parses the DNS header, question section (with name decompression), and
// answer section (A, AAAA, CNAME, NS, PTR, MX, TXT, SOA). EDNS0 OPT records
// in the additional section are skipped. The payload handed in must begin
// at the DNS header: the UDP payload for DNS-over-UDP, or the TCP payload
// after the 2-byte length prefix has been stripped.

use serde::Serialize;

use crate::error::DnsWatchError;

/// Maximum total name length per RFC 1035 Section 3.1, counting label
/// bytes and separators. Bounds the output even under hostile compression.
const MAX_NAME_LENGTH: usize = 255;

/// DNS header size in bytes.
const HEADER_SIZE: usize = 12;

/// Cap on preallocated section capacity. Declared counts are attacker
/// controlled; longer sections still parse, they just reallocate.
const MAX_SECTION_PREALLOC: usize = 32;

// DNS record type constants.
const TYPE_A: u16 = 1;
const TYPE_NS: u16 = 2;
const TYPE_CNAME: u16 = 5;
const TYPE_SOA: u16 = 6;
const TYPE_PTR: u16 = 12;
const TYPE_MX: u16 = 15;
const TYPE_TXT: u16 = 16;
const TYPE_AAAA: u16 = 28;
const TYPE_OPT: u16 = 41;

/// DNS response codes.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    FormErr,
    ServFail,
    NXDomain,
    NotImp,
    Refused,
    Other(u8),
}

impl Rcode {
    fn from_u8(val: u8) -> Self {
        match val & 0x0F {
            0 => Self::NoError,
            1 => Self::FormErr,
            2 => Self::ServFail,
            3 => Self::NXDomain,
            4 => Self::NotImp,
            5 => Self::Refused,
            n => Self::Other(n),
        }
    }
}

impl std::fmt::Display for Rcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoError => write!(f, "NOERROR"),
            Self::FormErr => write!(f, "FORMERR"),
            Self::ServFail => write!(f, "SERVFAIL"),
            Self::NXDomain => write!(f, "NXDOMAIN"),
            Self::NotImp => write!(f, "NOTIMP"),
            Self::Refused => write!(f, "REFUSED"),
            Self::Other(n) => write!(f, "RCODE({})", n),
        }
    }
}

/// DNS record type as parsed from wire format.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum RecordType {
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    OPT,
    Other(u16),
}

impl RecordType {
    fn from_u16(val: u16) -> Self {
        match val {
            TYPE_A => Self::A,
            TYPE_NS => Self::NS,
            TYPE_CNAME => Self::CNAME,
            TYPE_SOA => Self::SOA,
            TYPE_PTR => Self::PTR,
            TYPE_MX => Self::MX,
            TYPE_TXT => Self::TXT,
            TYPE_AAAA => Self::AAAA,
            TYPE_OPT => Self::OPT,
            n => Self::Other(n),
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::NS => write!(f, "NS"),
            Self::CNAME => write!(f, "CNAME"),
            Self::SOA => write!(f, "SOA"),
            Self::PTR => write!(f, "PTR"),
            Self::MX => write!(f, "MX"),
            Self::TXT => write!(f, "TXT"),
            Self::AAAA => write!(f, "AAAA"),
            Self::OPT => write!(f, "OPT"),
            Self::Other(n) => write!(f, "TYPE({})", n),
        }
    }
}

/// A single DNS question entry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

/// A single DNS answer resource record.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    pub rtype: RecordType,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: String,
}

/// A fully parsed DNS message.
#[derive(Debug, Clone, Serialize)]
pub struct DnsMessage {
    pub id: u16,
    pub is_response: bool,
    pub opcode: u8,
    pub rcode: Rcode,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsAnswer>,
}

/// Parse a DNS message from its wire format representation.
pub fn parse_dns(payload: &[u8]) -> Result<DnsMessage, DnsWatchError> {
    if payload.len() < HEADER_SIZE {
        return Err(parse_err(0, "truncated DNS header"));
    }

    // -- Header (12 bytes) --
    let id = u16::from_be_bytes([payload[0], payload[1]]);
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    let ancount = u16::from_be_bytes([payload[6], payload[7]]) as usize;
    let nscount = u16::from_be_bytes([payload[8], payload[9]]) as usize;
    let arcount = u16::from_be_bytes([payload[10], payload[11]]) as usize;

    let is_response = (flags >> 15) & 1 == 1;
    let opcode = ((flags >> 11) & 0x0F) as u8;
    let rcode = Rcode::from_u8((flags & 0x0F) as u8);

    let mut offset = HEADER_SIZE;

    // -- Question section --
    let mut questions = Vec::with_capacity(qdcount.min(MAX_SECTION_PREALLOC));
    for _ in 0..qdcount {
        let (name, new_offset) = decompress_name(payload, offset)?;
        offset = new_offset;

        if offset + 4 > payload.len() {
            return Err(parse_err(offset, "truncated question section"));
        }

        let qtype = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        let qclass = u16::from_be_bytes([payload[offset + 2], payload[offset + 3]]);
        offset += 4;

        questions.push(DnsQuestion {
            name,
            qtype: RecordType::from_u16(qtype),
            qclass,
        });
    }

    // -- Answer section --
    let mut answers = Vec::with_capacity(ancount.min(MAX_SECTION_PREALLOC));
    for _ in 0..ancount {
        let (answer, new_offset) = parse_resource_record(payload, offset)?;
        offset = new_offset;
        answers.push(answer);
    }

    // -- Authority and additional sections: advance past, keep nothing.
    // EDNS0 OPT pseudo-records in the additional section land here too.
    for _ in 0..nscount + arcount {
        let (_, new_offset) = parse_resource_record(payload, offset)?;
        offset = new_offset;
    }

    Ok(DnsMessage {
        id,
        is_response,
        opcode,
        rcode,
        questions,
        answers,
    })
}

fn parse_err(offset: usize, detail: impl Into<String>) -> DnsWatchError {
    DnsWatchError::DnsParse {
        offset,
        detail: detail.into(),
    }
}

/// Parse a resource record starting at `offset`. Returns the parsed record
/// and the offset immediately after it.
fn parse_resource_record(buf: &[u8], offset: usize) -> Result<(DnsAnswer, usize), DnsWatchError> {
    let (name, mut offset) = decompress_name(buf, offset)?;

    if offset + 10 > buf.len() {
        return Err(parse_err(offset, "truncated resource record header"));
    }

    let rtype = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
    let rclass = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]);
    let ttl = u32::from_be_bytes([
        buf[offset + 4],
        buf[offset + 5],
        buf[offset + 6],
        buf[offset + 7],
    ]);
    let rdlength = u16::from_be_bytes([buf[offset + 8], buf[offset + 9]]) as usize;
    offset += 10;

    if offset + rdlength > buf.len() {
        return Err(parse_err(offset, "truncated resource record rdata"));
    }

    let record_type = RecordType::from_u16(rtype);
    let rdata = parse_rdata(buf, offset, rdlength, record_type)?;
    offset += rdlength;

    Ok((
        DnsAnswer {
            name,
            rtype: record_type,
            rclass,
            ttl,
            rdata,
        },
        offset,
    ))
}

/// Parse the RDATA portion of a resource record into a printable string.
fn parse_rdata(
    buf: &[u8],
    offset: usize,
    rdlength: usize,
    rtype: RecordType,
) -> Result<String, DnsWatchError> {
    match rtype {
        RecordType::A => {
            if rdlength != 4 {
                return Err(parse_err(offset, "A record rdata length != 4"));
            }
            let addr = std::net::Ipv4Addr::new(
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            );
            Ok(addr.to_string())
        }
        RecordType::AAAA => {
            if rdlength != 16 {
                return Err(parse_err(offset, "AAAA record rdata length != 16"));
            }
            let octets: [u8; 16] = buf[offset..offset + 16]
                .try_into()
                .map_err(|_| parse_err(offset, "AAAA record rdata length != 16"))?;
            // Standard Ipv6Addr formatting gives proper zero-compression.
            Ok(std::net::Ipv6Addr::from(octets).to_string())
        }
        RecordType::CNAME | RecordType::NS | RecordType::PTR => {
            let (name, _) = decompress_name(buf, offset)?;
            Ok(name)
        }
        RecordType::MX => {
            if rdlength < 3 {
                return Err(parse_err(offset, "MX record rdata too short"));
            }
            let preference = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let (exchange, _) = decompress_name(buf, offset + 2)?;
            Ok(format!("{} {}", preference, exchange))
        }
        RecordType::TXT => {
            // One or more <length, bytes> character-strings, concatenated.
            let mut out = String::new();
            let mut pos = offset;
            let end = offset + rdlength;
            while pos < end {
                let len = buf[pos] as usize;
                pos += 1;
                if pos + len > end {
                    return Err(parse_err(pos, "truncated TXT string"));
                }
                out.push_str(&String::from_utf8_lossy(&buf[pos..pos + len]));
                pos += len;
            }
            Ok(out)
        }
        RecordType::SOA => {
            let (mname, after_mname) = decompress_name(buf, offset)?;
            let (rname, after_rname) = decompress_name(buf, after_mname)?;
            if after_rname + 4 > buf.len() || after_rname + 4 > offset + rdlength {
                return Err(parse_err(after_rname, "truncated SOA rdata"));
            }
            let serial = u32::from_be_bytes([
                buf[after_rname],
                buf[after_rname + 1],
                buf[after_rname + 2],
                buf[after_rname + 3],
            ]);
            Ok(format!("{} {} {}", mname, rname, serial))
        }
        // OPT pseudo-record: rdata is opaque EDNS options.
        RecordType::OPT => Ok(String::new()),
        RecordType::Other(_) => {
            // Unknown record type: represent rdata as hex.
            let hex: Vec<String> = buf[offset..offset + rdlength]
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect();
            Ok(hex.join(""))
        }
    }
}

/// Read a possibly-compressed name (RFC 1035 Section 4.1.4) starting at
/// `offset`. Returns the dotted name (trailing dot, "." for the root) and
/// the offset of the field behind the name — behind the first pointer when
/// the name is compressed.
///
/// Compression pointers are only valid when they reference an earlier part
/// of the message, so each jump must land strictly before the previous
/// one. That rule alone makes the walk finite; no hop budget is needed.
fn decompress_name(buf: &[u8], offset: usize) -> Result<(String, usize), DnsWatchError> {
    let mut name = String::new();
    let mut pos = offset;
    // Offset of the field behind the inline portion of the name, known
    // once the first pointer or the terminator is seen.
    let mut next_field = None;
    // Every pointer target must land below this.
    let mut jump_floor = offset;

    loop {
        let tag = *buf
            .get(pos)
            .ok_or_else(|| parse_err(pos, "name runs past end of message"))?;
        match tag {
            // Terminator.
            0 => {
                if name.is_empty() {
                    name.push('.');
                }
                return Ok((name, next_field.unwrap_or(pos + 1)));
            }
            // Compression pointer: low 6 bits + next byte.
            tag if tag & 0xC0 == 0xC0 => {
                let low = *buf
                    .get(pos + 1)
                    .ok_or_else(|| parse_err(pos, "name runs past end of message"))?;
                let target = usize::from(tag & 0x3F) << 8 | usize::from(low);
                if target >= jump_floor {
                    return Err(parse_err(pos, "forward or cyclic name pointer"));
                }
                next_field.get_or_insert(pos + 2);
                jump_floor = target;
                pos = target;
            }
            // 0x40/0x80 label types were never standardized.
            tag if tag & 0xC0 != 0 => {
                return Err(parse_err(pos, "reserved label type"));
            }
            // Plain label; the two clear top bits cap it at 63 bytes.
            len => {
                let len = usize::from(len);
                let label = buf
                    .get(pos + 1..pos + 1 + len)
                    .ok_or_else(|| parse_err(pos, "name runs past end of message"))?;
                name.push_str(&String::from_utf8_lossy(label));
                name.push('.');
                if name.len() > MAX_NAME_LENGTH {
                    return Err(parse_err(pos, "name exceeds 255 octets"));
                }
                pos += 1 + len;
            }
        }
    }
}
