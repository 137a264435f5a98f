// Packet source abstraction.
//
// Three variants behind one trait:
//   - live.rs: libpcap capture on a named interface, BPF filter installed
//   - afpacket.rs: raw AF_PACKET socket with a kernel buffer sized in MB
//     (Linux only)
//   - file.rs: offline capture file, read sequentially
//
// Sources yield timestamped raw frames; nothing above the link layer is
// parsed here. Frame bytes are copied exactly once, off the capture buffer
// into the channel message that the decoder pool consumes.

use crate::config::CaptureConfig;
use crate::error::DnsWatchError;
use crate::packet::LinkType;

#[cfg(target_os = "linux")]
pub mod afpacket;
pub mod file;
pub mod live;

/// A raw captured frame, consumed exactly once by a decoder worker.
#[derive(Debug)]
pub struct Frame {
    /// Capture timestamp in microseconds since epoch.
    pub ts_micros: u64,
    pub link: LinkType,
    pub data: Vec<u8>,
}

/// Kernel-reported capture counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceStats {
    pub received: u64,
    pub dropped: u64,
}

/// A stream of raw frames plus its capture health counters.
pub trait PacketSource: Send {
    /// Link-layer framing of every frame this source yields.
    fn link_type(&self) -> LinkType;

    /// Blocking read with a short poll timeout.
    ///
    /// `Ok(None)` means the timeout elapsed with no frame (re-check
    /// shutdown and tickers); `Err(DnsWatchError::Exhausted)` means the
    /// source has permanently ended.
    fn next_frame(&mut self) -> Result<Option<Frame>, DnsWatchError>;

    /// Kernel capture counters, or `None` when the source has none
    /// (offline files).
    fn stats(&mut self) -> Option<SourceStats>;
}

/// Open the source selected by the configuration.
pub fn open_source(config: &CaptureConfig) -> Result<Box<dyn PacketSource>, DnsWatchError> {
    if let Some(device) = &config.device {
        if config.use_afpacket {
            #[cfg(target_os = "linux")]
            {
                let source = afpacket::AfpacketSource::open(
                    device,
                    config.afpacket_buffer_mb,
                    config.no_ethernet_frame,
                )?;
                log::info!("waiting for packets using AF_PACKET on {}", device);
                return Ok(Box::new(source));
            }
            #[cfg(not(target_os = "linux"))]
            {
                return Err(DnsWatchError::Config(
                    "AF_PACKET capture is only available on Linux".to_string(),
                ));
            }
        }
        let source = live::LiveSource::open(device, &config.filter, config.no_ethernet_frame)?;
        log::info!("waiting for packets on {}", device);
        Ok(Box::new(source))
    } else if let Some(path) = &config.pcap_file {
        let source = file::FileSource::open(path, config.no_ethernet_frame)?;
        Ok(Box::new(source))
    } else {
        Err(DnsWatchError::Config(
            "either a capture device or a pcap file is required".to_string(),
        ))
    }
}

/// Map a libpcap data link type onto the decoder's framing modes.
pub(crate) fn link_from_datalink(datalink: pcap::Linktype, no_ethernet_frame: bool) -> LinkType {
    if no_ethernet_frame {
        return LinkType::Raw;
    }
    if datalink == pcap::Linktype::ETHERNET {
        LinkType::Ethernet
    } else if datalink == pcap::Linktype::RAW
        || datalink == pcap::Linktype::IPV4
        || datalink == pcap::Linktype::IPV6
    {
        LinkType::Raw
    } else {
        log::warn!(
            "unrecognized data link type {:?}; assuming Ethernet framing",
            datalink
        );
        LinkType::Ethernet
    }
}

pub(crate) fn timeval_micros(ts: &libc::timeval) -> u64 {
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000)
        .saturating_add(ts.tv_usec as u64)
}
