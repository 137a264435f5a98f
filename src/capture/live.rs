// Live capture via libpcap.
//
// Binds a named interface in promiscuous mode with a short read timeout so
// the source loop stays responsive to shutdown, and installs the textual
// BPF filter through libpcap's compiler.

use pcap::{Active, Capture};

use crate::capture::{Frame, PacketSource, SourceStats, link_from_datalink, timeval_micros};
use crate::error::DnsWatchError;
use crate::packet::LinkType;

/// Poll timeout for capture reads. Bounds how long a shutdown can go
/// unnoticed by the source loop.
const READ_TIMEOUT_MS: i32 = 500;

pub struct LiveSource {
    cap: Capture<Active>,
    link: LinkType,
}

impl LiveSource {
    pub fn open(device: &str, filter: &str, no_ethernet_frame: bool) -> Result<Self, DnsWatchError> {
        let cap = Capture::from_device(device)
            .map_err(|e| DnsWatchError::Capture(format!("open {device}: {e}")))?
            .promisc(true)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .map_err(|e| DnsWatchError::Capture(format!("activate {device}: {e}")))?;

        log::info!("using device: {}", device);
        log::info!("filter: {}", filter);

        let mut cap = cap;
        cap.filter(filter, true)
            .map_err(|e| DnsWatchError::Filter(e.to_string()))?;

        let link = link_from_datalink(cap.get_datalink(), no_ethernet_frame);
        Ok(Self { cap, link })
    }
}

impl PacketSource for LiveSource {
    fn link_type(&self) -> LinkType {
        self.link
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, DnsWatchError> {
        match self.cap.next_packet() {
            Ok(packet) => Ok(Some(Frame {
                ts_micros: timeval_micros(&packet.header.ts),
                link: self.link,
                data: packet.data.to_vec(),
            })),
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(pcap::Error::NoMorePackets) => Err(DnsWatchError::Exhausted),
            Err(e) => Err(DnsWatchError::Capture(e.to_string())),
        }
    }

    fn stats(&mut self) -> Option<SourceStats> {
        self.cap.stats().ok().map(|s| SourceStats {
            received: u64::from(s.received),
            dropped: u64::from(s.dropped) + u64::from(s.if_dropped),
        })
    }
}
