// Offline capture file source.
//
// Reads frames sequentially in file order. BPF filtering is not supported
// here; the decoder's port predicate does the narrowing instead. End of
// file surfaces as `Exhausted`, which the supervisor turns into an orderly
// pipeline drain.

use std::path::Path;

use pcap::{Capture, Offline};

use crate::capture::{Frame, PacketSource, SourceStats, link_from_datalink, timeval_micros};
use crate::error::DnsWatchError;
use crate::packet::LinkType;

pub struct FileSource {
    cap: Capture<Offline>,
    link: LinkType,
}

impl FileSource {
    pub fn open(path: &Path, no_ethernet_frame: bool) -> Result<Self, DnsWatchError> {
        let cap = Capture::from_file(path)
            .map_err(|e| DnsWatchError::Capture(format!("open {}: {e}", path.display())))?;
        log::info!("reading packets from file: {}", path.display());
        log::warn!("BPF filter is not supported in offline mode");
        let link = link_from_datalink(cap.get_datalink(), no_ethernet_frame);
        Ok(Self { cap, link })
    }
}

impl PacketSource for FileSource {
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
            Err(pcap::Error::NoMorePackets) => Err(DnsWatchError::Exhausted),
            Err(e) => Err(DnsWatchError::Capture(e.to_string())),
        }
    }

    fn stats(&mut self) -> Option<SourceStats> {
        None
    }
}
