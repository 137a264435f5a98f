// Result and statistics records emitted by the capture pipeline.
//
// These are the only types that cross the boundary to the downstream
// consumer; everything else in the pipeline is internal.

use std::net::IpAddr;

use serde::Serialize;

use crate::dns::DnsMessage;

/// Transport the DNS message was observed on.
#[derive(Clone, Copy, Serialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// One observed DNS transaction half (query or response), fully reassembled.
///
/// Produced by the decoder workers and the reassembly drain threads, handed
/// off once on the bounded result channel, and never retained by the
/// pipeline afterwards.
#[derive(Clone, Serialize, Debug)]
pub struct DnsResult {
    /// Capture timestamp in microseconds since epoch.
    pub ts_micros: u64,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub transport: Transport,
    pub message: DnsMessage,
    /// Server name tag configured at startup, used by downstream indexing.
    pub server: String,
}

/// Capture health snapshot, refreshed on the stats ticker and logged on the
/// print ticker.
#[derive(Clone, Copy, Serialize, Debug, Default, PartialEq)]
pub struct CaptureStatsRecord {
    pub packets_got: u64,
    pub packets_lost: u64,
    pub packet_loss_percent: f32,
}

impl CaptureStatsRecord {
    /// Build a record from raw source counters. `packets == 0` yields 0%
    /// loss rather than NaN.
    pub fn from_counters(got: u64, lost: u64) -> Self {
        let percent = if got == 0 {
            0.0
        } else {
            (lost as f32) * 100.0 / (got as f32)
        };
        Self {
            packets_got: got,
            packets_lost: lost,
            packet_loss_percent: percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_percent_zero_packets() {
        let rec = CaptureStatsRecord::from_counters(0, 0);
        assert_eq!(rec.packet_loss_percent, 0.0);
    }

    #[test]
    fn loss_percent_computed() {
        let rec = CaptureStatsRecord::from_counters(200, 50);
        assert_eq!(rec.packets_got, 200);
        assert_eq!(rec.packets_lost, 50);
        assert_eq!(rec.packet_loss_percent, 25.0);
    }
}
