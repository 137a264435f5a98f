// Pipeline configuration, resolved from the CLI front end before any
// worker thread starts. Validation here is the only gate: once a
// `CaptureConfig` passes `validate()`, the pipeline assumes every field
// is usable.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::DnsWatchError;

/// Sampling ratio `a:b` — forward `a` out of every `b` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRatio {
    pub a: u32,
    pub b: u32,
}

impl SampleRatio {
    /// Pass-through ratio (every frame forwarded).
    pub fn one_to_one() -> Self {
        Self { a: 1, b: 1 }
    }
}

impl FromStr for SampleRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = s
            .split_once(':')
            .ok_or_else(|| format!("'{s}' is not an a:b ratio"))?;
        let a: u32 = a
            .trim()
            .parse()
            .map_err(|_| format!("'{s}' is not an a:b ratio"))?;
        let b: u32 = b
            .trim()
            .parse()
            .map_err(|_| format!("'{s}' is not an a:b ratio"))?;
        if b == 0 {
            return Err("sample ratio denominator must be at least 1".to_string());
        }
        if a > b {
            return Err(format!("sample ratio {a}:{b} has a > b"));
        }
        Ok(Self { a, b })
    }
}

impl std::fmt::Display for SampleRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.a, self.b)
    }
}

/// Everything the capture pipeline needs at construction time.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Live capture device name. Mutually exclusive with `pcap_file`.
    pub device: Option<String>,
    /// Offline capture file. Mutually exclusive with `device`.
    pub pcap_file: Option<PathBuf>,
    /// Use the raw AF_PACKET socket variant for live captures (Linux only).
    pub use_afpacket: bool,
    /// Kernel receive buffer for the AF_PACKET variant, in megabytes.
    pub afpacket_buffer_mb: u32,
    /// BPF filter text, applied on live pcap captures only.
    pub filter: String,
    /// DNS port predicate. 0 matches any port.
    pub port: u16,
    /// Expiry interval for defrag contexts and TCP flows.
    pub gc_interval: Duration,
    pub sample_ratio: SampleRatio,
    pub packet_handler_count: usize,
    pub tcp_handler_count: usize,
    pub packet_channel_size: usize,
    pub tcp_assembly_channel_size: usize,
    pub tcp_result_channel_size: usize,
    pub defragger_channel_size: usize,
    pub defragger_channel_return_size: usize,
    pub result_channel_size: usize,
    /// Frames carry no Ethernet header (raw IP link).
    pub no_ethernet_frame: bool,
    pub capture_stats_delay: Duration,
    pub print_stats_delay: Duration,
    /// Server name tag stamped into every result.
    pub server: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            pcap_file: None,
            use_afpacket: false,
            afpacket_buffer_mb: 64,
            // Match by IP protocol rather than port so fragmented UDP still
            // reaches the defraggers; the port predicate is applied after
            // reassembly.
            filter: "((ip and (ip[9] == 6 or ip[9] == 17)) or \
                     (ip6 and (ip6[6] == 17 or ip6[6] == 6 or ip6[6] == 44)))"
                .to_string(),
            port: 53,
            gc_interval: Duration::from_secs(10),
            sample_ratio: SampleRatio::one_to_one(),
            packet_handler_count: 2,
            tcp_handler_count: 1,
            packet_channel_size: 100_000,
            tcp_assembly_channel_size: 1000,
            tcp_result_channel_size: 1000,
            defragger_channel_size: 500,
            defragger_channel_return_size: 500,
            result_channel_size: 100_000,
            no_ethernet_frame: false,
            capture_stats_delay: Duration::from_secs(1),
            print_stats_delay: Duration::from_secs(10),
            server: "default".to_string(),
        }
    }
}

impl CaptureConfig {
    /// Reject invalid combinations before any worker starts.
    pub fn validate(&self) -> Result<(), DnsWatchError> {
        match (&self.device, &self.pcap_file) {
            (None, None) => {
                return Err(DnsWatchError::Config(
                    "either a capture device or a pcap file is required".to_string(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(DnsWatchError::Config(
                    "capture device and pcap file are mutually exclusive".to_string(),
                ));
            }
            _ => {}
        }
        if self.use_afpacket && self.device.is_none() {
            return Err(DnsWatchError::Config(
                "AF_PACKET capture requires a device".to_string(),
            ));
        }
        if self.use_afpacket && !cfg!(target_os = "linux") {
            return Err(DnsWatchError::Config(
                "AF_PACKET capture is only available on Linux".to_string(),
            ));
        }
        if self.sample_ratio.b == 0 || self.sample_ratio.a > self.sample_ratio.b {
            return Err(DnsWatchError::Config(format!(
                "invalid sample ratio {}",
                self.sample_ratio
            )));
        }
        if self.packet_handler_count == 0 {
            return Err(DnsWatchError::Config(
                "packet handler count must be at least 1".to_string(),
            ));
        }
        if self.tcp_handler_count == 0 {
            return Err(DnsWatchError::Config(
                "tcp handler count must be at least 1".to_string(),
            ));
        }
        if self.gc_interval.is_zero() {
            return Err(DnsWatchError::Config(
                "gc interval must be non-zero".to_string(),
            ));
        }
        for (name, size) in [
            ("packet channel", self.packet_channel_size),
            ("tcp assembly channel", self.tcp_assembly_channel_size),
            ("tcp result channel", self.tcp_result_channel_size),
            ("defragger channel", self.defragger_channel_size),
            ("defragger return channel", self.defragger_channel_return_size),
            ("result channel", self.result_channel_size),
        ] {
            if size == 0 {
                return Err(DnsWatchError::Config(format!(
                    "{name} size must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline() -> CaptureConfig {
        CaptureConfig {
            pcap_file: Some(PathBuf::from("dump.pcap")),
            ..CaptureConfig::default()
        }
    }

    #[test]
    fn ratio_parses() {
        assert_eq!("1:1".parse::<SampleRatio>().unwrap(), SampleRatio { a: 1, b: 1 });
        assert_eq!(
            "1:100".parse::<SampleRatio>().unwrap(),
            SampleRatio { a: 1, b: 100 }
        );
        assert_eq!("0:5".parse::<SampleRatio>().unwrap(), SampleRatio { a: 0, b: 5 });
    }

    #[test]
    fn ratio_rejects_bad_syntax() {
        assert!("".parse::<SampleRatio>().is_err());
        assert!("1".parse::<SampleRatio>().is_err());
        assert!("a:b".parse::<SampleRatio>().is_err());
        assert!("1:0".parse::<SampleRatio>().is_err());
        assert!("3:2".parse::<SampleRatio>().is_err());
    }

    #[test]
    fn validate_requires_exactly_one_source() {
        let neither = CaptureConfig::default();
        assert!(neither.validate().is_err());

        let both = CaptureConfig {
            device: Some("eth0".to_string()),
            pcap_file: Some(PathBuf::from("dump.pcap")),
            ..CaptureConfig::default()
        };
        assert!(both.validate().is_err());

        assert!(offline().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let cfg = CaptureConfig {
            packet_handler_count: 0,
            ..offline()
        };
        assert!(cfg.validate().is_err());

        let cfg = CaptureConfig {
            tcp_handler_count: 0,
            ..offline()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_channels() {
        let cfg = CaptureConfig {
            result_channel_size: 0,
            ..offline()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_afpacket_without_device() {
        let cfg = CaptureConfig {
            use_afpacket: true,
            ..offline()
        };
        assert!(cfg.validate().is_err());
    }
}
