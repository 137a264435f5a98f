use std::path::PathBuf;

use clap::Parser;

use crate::config::{CaptureConfig, SampleRatio};

#[derive(Parser, Debug)]
#[command(
    name = "dnswatch",
    version,
    about = "Passive DNS observer: capture, reassemble, and export DNS transactions"
)]
pub struct Cli {
    /// Live capture device. Mutually exclusive with --pcap-file.
    #[arg(long = "dev-name")]
    pub dev_name: Option<String>,

    /// Offline pcap file to read. Mutually exclusive with --dev-name.
    #[arg(long = "pcap-file")]
    pub pcap_file: Option<PathBuf>,

    /// Use AF_PACKET for live captures (Linux only)
    #[arg(long)]
    pub use_afpacket: bool,

    /// AF_PACKET kernel buffer size in MB
    #[arg(long = "afpacket-buffer-mb", default_value_t = 64)]
    pub afpacket_buffer_mb: u32,

    /// BPF filter applied to the live packet stream. The default matches
    /// by IP protocol rather than port so fragmented UDP is not filtered
    /// out before reassembly.
    #[arg(
        long,
        default_value = "((ip and (ip[9] == 6 or ip[9] == 17)) or (ip6 and (ip6[6] == 17 or ip6[6] == 6 or ip6[6] == 44)))"
    )]
    pub filter: String,

    /// DNS port to select packets by; 0 matches any port
    #[arg(long, default_value_t = 53)]
    pub port: u16,

    /// Garbage collection interval for TCP assembly and IP defragmentation,
    /// in seconds
    #[arg(long = "gc-time", default_value_t = 10.0, value_parser = parse_seconds)]
    pub gc_time: f64,

    /// Capture sampling by a:b; 1:100 processes 1% of incoming packets
    #[arg(long = "sample-ratio", default_value = "1:1", value_parser = parse_ratio)]
    pub sample_ratio: SampleRatio,

    /// Number of worker threads handling received packets
    #[arg(long = "packet-handlers", default_value_t = 2, value_parser = parse_count)]
    pub packet_handler_count: usize,

    /// Number of shards handling TCP assembly
    #[arg(long = "tcp-handlers", default_value_t = 1, value_parser = parse_count)]
    pub tcp_handler_count: usize,

    /// Size of the packet handler channel
    #[arg(long = "packet-channel-size", default_value_t = 100_000, value_parser = parse_count)]
    pub packet_channel_size: usize,

    /// Size of each TCP assembly channel
    #[arg(long = "tcp-assembly-channel-size", default_value_t = 1000, value_parser = parse_count)]
    pub tcp_assembly_channel_size: usize,

    /// Size of the TCP result channel
    #[arg(long = "tcp-result-channel-size", default_value_t = 1000, value_parser = parse_count)]
    pub tcp_result_channel_size: usize,

    /// Size of the defragmenter input channels
    #[arg(long = "defragger-channel-size", default_value_t = 500, value_parser = parse_count)]
    pub defragger_channel_size: usize,

    /// Size of the defragmenter return channels
    #[arg(long = "defragger-channel-return-size", default_value_t = 500, value_parser = parse_count)]
    pub defragger_channel_return_size: usize,

    /// Size of the result channel drained by the sink
    #[arg(long = "result-channel-size", default_value_t = 100_000, value_parser = parse_count)]
    pub result_channel_size: usize,

    /// Frames carry no Ethernet header (raw IP link)
    #[arg(long = "no-ethernet-frame")]
    pub no_ethernet_frame: bool,

    /// Interval for reading interface capture stats, in seconds
    #[arg(long = "capture-stats-delay", default_value_t = 1.0, value_parser = parse_seconds)]
    pub capture_stats_delay: f64,

    /// Interval for printing capture stats, in seconds
    #[arg(long = "print-stats-delay", default_value_t = 10.0, value_parser = parse_seconds)]
    pub print_stats_delay: f64,

    /// Server name tag stamped into every result
    #[arg(long, default_value = "default")]
    pub server: String,
}

impl Cli {
    /// Lower the parsed flags into the pipeline configuration. Combination
    /// checks happen in [`CaptureConfig::validate`].
    pub fn into_config(self) -> CaptureConfig {
        CaptureConfig {
            device: self.dev_name,
            pcap_file: self.pcap_file,
            use_afpacket: self.use_afpacket,
            afpacket_buffer_mb: self.afpacket_buffer_mb,
            filter: self.filter,
            port: self.port,
            gc_interval: std::time::Duration::from_secs_f64(self.gc_time),
            sample_ratio: self.sample_ratio,
            packet_handler_count: self.packet_handler_count,
            tcp_handler_count: self.tcp_handler_count,
            packet_channel_size: self.packet_channel_size,
            tcp_assembly_channel_size: self.tcp_assembly_channel_size,
            tcp_result_channel_size: self.tcp_result_channel_size,
            defragger_channel_size: self.defragger_channel_size,
            defragger_channel_return_size: self.defragger_channel_return_size,
            result_channel_size: self.result_channel_size,
            no_ethernet_frame: self.no_ethernet_frame,
            capture_stats_delay: std::time::Duration::from_secs_f64(self.capture_stats_delay),
            print_stats_delay: std::time::Duration::from_secs_f64(self.print_stats_delay),
            server: self.server,
        }
    }
}

fn parse_seconds(s: &str) -> Result<f64, String> {
    let val: f64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number of seconds"))?;
    if val <= 0.0 {
        Err("interval must be positive".to_string())
    } else {
        Ok(val)
    }
}

fn parse_count(s: &str) -> Result<usize, String> {
    let val: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val == 0 {
        Err("value must be at least 1".to_string())
    } else {
        Ok(val)
    }
}

fn parse_ratio(s: &str) -> Result<SampleRatio, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(args)
    }

    fn parsed(args: &[&str]) -> Cli {
        parse(args).unwrap()
    }

    #[test]
    fn defaults_resolve() {
        let cli = parsed(&["dnswatch", "--dev-name", "eth0"]);
        let config = cli.into_config();
        assert_eq!(config.device.as_deref(), Some("eth0"));
        assert_eq!(config.port, 53);
        assert_eq!(config.sample_ratio, SampleRatio { a: 1, b: 1 });
        assert_eq!(config.gc_interval, std::time::Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn pcap_file_mode() {
        let cli = parsed(&["dnswatch", "--pcap-file", "dump.pcap"]);
        let config = cli.into_config();
        assert!(config.device.is_none());
        assert_eq!(config.pcap_file.as_deref().unwrap().to_str(), Some("dump.pcap"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn both_sources_rejected_by_validate() {
        let cli = parsed(&[
            "dnswatch",
            "--dev-name",
            "eth0",
            "--pcap-file",
            "dump.pcap",
        ]);
        assert!(cli.into_config().validate().is_err());
    }

    #[test]
    fn sample_ratio_parses_and_rejects() {
        let cli = parsed(&["dnswatch", "--dev-name", "eth0", "--sample-ratio", "1:100"]);
        assert_eq!(cli.sample_ratio, SampleRatio { a: 1, b: 100 });

        assert!(parse(&["dnswatch", "--dev-name", "eth0", "--sample-ratio", "3:2"]).is_err());
        assert!(parse(&["dnswatch", "--dev-name", "eth0", "--sample-ratio", "nope"]).is_err());
    }

    #[test]
    fn port_bounds_enforced_by_clap() {
        assert!(parse(&["dnswatch", "--dev-name", "eth0", "--port", "65535"]).is_ok());
        assert!(parse(&["dnswatch", "--dev-name", "eth0", "--port", "65536"]).is_err());
        let cli = parsed(&["dnswatch", "--dev-name", "eth0", "--port", "0"]);
        assert_eq!(cli.port, 0);
    }

    #[test]
    fn zero_worker_counts_rejected() {
        assert!(parse(&["dnswatch", "--dev-name", "eth0", "--packet-handlers", "0"]).is_err());
        assert!(parse(&["dnswatch", "--dev-name", "eth0", "--tcp-handlers", "0"]).is_err());
    }

    #[test]
    fn gc_time_must_be_positive() {
        assert!(parse(&["dnswatch", "--dev-name", "eth0", "--gc-time", "0"]).is_err());
        assert!(parse(&["dnswatch", "--dev-name", "eth0", "--gc-time", "-1"]).is_err());
    }
}
