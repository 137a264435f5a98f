// JSON-lines result writer.
//
// A minimal sink for the binary: one JSON object per observed DNS
// transaction. The real downstream consumer owns the result channel; this
// writer only exists so the tool is useful standalone.

use std::io::Write;

use crate::error::DnsWatchError;
use crate::model::DnsResult;

/// Write one result as a single JSON line.
pub fn write_result(result: &DnsResult, writer: &mut impl Write) -> Result<(), DnsWatchError> {
    serde_json::to_writer(&mut *writer, result)
        .map_err(|e| DnsWatchError::Serialization(std::io::Error::other(e.to_string())))?;
    writeln!(writer).map_err(DnsWatchError::Serialization)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use crate::dns::parse_dns;
    use crate::model::Transport;

    fn sample_result() -> DnsResult {
        // A tiny query for "x." so the message round-trips through the
        // real parser.
        let payload = [
            0x00, 0x09, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, b'x',
            0x00, 0x00, 0x01, 0x00, 0x01,
        ];
        DnsResult {
            ts_micros: 1_700_000_000_000_000,
            src_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
            src_port: 40000,
            dst_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 53)),
            dst_port: 53,
            transport: Transport::Udp,
            message: parse_dns(&payload).unwrap(),
            server: "edge-1".to_string(),
        }
    }

    #[test]
    fn writes_one_json_line() {
        let mut out = Vec::new();
        write_result(&sample_result(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);

        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["transport"], "udp");
        assert_eq!(value["server"], "edge-1");
        assert_eq!(value["dst_port"], 53);
        assert_eq!(value["message"]["questions"][0]["name"], "x.");
    }
}
