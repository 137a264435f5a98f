#[derive(Debug, thiserror::Error)]
pub enum DnsWatchError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("capture device error: {0}")]
    Capture(String),
    #[error("capture filter error: {0}")]
    Filter(String),
    #[error("DNS parse error at offset {offset}: {detail}")]
    DnsParse { offset: usize, detail: String },
    #[error("serialization error: {0}")]
    Serialization(#[source] std::io::Error),
    #[error("packet source exhausted")]
    Exhausted,
    #[error("fatal: {0}")]
    Fatal(String),
}
