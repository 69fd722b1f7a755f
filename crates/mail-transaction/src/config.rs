use mailbody::DEFAULT_MAX_DEPTH;
use serde::Deserialize;

/// Tunables for a single Transaction
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TransactionConfig {
    /// Decode text parts from their declared charset before handing
    /// them to body filters
    #[serde(default)]
    pub parse_body: bool,

    /// The incoming data is SMTP DATA as seen on the wire: leading
    /// dots are escaped and a line holding a single `.` ends it
    #[serde(default)]
    pub dot_stuffed: bool,

    #[serde(default = "TransactionConfig::default_max_depth")]
    pub max_depth: usize,

    /// The size of the Data events produced for attachment streams
    #[serde(default = "TransactionConfig::default_attachment_chunk_size")]
    pub attachment_chunk_size: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            parse_body: false,
            dot_stuffed: false,
            max_depth: Self::default_max_depth(),
            attachment_chunk_size: Self::default_attachment_chunk_size(),
        }
    }
}

impl TransactionConfig {
    fn default_max_depth() -> usize {
        DEFAULT_MAX_DEPTH
    }

    fn default_attachment_chunk_size() -> usize {
        16 * 1024
    }
}
