/// The line ending convention used by a part. New content written into
/// a part follows the convention its original bytes used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    #[default]
    CrLf,
    Lf,
}

impl LineEnding {
    /// Infer the convention from the first line break in data.
    /// Data without any line break is assumed to be canonical CRLF.
    pub fn detect(data: &[u8]) -> Self {
        match memchr::memchr(b'\n', data) {
            Some(0) => Self::Lf,
            Some(idx) if data[idx - 1] != b'\r' => Self::Lf,
            _ => Self::CrLf,
        }
    }

    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::CrLf => b"\r\n",
            Self::Lf => b"\n",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CrLf => "\r\n",
            Self::Lf => "\n",
        }
    }

    /// Rewrite every line break in data to this convention
    pub fn apply(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::CrLf => normalize_crlf(data),
            Self::Lf => normalize_lf(data),
        }
    }
}

pub fn has_lone_cr_or_lf(data: &[u8]) -> bool {
    for i in memchr::memchr2_iter(b'\r', b'\n', data) {
        match data[i] {
            b'\r' => {
                if data.get(i + 1).copied() != Some(b'\n') {
                    return true;
                }
            }
            b'\n' => {
                if i == 0 || data[i - 1] != b'\r' {
                    return true;
                }
            }
            _ => unreachable!(),
        }
    }
    false
}

pub fn normalize_crlf(data: &[u8]) -> Vec<u8> {
    let mut normalized = Vec::with_capacity(data.len());
    let mut last_idx = 0;

    for i in memchr::memchr2_iter(b'\r', b'\n', data) {
        match data[i] {
            b'\r' => {
                normalized.extend_from_slice(&data[last_idx..=i]);
                if data.get(i + 1).copied() != Some(b'\n') {
                    normalized.push(b'\n');
                }
            }
            b'\n' => {
                normalized.extend_from_slice(&data[last_idx..i]);
                if i == 0 || data[i - 1] != b'\r' {
                    normalized.push(b'\r');
                }
                normalized.push(b'\n');
            }
            _ => unreachable!(),
        }
        last_idx = i + 1;
    }

    normalized.extend_from_slice(&data[last_idx..]);
    normalized
}

/// Collapse CRLF and lone CR into LF
pub(crate) fn normalize_lf(data: &[u8]) -> Vec<u8> {
    let mut normalized = Vec::with_capacity(data.len());
    let mut last_idx = 0;

    for i in memchr::memchr_iter(b'\r', data) {
        normalized.extend_from_slice(&data[last_idx..i]);
        if data.get(i + 1).copied() != Some(b'\n') {
            normalized.push(b'\n');
        }
        last_idx = i + 1;
    }

    normalized.extend_from_slice(&data[last_idx..]);
    normalized
}
