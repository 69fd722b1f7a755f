use crate::headermap::HeaderMap;
use crate::params::MimeParameters;
use crate::{Conformance, LineEnding, Result};
use bstr::ByteSlice;
use bytes::Bytes;

/// A single header field. The raw bytes of the field, including any
/// folded continuation lines and the terminating line break, are kept
/// so that an untouched header is written back exactly as received.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    name: String,
    /// The value portion, as received, without the final line break
    value: Bytes,
    raw: Bytes,
}

/// Holds the result of parsing a block of headers
#[derive(Debug)]
pub struct HeaderParseResult {
    pub headers: HeaderMap,
    /// The blank line that ended the header block. Empty when the
    /// block ran to the end of the data or was ended by a non-header line.
    pub separator: Bytes,
    pub body_offset: usize,
    pub conformance: Conformance,
}

fn is_ftext(b: u8) -> bool {
    matches!(b, 0x21..=0x39 | 0x3b..=0x7e)
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

impl Header {
    /// Construct a new header, serialized with the supplied line ending
    pub fn new(name: &str, value: &str, line_ending: LineEnding) -> Self {
        let mut raw = Vec::with_capacity(name.len() + value.len() + 4);
        raw.extend_from_slice(name.as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(line_ending.as_bytes());
        let raw = Bytes::from(raw);
        let value = raw.slice(name.len() + 2..name.len() + 2 + value.len());
        Self {
            name: name.to_string(),
            value,
            raw,
        }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// The value as it appeared on the wire, folding included
    pub fn get_raw_value(&self) -> &[u8] {
        &self.value
    }

    /// The unfolded value with surrounding whitespace removed.
    /// Bytes that are not valid UTF-8 are replaced.
    pub fn get_value(&self) -> String {
        let unfolded: Vec<u8> = self
            .value
            .iter()
            .copied()
            .filter(|&b| b != b'\r' && b != b'\n')
            .collect();
        unfolded.trim().to_str_lossy().to_string()
    }

    /// The complete header line(s), as written by write_header
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Give a header that ran to the end of the data its line break
    pub(crate) fn terminate(&mut self, line_ending: LineEnding) {
        if self.raw.ends_with(b"\n") {
            return;
        }
        let mut raw = Vec::with_capacity(self.raw.len() + 2);
        raw.extend_from_slice(&self.raw);
        raw.extend_from_slice(line_ending.as_bytes());
        self.raw = Bytes::from(raw);
    }

    pub fn write_header<W: std::io::Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(&self.raw)
    }

    pub fn as_content_type(&self) -> Result<MimeParameters> {
        MimeParameters::parse_content_type(&self.get_value())
    }

    pub fn as_content_transfer_encoding(&self) -> Result<MimeParameters> {
        MimeParameters::parse_token_with_parameters(&self.get_value())
    }

    pub fn as_content_disposition(&self) -> Result<MimeParameters> {
        MimeParameters::parse_token_with_parameters(&self.get_value())
    }

    /// Split a header block from the front of data.
    /// This never fails: a line that cannot be a header ends the
    /// block and becomes the first line of the body.
    pub fn parse_headers(data: &Bytes) -> HeaderParseResult {
        let bytes = data.as_ref();
        let mut headers: Vec<Header> = vec![];
        let mut conformance = Conformance::default();
        let mut idx = 0;
        let mut separator = Bytes::new();
        let mut last_start = 0;
        let mut last_value_start = 0;

        while idx < bytes.len() {
            let line_end = memchr::memchr(b'\n', &bytes[idx..])
                .map(|p| idx + p + 1)
                .unwrap_or(bytes.len());
            let line = &bytes[idx..line_end];

            if line.ends_with(b"\n") && !line.ends_with(b"\r\n") {
                conformance.set(Conformance::NON_CANONICAL_LINE_ENDINGS, true);
            }

            if line == b"\r\n" || line == b"\n" {
                separator = data.slice(idx..line_end);
                idx = line_end;
                break;
            }

            let content = trim_line_ending(line);

            if line[0] == b' ' || line[0] == b'\t' {
                match headers.last_mut() {
                    Some(prior) => {
                        prior.raw = data.slice(last_start..line_end);
                        prior.value = data.slice(last_value_start..idx + content.len());
                        idx = line_end;
                        continue;
                    }
                    None => {
                        conformance.set(Conformance::MISSING_COLON_VALUE, true);
                        break;
                    }
                }
            }

            let name_end = match memchr::memchr(b':', content) {
                Some(colon) => {
                    let name = content[..colon].trim_end();
                    if !name.is_empty() && name.iter().all(|&b| is_ftext(b)) {
                        Some((name.len(), colon))
                    } else {
                        None
                    }
                }
                None => None,
            };

            let Some((name_len, colon)) = name_end else {
                tracing::trace!("header block ended by a line without a colon");
                conformance.set(Conformance::MISSING_COLON_VALUE, true);
                break;
            };

            last_start = idx;
            last_value_start = idx + colon + 1;
            // name is ftext, which is ASCII
            let name = String::from_utf8_lossy(&content[..name_len]).to_string();
            headers.push(Header {
                name,
                value: data.slice(idx + colon + 1..idx + content.len()),
                raw: data.slice(idx..line_end),
            });
            idx = line_end;
        }

        HeaderParseResult {
            headers: HeaderMap::new(headers),
            separator,
            body_offset: idx,
            conformance,
        }
    }
}
