use crate::{normalize_crlf, LineEnding, MailBodyError, Result};
use bytes::Bytes;
use encoding_rs::Encoding;
use std::str::FromStr;

/// Define our own because data_encoding::BASE64_MIME, despite its name,
/// is not RFC2045 compliant, and will not ignore spaces.
/// Padding is required, so a body that stops part way through
/// a quantum is reported rather than silently truncated.
pub(crate) const BASE64_RFC2045: data_encoding::Encoding = data_encoding_macro::new_encoding! {
    symbols: "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/",
    padding: '=',
    ignore: " \r\n\t",
    wrap_width: 76,
    wrap_separator: "\r\n",
};

/// As BASE64_RFC2045, for parts that use bare LF line endings
const BASE64_RFC2045_LF: data_encoding::Encoding = data_encoding_macro::new_encoding! {
    symbols: "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/",
    padding: '=',
    ignore: " \r\n\t",
    wrap_width: 76,
    wrap_separator: "\n",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentTransferEncoding {
    SevenBit,
    EightBit,
    Binary,
    QuotedPrintable,
    Base64,
    /// A Content-Transfer-Encoding we do not understand.
    /// The body is carried through untouched.
    Unknown,
}

impl FromStr for ContentTransferEncoding {
    type Err = MailBodyError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("7bit") {
            Ok(Self::SevenBit)
        } else if s.eq_ignore_ascii_case("8bit") {
            Ok(Self::EightBit)
        } else if s.eq_ignore_ascii_case("binary") {
            Ok(Self::Binary)
        } else if s.eq_ignore_ascii_case("quoted-printable") {
            Ok(Self::QuotedPrintable)
        } else if s.eq_ignore_ascii_case("base64") {
            Ok(Self::Base64)
        } else {
            Err(MailBodyError::InvalidContentTransferEncoding(s.to_string()))
        }
    }
}

impl ContentTransferEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SevenBit => "7bit",
            Self::EightBit => "8bit",
            Self::Binary => "binary",
            Self::QuotedPrintable => "quoted-printable",
            Self::Base64 => "base64",
            Self::Unknown => "unknown",
        }
    }

    /// Remove the transfer encoding from raw.
    /// The identity encodings return raw itself without copying.
    pub fn decode(&self, raw: &Bytes) -> Result<Bytes> {
        match self {
            Self::Base64 => {
                let bytes = raw.as_ref();
                BASE64_RFC2045
                    .decode(bytes)
                    .map(Bytes::from)
                    .map_err(|err| {
                        let position = err.position.min(bytes.len());
                        let region = &bytes
                            [position.saturating_sub(8)..(position + 8).min(bytes.len())];
                        let region = String::from_utf8_lossy(region);
                        MailBodyError::BodyParse(format!("base64 decode: {err:#} in {region}"))
                    })
            }
            Self::QuotedPrintable => {
                quoted_printable::decode(raw.as_ref(), quoted_printable::ParseMode::Robust)
                    .map(Bytes::from)
                    .map_err(|err| {
                        MailBodyError::BodyParse(format!("quoted printable decode: {err:#}"))
                    })
            }
            Self::SevenBit | Self::EightBit | Self::Binary | Self::Unknown => Ok(raw.clone()),
        }
    }

    /// Apply the transfer encoding to data, producing wire bytes whose
    /// line breaks follow line_ending. Encoded output always finishes
    /// with a line break so that a following boundary starts a line.
    pub fn encode(&self, data: &[u8], line_ending: LineEnding) -> Vec<u8> {
        match self {
            Self::Base64 => {
                if data.is_empty() {
                    return vec![];
                }
                let mut encoded = match line_ending {
                    LineEnding::CrLf => BASE64_RFC2045.encode(data),
                    LineEnding::Lf => BASE64_RFC2045_LF.encode(data),
                }
                .into_bytes();
                if !encoded.ends_with(b"\n") {
                    encoded.extend_from_slice(line_ending.as_bytes());
                }
                encoded
            }
            Self::QuotedPrintable => {
                let mut encoded = quoted_printable::encode(normalize_crlf(data));
                if line_ending == LineEnding::Lf {
                    encoded = line_ending.apply(&encoded);
                }
                if !encoded.is_empty() && !encoded.ends_with(b"\n") {
                    encoded.extend_from_slice(line_ending.as_bytes());
                }
                encoded
            }
            Self::SevenBit | Self::EightBit | Self::Binary | Self::Unknown => data.to_vec(),
        }
    }
}

/// Whether data can be carried as 7bit without a transfer encoding
pub fn is_seven_bit_clean(data: &[u8]) -> bool {
    data.iter().all(|&b| b != 0 && b.is_ascii())
}

fn is_us_ascii_label(label: &str) -> bool {
    ["us-ascii", "ascii", "us_ascii", "ansi_x3.4-1968", "iso646-us"]
        .iter()
        .any(|l| label.eq_ignore_ascii_case(l))
}

/// Decode text in the named charset into UTF-8.
/// Unknown labels are treated as UTF-8. Malformed sequences become
/// U+FFFD; the boolean reports whether any were seen.
pub fn decode_charset(label: &str, bytes: &[u8]) -> (String, bool) {
    let encoding = Encoding::for_label(label.trim().as_bytes()).unwrap_or_else(|| {
        tracing::debug!("unknown charset {label:?}, decoding as utf-8");
        encoding_rs::UTF_8
    });
    let (text, malformed) = encoding.decode_without_bom_handling(bytes);
    if malformed {
        tracing::debug!("malformed {} sequences replaced", encoding.name());
    }
    (text.into_owned(), malformed)
}

/// Whether label names a charset that can be decoded
pub fn is_known_charset(label: &str) -> bool {
    Encoding::for_label(label.trim().as_bytes()).is_some()
}

/// Locating an insertion decodes each candidate tail of the original;
/// past this many bytes of trailing text the edit is not attempted
const MAX_SPLICE_TAIL: usize = 64 * 1024;

/// Carry an edit made to the lossy decoded view of bytes back onto the
/// original bytes, so that sequences the charset could not decode are
/// kept as they were. Only insertions can be carried: every character
/// of decoded must survive, in order, around a single inserted run.
/// The inserted text is encoded in the named charset when it can be,
/// else as UTF-8. Returns None when existing text was changed or the
/// insertion point cannot be located in the original bytes.
pub fn splice_undecodable(
    label: &str,
    bytes: &[u8],
    decoded: &str,
    replacement: &str,
) -> Option<Vec<u8>> {
    let prefix = decoded
        .char_indices()
        .zip(replacement.chars())
        .find(|((_, a), b)| a != b)
        .map(|((idx, _), _)| idx)
        .unwrap_or(decoded.len().min(replacement.len()));
    let suffix: usize = decoded[prefix..]
        .chars()
        .rev()
        .zip(replacement[prefix..].chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();
    if prefix + suffix != decoded.len() {
        return None;
    }

    let (head, tail) = decoded.split_at(prefix);
    if tail.len() > MAX_SPLICE_TAIL {
        return None;
    }
    let inserted = &replacement[prefix..replacement.len() - suffix];

    let encoding = Encoding::for_label(label.trim().as_bytes()).unwrap_or(encoding_rs::UTF_8);
    let (split, _) = (0..=bytes.len())
        .rev()
        .map(|idx| (idx, encoding.decode_without_bom_handling(&bytes[idx..]).0))
        // stray continuation bytes can decode longer than the text they belong to
        .take_while(|(_, text)| text.len() <= tail.len() + 16)
        .find(|(idx, text)| {
            text == tail && encoding.decode_without_bom_handling(&bytes[..*idx]).0 == head
        })?;

    let inserted =
        encode_charset(label, inserted).unwrap_or_else(|| inserted.as_bytes().to_vec());
    let mut result = Vec::with_capacity(bytes.len() + inserted.len());
    result.extend_from_slice(&bytes[..split]);
    result.extend_from_slice(&inserted);
    result.extend_from_slice(&bytes[split..]);
    Some(result)
}

/// Encode text back into the named charset.
/// Returns None when the charset is unknown, cannot be used for
/// output, or cannot represent every character of text.
pub fn encode_charset(label: &str, text: &str) -> Option<Vec<u8>> {
    let label = label.trim();
    let encoding = Encoding::for_label(label.as_bytes())?;
    if encoding.output_encoding() != encoding {
        return None;
    }
    if is_us_ascii_label(label) && !text.is_ascii() {
        return None;
    }
    let (bytes, _, unmappable) = encoding.encode(text);
    if unmappable {
        return None;
    }
    Some(bytes.into_owned())
}
