use crate::encoding::{decode_charset, encode_charset, is_seven_bit_clean};
use crate::{
    decode_encoded_words, has_lone_cr_or_lf, Conformance, ContentTransferEncoding, Header,
    HeaderMap, HeaderParseResult, LineEnding, MailBodyError, MimeParameters, Result,
};
use bytes::Bytes;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::str::FromStr;

/// How many levels of nested multipart containers are split into
/// child parts before the remainder is kept as opaque bytes
pub const DEFAULT_MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct MimePart {
    /// The parsed headers from the start of the part
    headers: HeaderMap,
    /// The blank line that separates headers from the body.
    /// Empty if the part had none.
    separator: Bytes,
    line_ending: LineEnding,
    conformance: Conformance,
    content: PartContent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PartContent {
    Leaf {
        /// The transfer-encoded body, exactly as received unless
        /// it has since been replaced
        raw_body: Bytes,
        replaced: bool,
    },
    Multipart(Multipart),
}

/// The pieces of a multipart container. Together with the child parts,
/// these hold every byte of the container's body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Multipart {
    boundary: Option<String>,
    /// The content that precedes the first delimiter. When the body
    /// could not be split, this holds the whole body.
    intro: Bytes,
    parts: Vec<MimePart>,
    /// The delimiter line that introduces each part, including its
    /// transport padding and line break
    delimiters: Vec<Bytes>,
    /// The closing delimiter line; empty when the body lacked one
    closing: Bytes,
    /// The content that follows the closing delimiter
    outro: Bytes,
}

impl Multipart {
    pub fn boundary(&self) -> Option<&str> {
        self.boundary.as_deref()
    }

    pub fn preamble(&self) -> &Bytes {
        &self.intro
    }

    pub fn epilogue(&self) -> &Bytes {
        &self.outro
    }

    pub fn closing_delimiter(&self) -> &Bytes {
        &self.closing
    }

    pub(crate) fn delimiters(&self) -> &[Bytes] {
        &self.delimiters
    }
}

/// The MIME related facts about a part, gathered from its headers.
/// Construction never fails; headers that cannot be understood are
/// replaced by their RFC 2045 defaults and noted in `conformance`.
#[derive(Debug, Clone, PartialEq)]
pub struct PartInfo {
    pub encoding: ContentTransferEncoding,
    pub content_type: Option<MimeParameters>,
    /// The lowercased media type; `text/plain` when none was declared
    pub mime_type: String,
    /// The declared charset, if any
    pub charset: Option<String>,
    pub boundary: Option<String>,
    pub is_text: bool,
    pub is_multipart: bool,
    /// The disposition token, lowercased, eg: `inline` or `attachment`
    pub disposition: Option<String>,
    pub file_name: Option<String>,
    pub conformance: Conformance,
}

impl PartInfo {
    pub fn new(headers: &HeaderMap) -> Self {
        let mut conformance = Conformance::default();

        let encoding = match headers.get_first("Content-Transfer-Encoding") {
            None => ContentTransferEncoding::SevenBit,
            Some(header) => {
                let token = match header.as_content_transfer_encoding() {
                    Ok(params) => params.value,
                    Err(_) => {
                        conformance.set(Conformance::INVALID_MIME_HEADERS, true);
                        MimeParameters::parse_lenient(&header.get_value()).value
                    }
                };
                ContentTransferEncoding::from_str(&token).unwrap_or_else(|err| {
                    tracing::debug!("{err:#}, passing body through");
                    conformance.set(Conformance::UNKNOWN_TRANSFER_ENCODING, true);
                    ContentTransferEncoding::Unknown
                })
            }
        };

        let content_type = headers.get_first("Content-Type").map(|header| {
            header.as_content_type().unwrap_or_else(|_| {
                conformance.set(Conformance::INVALID_MIME_HEADERS, true);
                MimeParameters::parse_lenient(&header.get_value())
            })
        });

        let mime_type = content_type
            .as_ref()
            .map(|ct| ct.value.as_str())
            .filter(|value| value.contains('/'))
            .unwrap_or("text/plain")
            .to_string();
        let is_text = mime_type.starts_with("text/");
        let is_multipart = mime_type.starts_with("multipart/");

        let charset = content_type.as_ref().and_then(|ct| ct.get("charset"));
        let boundary = content_type
            .as_ref()
            .and_then(|ct| ct.get("boundary"))
            .filter(|b| !b.is_empty());

        let disposition = match headers.get_first("Content-Disposition") {
            None => None,
            Some(header) => Some(header.as_content_disposition().unwrap_or_else(|_| {
                conformance.set(Conformance::INVALID_MIME_HEADERS, true);
                MimeParameters::parse_lenient(&header.get_value())
            })),
        };

        let cd_file_name = disposition.as_ref().and_then(|cd| cd.get("filename"));
        let ct_name = content_type.as_ref().and_then(|ct| ct.get("name"));
        let file_name = match (cd_file_name, ct_name) {
            (Some(name), _) | (None, Some(name)) => Some(decode_encoded_words(&name)),
            (None, None) => None,
        };

        Self {
            encoding,
            content_type,
            mime_type,
            charset,
            boundary,
            is_text,
            is_multipart,
            disposition: disposition.map(|cd| cd.value),
            file_name,
            conformance,
        }
    }

    /// The charset to use when interpreting text, per RFC 2045
    pub fn charset_label(&self) -> &str {
        self.charset.as_deref().unwrap_or("us-ascii")
    }

    pub fn is_inline(&self) -> bool {
        self.disposition.as_deref().map_or(true, |d| d == "inline")
    }

    /// A leaf is treated as an attachment when it is explicitly
    /// disposed as one, when it carries a file name, or when it is
    /// not text at all
    pub fn is_attachment(&self) -> bool {
        !self.is_multipart
            && (self.disposition.as_deref() == Some("attachment")
                || self.file_name.is_some()
                || !self.is_text)
    }
}

#[derive(Debug, PartialEq)]
pub enum DecodedBody {
    Text(String),
    Binary(Bytes),
}

impl DecodedBody {
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        match self {
            Self::Text(s) => Cow::Borrowed(s),
            Self::Binary(b) => String::from_utf8_lossy(b),
        }
    }
}

struct Delimiter {
    start: usize,
    end: usize,
    is_close: bool,
}

/// Locate the delimiter lines for boundary within body.
/// A delimiter must begin a line and may be followed only by
/// whitespace before its line break. Scanning stops at the
/// closing delimiter.
fn find_delimiters(body: &[u8], boundary: &str) -> Vec<Delimiter> {
    let marker = format!("--{boundary}");
    let mut result = vec![];

    for start in memchr::memmem::find_iter(body, marker.as_bytes()) {
        if start > 0 && body[start - 1] != b'\n' {
            continue;
        }
        let end = memchr::memchr(b'\n', &body[start..])
            .map(|p| start + p + 1)
            .unwrap_or(body.len());
        let rest = &body[start + marker.len()..end];
        let (is_close, padding) = match rest.strip_prefix(b"--") {
            Some(padding) => (true, padding),
            None => (false, rest),
        };
        if !padding
            .iter()
            .all(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        {
            continue;
        }

        result.push(Delimiter {
            start,
            end,
            is_close,
        });
        if is_close {
            break;
        }
    }

    result
}

impl MimePart {
    /// Parse some data into a tree of MimeParts.
    /// This does not fail: malformed structure is recovered from and
    /// recorded in the conformance flags.
    pub fn parse<B: Into<Bytes>>(bytes: B) -> Self {
        Self::parse_with_max_depth(bytes, DEFAULT_MAX_DEPTH)
    }

    /// Parse, splitting at most max_depth levels of nested multipart
    /// containers. Deeper containers keep their body as an opaque preamble.
    pub fn parse_with_max_depth<B: Into<Bytes>>(bytes: B, max_depth: usize) -> Self {
        let mut root = Self::parse_node(bytes.into());

        let mut queue = VecDeque::new();
        queue.push_back((PartPointer::root(), 0usize));
        let mut containers = vec![];

        while let Some((ptr, depth)) = queue.pop_front() {
            let Some(part) = root.resolve_ptr_mut(&ptr) else {
                continue;
            };
            if !part.is_multipart() {
                continue;
            }
            if depth >= max_depth {
                tracing::debug!(
                    "multipart at {} exceeds nesting limit {max_depth}, not splitting",
                    ptr.id_string()
                );
                part.conformance.set(Conformance::NESTING_TOO_DEEP, true);
                continue;
            }

            let num_children = part.split_children();
            for i in 0..num_children {
                queue.push_back((ptr.clone().append(PartPointer::nth(i)), depth + 1));
            }
            containers.push(ptr);
        }

        // Deepest containers were split last, so walking backwards
        // folds each child's flags in before its parent is visited
        for ptr in containers.iter().rev() {
            if let Some(part) = root.resolve_ptr_mut(ptr) {
                let merged = part
                    .children()
                    .iter()
                    .fold(Conformance::default(), |acc, child| acc | child.conformance);
                part.conformance |= merged;
            }
        }

        root
    }

    fn parse_node(bytes: Bytes) -> Self {
        let HeaderParseResult {
            headers,
            separator,
            body_offset,
            mut conformance,
        } = Header::parse_headers(&bytes);

        let line_ending = LineEnding::detect(&bytes);
        let body = bytes.slice(body_offset..);
        let info = PartInfo::new(&headers);
        conformance |= info.conformance;

        let content = if info.is_multipart {
            PartContent::Multipart(Multipart {
                boundary: info.boundary,
                intro: body,
                ..Default::default()
            })
        } else {
            if has_lone_cr_or_lf(&body) {
                conformance.set(Conformance::NON_CANONICAL_LINE_ENDINGS, true);
            }
            PartContent::Leaf {
                raw_body: body,
                replaced: false,
            }
        };

        Self {
            headers,
            separator,
            line_ending,
            conformance,
            content,
        }
    }

    /// Split an unsplit multipart body into its child parts,
    /// returning the number of children produced
    fn split_children(&mut self) -> usize {
        let PartContent::Multipart(mp) = &mut self.content else {
            return 0;
        };
        let Some(boundary) = mp.boundary.clone() else {
            tracing::debug!("multipart has no boundary parameter");
            self.conformance.set(Conformance::MISSING_BOUNDARY, true);
            return 0;
        };

        let body = mp.intro.clone();
        let delimiters = find_delimiters(&body, &boundary);
        let Some(first) = delimiters.first() else {
            tracing::debug!("boundary {boundary:?} does not appear in the body");
            self.conformance.set(Conformance::MISSING_BOUNDARY, true);
            return 0;
        };

        mp.intro = body.slice(..first.start);
        let mut segment_start = None;
        let mut segments = vec![];
        let mut closed = false;

        for delim in &delimiters {
            if let Some(start) = segment_start.take() {
                segments.push(body.slice(start..delim.start));
            }
            if delim.is_close {
                mp.closing = body.slice(delim.start..delim.end);
                mp.outro = body.slice(delim.end..);
                closed = true;
                break;
            }
            mp.delimiters.push(body.slice(delim.start..delim.end));
            segment_start = Some(delim.end);
        }

        if !closed {
            tracing::debug!("multipart with boundary {boundary:?} has no closing delimiter");
            self.conformance.set(Conformance::MISSING_TERMINATOR, true);
            if let Some(start) = segment_start {
                segments.push(body.slice(start..));
            }
        }

        if [&mp.intro, &mp.closing, &mp.outro]
            .into_iter()
            .chain(mp.delimiters.iter())
            .any(|piece| has_lone_cr_or_lf(piece))
        {
            self.conformance
                .set(Conformance::NON_CANONICAL_LINE_ENDINGS, true);
        }

        mp.parts = segments.into_iter().map(Self::parse_node).collect();
        mp.parts.len()
    }

    pub fn conformance(&self) -> Conformance {
        self.conformance
    }

    /// The line ending convention used by this part
    pub fn line_ending(&self) -> LineEnding {
        self.line_ending
    }

    /// Obtains a reference to the headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Obtain a mutable reference to the headers
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn separator(&self) -> &Bytes {
        &self.separator
    }

    pub fn content(&self) -> &PartContent {
        &self.content
    }

    pub fn info(&self) -> PartInfo {
        PartInfo::new(&self.headers)
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self.content, PartContent::Multipart(_))
    }

    pub fn multipart(&self) -> Option<&Multipart> {
        match &self.content {
            PartContent::Multipart(mp) => Some(mp),
            PartContent::Leaf { .. } => None,
        }
    }

    /// Obtain a reference to the child parts.
    /// Leaves, and containers that could not be split, have none.
    pub fn children(&self) -> &[Self] {
        match &self.content {
            PartContent::Multipart(mp) => &mp.parts,
            PartContent::Leaf { .. } => &[],
        }
    }

    pub fn children_mut(&mut self) -> &mut [Self] {
        match &mut self.content {
            PartContent::Multipart(mp) => &mut mp.parts,
            PartContent::Leaf { .. } => &mut [],
        }
    }

    /// Get the raw, transfer-encoded body of a leaf
    pub fn raw_body(&self) -> Option<&Bytes> {
        match &self.content {
            PartContent::Leaf { raw_body, .. } => Some(raw_body),
            PartContent::Multipart(_) => None,
        }
    }

    /// Whether the body of this leaf has been replaced since parsing
    pub fn is_replaced(&self) -> bool {
        matches!(self.content, PartContent::Leaf { replaced: true, .. })
    }

    /// Remove the transfer encoding and return the body bytes
    pub fn decode_body(&self) -> Result<Bytes> {
        let raw = self.raw_body().ok_or_else(|| {
            MailBodyError::BodyParse("multipart parts have no body of their own".to_string())
        })?;
        self.info().encoding.decode(raw)
    }

    /// Decode transfer encoding and, for text, the charset
    pub fn body(&self) -> Result<DecodedBody> {
        let info = self.info();
        let bytes = self.decode_body()?;
        if info.is_text {
            let (text, _malformed) = decode_charset(info.charset_label(), &bytes);
            Ok(DecodedBody::Text(text))
        } else {
            Ok(DecodedBody::Binary(bytes))
        }
    }

    /// The decoded text of a text leaf
    pub fn body_text(&self) -> Option<String> {
        match self.body() {
            Ok(DecodedBody::Text(text)) => Some(text),
            Ok(DecodedBody::Binary(_)) => None,
            Err(err) => {
                tracing::debug!("body_text: {err:#}");
                None
            }
        }
    }

    /// Replace the body of a text leaf.
    /// The text is encoded back into the declared charset when it can
    /// represent every character; otherwise the part is switched to
    /// UTF-8 and its Content-Type rewritten to say so.
    pub fn replace_text_body(&mut self, text: &str) -> Result<()> {
        let info = self.info();
        let declared = info.charset_label();
        let bytes = match encode_charset(declared, text) {
            Some(bytes) => bytes,
            None => {
                tracing::debug!("replacement text cannot be encoded as {declared}, using utf-8");
                let mut ct = info
                    .content_type
                    .clone()
                    .filter(|ct| ct.value.contains('/'))
                    .unwrap_or_else(|| MimeParameters::new(&info.mime_type));
                ct.set("charset", "utf-8");
                self.set_header("Content-Type", &ct.encode_value());
                text.as_bytes().to_vec()
            }
        };
        self.replace_body_bytes(&bytes)
    }

    /// Replace the body of a leaf with already charset encoded bytes.
    /// The part keeps its transfer encoding, except that a 7bit part
    /// whose new content is not 7bit clean is upgraded to
    /// quoted-printable.
    pub fn replace_body_bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.is_multipart() {
            return Err(MailBodyError::BodyParse(
                "cannot replace the body of a multipart part".to_string(),
            ));
        }

        let mut encoding = self.info().encoding;
        if encoding == ContentTransferEncoding::SevenBit && !is_seven_bit_clean(data) {
            encoding = ContentTransferEncoding::QuotedPrintable;
            self.set_header("Content-Transfer-Encoding", encoding.as_str());
        }

        self.terminate_header_block();
        let line_ending = self.line_ending;
        if let PartContent::Leaf { raw_body, replaced } = &mut self.content {
            let mut encoded = encoding.encode(data, line_ending);
            let identity = !matches!(
                encoding,
                ContentTransferEncoding::Base64 | ContentTransferEncoding::QuotedPrintable
            );
            if identity && raw_body.ends_with(b"\n") && !encoded.ends_with(b"\n") {
                encoded.extend_from_slice(line_ending.as_bytes());
            }
            *raw_body = Bytes::from(encoded);
            *replaced = true;
        }
        Ok(())
    }

    /// Set a header, keeping the position of an existing one
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.terminate_header_block();
        self.headers.set_header(name, value, self.line_ending);
        self.terminate_header_block();
    }

    /// A header block that ran to the end of the data, or was ended
    /// by a non-header line, needs its final line break and a blank
    /// line before new content can follow it
    fn terminate_header_block(&mut self) {
        let line_ending = self.line_ending;
        let Some(last) = self.headers.last_mut() else {
            return;
        };
        last.terminate(line_ending);
        if self.separator.is_empty() {
            self.separator = Bytes::from_static(line_ending.as_bytes());
        }
    }

    /// Resolve a PartPointer to the corresponding MimePart
    pub fn resolve_ptr(&self, ptr: &PartPointer) -> Option<&Self> {
        let mut current = self;
        for &idx in &ptr.0 {
            current = current.children().get(idx)?;
        }
        Some(current)
    }

    /// Resolve a PartPointer to the corresponding MimePart, for mutable access
    pub fn resolve_ptr_mut(&mut self, ptr: &PartPointer) -> Option<&mut Self> {
        let mut current = self;
        for &idx in &ptr.0 {
            current = current.children_mut().get_mut(idx)?;
        }
        Some(current)
    }

    /// Pointers to every leaf of the tree, in document order
    pub fn leaf_pointers(&self) -> Vec<PartPointer> {
        let mut leaves = vec![];
        let mut stack = vec![PartPointer::root()];

        while let Some(ptr) = stack.pop() {
            let Some(part) = self.resolve_ptr(&ptr) else {
                continue;
            };
            match &part.content {
                PartContent::Leaf { .. } => leaves.push(ptr),
                PartContent::Multipart(mp) => {
                    for i in (0..mp.parts.len()).rev() {
                        stack.push(ptr.clone().append(PartPointer::nth(i)));
                    }
                }
            }
        }

        leaves
    }
}

/// References the position of a MimePart by encoding the steps in
/// a tree walking operation. The encoding of PartPointer is a
/// sequence of integers that identify the index of a child part
/// by its level within the mime tree, selecting the current node
/// when no more indices remain. eg: `[]` indicates the
/// root part, while `[0]` is the 0th child of the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PartPointer(Vec<usize>);

impl PartPointer {
    /// Construct a PartPointer that references the root node
    pub fn root() -> Self {
        Self(vec![])
    }

    /// Construct a PartPointer that references the nth child
    pub fn nth(n: usize) -> Self {
        Self(vec![n])
    }

    /// Join other onto self, consuming self and producing
    /// a pointer that makes other relative to self
    pub fn append(mut self, mut other: Self) -> Self {
        self.0.append(&mut other.0);
        self
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, parent) = self.0.split_last()?;
        Some(Self(parent.to_vec()))
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn id_string(&self) -> String {
        let ids: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        ids.join(".")
    }
}
