use crate::filter::BodyFilter;
use mailbody::LineEnding;

/// Appends a banner to text/plain bodies, on a line of its own
#[derive(Debug, Clone)]
pub struct TextBanner {
    banner: String,
}

impl TextBanner {
    pub fn new(banner: &str) -> Self {
        Self {
            banner: banner.to_string(),
        }
    }

    pub fn apply(&self, body: &[u8]) -> Vec<u8> {
        let line_ending = LineEnding::detect(body);
        let mut out = Vec::with_capacity(body.len() + self.banner.len() + 4);
        out.extend_from_slice(body);
        if !out.is_empty() && !out.ends_with(b"\n") {
            out.extend_from_slice(line_ending.as_bytes());
        }
        out.extend_from_slice(&line_ending.apply(self.banner.as_bytes()));
        out.extend_from_slice(line_ending.as_bytes());
        out
    }
}

impl BodyFilter for TextBanner {
    fn filter(&self, _content_type: &str, _charset: &str, body: &[u8]) -> Option<Vec<u8>> {
        Some(self.apply(body))
    }
}

/// Places a banner at the end of the visible content of text/html
/// bodies: before the closing body tag, else before the closing html
/// tag, else at the very end.
#[derive(Debug, Clone)]
pub struct HtmlBanner {
    banner: String,
}

impl HtmlBanner {
    pub fn new(banner: &str) -> Self {
        Self {
            banner: banner.to_string(),
        }
    }

    /// Derive the html banner from a plain text one
    pub fn from_text(text: &str) -> Self {
        Self::new(&escape_html(text))
    }

    pub fn apply(&self, body: &[u8]) -> Vec<u8> {
        let line_ending = LineEnding::detect(body);
        let banner = line_ending.apply(self.banner.as_bytes());
        let lower = body.to_ascii_lowercase();

        let insert_at = memchr::memmem::rfind(&lower, b"</body>")
            .or_else(|| memchr::memmem::rfind(&lower, b"</html>"));

        let mut out = Vec::with_capacity(body.len() + banner.len() + 4);
        match insert_at {
            Some(idx) => {
                out.extend_from_slice(&body[..idx]);
                out.extend_from_slice(&banner);
                out.extend_from_slice(line_ending.as_bytes());
                out.extend_from_slice(&body[idx..]);
            }
            None => {
                out.extend_from_slice(body);
                if !out.is_empty() && !out.ends_with(b"\n") {
                    out.extend_from_slice(line_ending.as_bytes());
                }
                out.extend_from_slice(&banner);
                out.extend_from_slice(line_ending.as_bytes());
            }
        }
        out
    }
}

impl BodyFilter for HtmlBanner {
    fn filter(&self, _content_type: &str, _charset: &str, body: &[u8]) -> Option<Vec<u8>> {
        Some(self.apply(body))
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    let mut lines = text.lines().peekable();
    while let Some(line) = lines.next() {
        for c in line.chars() {
            match c {
                '&' => escaped.push_str("&amp;"),
                '<' => escaped.push_str("&lt;"),
                '>' => escaped.push_str("&gt;"),
                '"' => escaped.push_str("&quot;"),
                c => escaped.push(c),
            }
        }
        if lines.peek().is_some() {
            escaped.push_str("<br/>\n");
        }
    }
    escaped
}
