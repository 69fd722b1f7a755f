use crate::{Header, LineEnding, MimeParameters, Result};

/// Represents an ordered list of headers.
/// Note that there may be multiple headers with the same name.
/// Derefs to the underlying `Vec<Header>` for mutation,
/// but provides some accessors for retrieving headers by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
    headers: Vec<Header>,
}

impl std::ops::Deref for HeaderMap {
    type Target = Vec<Header>;
    fn deref(&self) -> &Vec<Header> {
        &self.headers
    }
}

impl std::ops::DerefMut for HeaderMap {
    fn deref_mut(&mut self) -> &mut Vec<Header> {
        &mut self.headers
    }
}

impl HeaderMap {
    pub fn new(headers: Vec<Header>) -> Self {
        Self { headers }
    }

    pub fn get_first<'a>(&'a self, name: &'a str) -> Option<&'a Header> {
        self.iter_named(name).next()
    }

    pub fn get_last<'a>(&'a self, name: &'a str) -> Option<&'a Header> {
        self.iter_named(name).next_back()
    }

    pub fn iter_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl DoubleEndedIterator<Item = &'a Header> + 'a {
        self.headers
            .iter()
            .filter(move |header| header.get_name().eq_ignore_ascii_case(name))
    }

    pub fn content_type(&self) -> Result<Option<MimeParameters>> {
        match self.get_first("Content-Type") {
            None => Ok(None),
            Some(header) => Ok(Some(header.as_content_type()?)),
        }
    }

    pub fn content_transfer_encoding(&self) -> Result<Option<MimeParameters>> {
        match self.get_first("Content-Transfer-Encoding") {
            None => Ok(None),
            Some(header) => Ok(Some(header.as_content_transfer_encoding()?)),
        }
    }

    pub fn content_disposition(&self) -> Result<Option<MimeParameters>> {
        match self.get_first("Content-Disposition") {
            None => Ok(None),
            Some(header) => Ok(Some(header.as_content_disposition()?)),
        }
    }

    /// Replace the first header with this name, in place, and drop any
    /// later duplicates. When there is no such header, the new one is
    /// appended to the end of the block.
    pub fn set_header(&mut self, name: &str, value: &str, line_ending: LineEnding) {
        let replacement = Header::new(name, value, line_ending);
        match self
            .headers
            .iter()
            .position(|h| h.get_name().eq_ignore_ascii_case(name))
        {
            Some(idx) => {
                self.headers[idx] = replacement;
                let mut seen = 0;
                self.headers.retain(|h| {
                    if h.get_name().eq_ignore_ascii_case(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.headers.push(replacement),
        }
    }

    pub fn remove_all_named(&mut self, name: &str) {
        self.headers.retain(|h| !h.get_name().eq_ignore_ascii_case(name));
    }
}
