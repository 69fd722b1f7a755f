use regex::Regex;
use std::borrow::Cow;

/// A callback that may rewrite the decoded body of a leaf part.
/// It receives the lowercased media type, the label of the charset
/// the body is presented in, and the body itself. Returning `None`
/// leaves the body as it is.
pub trait BodyFilter: Send + Sync {
    fn filter(&self, content_type: &str, charset: &str, body: &[u8]) -> Option<Vec<u8>>;
}

impl<F> BodyFilter for F
where
    F: Fn(&str, &str, &[u8]) -> Option<Vec<u8>> + Send + Sync,
{
    fn filter(&self, content_type: &str, charset: &str, body: &[u8]) -> Option<Vec<u8>> {
        (self)(content_type, charset, body)
    }
}

/// Selects the leaves a filter applies to, by media type
#[derive(Debug, Clone)]
pub enum ContentTypeMatch {
    /// Every leaf
    Any,
    /// A single `type/subtype`
    Exact(String),
    /// Every subtype of a major type; holds the `type/` prefix
    Major(String),
    Regex(Regex),
}

impl ContentTypeMatch {
    /// `""` matches anything, `text/*` matches every text subtype,
    /// anything else must match the media type exactly.
    /// Comparisons ignore case.
    pub fn new(pattern: &str) -> Self {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern.is_empty() {
            Self::Any
        } else if let Some(major) = pattern.strip_suffix('*').filter(|p| p.ends_with('/')) {
            Self::Major(major.to_string())
        } else {
            Self::Exact(pattern)
        }
    }

    pub fn matches(&self, mime_type: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => mime_type.eq_ignore_ascii_case(expected),
            Self::Major(prefix) => mime_type
                .get(..prefix.len())
                .is_some_and(|major| major.eq_ignore_ascii_case(prefix)),
            Self::Regex(re) => re.is_match(mime_type),
        }
    }
}

impl From<&str> for ContentTypeMatch {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

impl From<Regex> for ContentTypeMatch {
    fn from(re: Regex) -> Self {
        Self::Regex(re)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterScope {
    /// Every matching leaf, attachments included
    AllLeaves,
    /// Only leaves that are displayed as part of the message
    InlineOnly,
}

struct Registration {
    pattern: ContentTypeMatch,
    scope: FilterScope,
    filter: Box<dyn BodyFilter>,
}

/// The ordered set of body filters of a transaction
#[derive(Default)]
pub struct FilterRegistry {
    filters: Vec<Registration>,
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_list()
            .entries(self.filters.iter().map(|r| (&r.pattern, r.scope)))
            .finish()
    }
}

impl FilterRegistry {
    pub fn register(
        &mut self,
        pattern: impl Into<ContentTypeMatch>,
        scope: FilterScope,
        filter: impl BodyFilter + 'static,
    ) {
        self.filters.push(Registration {
            pattern: pattern.into(),
            scope,
            filter: Box::new(filter),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    fn matching<'a>(
        &'a self,
        mime_type: &'a str,
        is_attachment: bool,
    ) -> impl Iterator<Item = &'a Registration> + 'a {
        self.filters.iter().filter(move |r| {
            (r.scope == FilterScope::AllLeaves || !is_attachment) && r.pattern.matches(mime_type)
        })
    }

    /// Whether any filter applies to a leaf of this type
    pub fn has_match(&self, mime_type: &str, is_attachment: bool) -> bool {
        self.matching(mime_type, is_attachment).next().is_some()
    }

    /// Run the matching filters in registration order, each seeing
    /// the output of the one before it. Returns the final body when
    /// it differs from the input.
    pub fn dispatch(
        &self,
        mime_type: &str,
        charset: &str,
        is_attachment: bool,
        body: &[u8],
    ) -> Option<Vec<u8>> {
        let mut current = Cow::Borrowed(body);
        for registration in self.matching(mime_type, is_attachment) {
            if let Some(replacement) = registration.filter.filter(mime_type, charset, &current) {
                if replacement != current.as_ref() {
                    current = Cow::Owned(replacement);
                }
            }
        }
        match current {
            Cow::Owned(changed) if changed != body => Some(changed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn patterns() {
        assert!(ContentTypeMatch::new("").matches("application/pdf"));
        assert!(ContentTypeMatch::new("Text/Plain").matches("text/plain"));
        assert!(!ContentTypeMatch::new("text/plain").matches("text/html"));
        assert!(!ContentTypeMatch::new("text/plain").matches("text/plainish"));
        assert!(ContentTypeMatch::new("text/*").matches("text/html"));
        assert!(!ContentTypeMatch::new("text/*").matches("image/png"));
        assert!(!ContentTypeMatch::new("text/*").matches("tex"));
        let re = Regex::new("^image/(png|gif)$").unwrap();
        assert!(ContentTypeMatch::from(re).matches("image/gif"));
    }

    #[test]
    fn filters_chain_in_order() {
        let mut registry = FilterRegistry::default();
        registry.register(
            "text/plain",
            FilterScope::AllLeaves,
            |_: &str, _: &str, body: &[u8]| {
                let mut body = body.to_vec();
                body.extend_from_slice(b" one");
                Some(body)
            },
        );
        registry.register(
            "",
            FilterScope::AllLeaves,
            |_: &str, _: &str, _: &[u8]| -> Option<Vec<u8>> { None },
        );
        registry.register(
            "text/*",
            FilterScope::AllLeaves,
            |_: &str, _: &str, body: &[u8]| {
                let mut body = body.to_vec();
                body.extend_from_slice(b" two");
                Some(body)
            },
        );

        k9::assert_equal!(
            registry.dispatch("text/plain", "utf-8", false, b"zero"),
            Some(b"zero one two".to_vec())
        );
        k9::assert_equal!(
            registry.dispatch("text/html", "utf-8", false, b"zero"),
            Some(b"zero two".to_vec())
        );
        assert!(registry.has_match("image/png", true));
        k9::assert_equal!(registry.dispatch("image/png", "us-ascii", true, b"zero"), None);
    }

    #[test]
    fn scope_and_identity_replacements() {
        let mut registry = FilterRegistry::default();
        registry.register(
            "text/plain",
            FilterScope::InlineOnly,
            |_: &str, _: &str, body: &[u8]| Some(body.to_vec()),
        );

        assert!(registry.has_match("text/plain", false));
        assert!(!registry.has_match("text/plain", true));
        k9::assert_equal!(registry.dispatch("text/plain", "utf-8", false, b"same"), None);
    }
}
