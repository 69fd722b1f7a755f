use crate::accumulator::ByteAccumulator;
use crate::attachment::{AttachmentHook, AttachmentInfo, AttachmentStream, CompletionBarrier};
use crate::banner::{HtmlBanner, TextBanner};
use crate::filter::{BodyFilter, ContentTypeMatch, FilterRegistry, FilterScope};
use crate::{MessageStream, Result, TransactionConfig, TransactionError};
use mailbody::{decode_charset, is_known_charset, splice_undecodable, MimePart, PartPointer};
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Receiving,
    Ended,
}

/// Collects the data of a single message, and on completion runs it
/// through the registered body filters and attachment hook to produce
/// the message that is passed on.
pub struct Transaction {
    config: TransactionConfig,
    state: State,
    accumulator: ByteAccumulator,
    filters: FilterRegistry,
    attachment_hook: Option<Box<dyn AttachmentHook>>,
    body: Option<MimePart>,
    message_stream: Option<MessageStream>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Transaction")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("data_bytes", &self.accumulator.len())
            .field("filters", &self.filters)
            .field("attachment_hook", &self.attachment_hook.is_some())
            .finish()
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self::with_config(TransactionConfig::default())
    }

    pub fn with_config(config: TransactionConfig) -> Self {
        Self {
            accumulator: ByteAccumulator::new(config.dot_stuffed),
            config,
            state: State::Receiving,
            filters: FilterRegistry::default(),
            attachment_hook: None,
            body: None,
            message_stream: None,
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn is_ended(&self) -> bool {
        self.state == State::Ended
    }

    fn ensure_receiving(&self, what: &'static str) -> Result<()> {
        match self.state {
            State::Receiving => Ok(()),
            State::Ended => Err(TransactionError::RegistrationAfterEnd(what)),
        }
    }

    /// Whether text parts are decoded from their charset before
    /// being passed to body filters
    pub fn parse_body(&self) -> bool {
        self.config.parse_body
    }

    /// Registering a filter, a banner or an attachment hook turns this
    /// on; it may be switched back off afterwards.
    pub fn set_parse_body(&mut self, parse_body: bool) {
        self.config.parse_body = parse_body;
    }

    /// Append a chunk of message data. Chunks need not end on a line
    /// boundary.
    pub fn add_data(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        if self.state == State::Ended {
            return Err(TransactionError::DataAfterEnd);
        }
        self.accumulator.add_data(data.as_ref());
        Ok(())
    }

    /// Number of message bytes received
    pub fn data_bytes(&self) -> usize {
        self.accumulator.len()
    }

    /// Number of message lines received
    pub fn data_lines(&self) -> usize {
        self.accumulator.lines()
    }

    /// Register a filter for leaves whose media type matches pattern.
    /// `""` matches every leaf and `type/*` every subtype of type.
    pub fn add_body_filter(
        &mut self,
        pattern: &str,
        filter: impl BodyFilter + 'static,
    ) -> Result<()> {
        self.register_filter(ContentTypeMatch::new(pattern), filter)
    }

    /// Register a filter for leaves whose media type matches re
    pub fn add_body_filter_regex(
        &mut self,
        re: Regex,
        filter: impl BodyFilter + 'static,
    ) -> Result<()> {
        self.register_filter(ContentTypeMatch::Regex(re), filter)
    }

    fn register_filter(
        &mut self,
        pattern: ContentTypeMatch,
        filter: impl BodyFilter + 'static,
    ) -> Result<()> {
        self.ensure_receiving("body filter")?;
        self.filters.register(pattern, FilterScope::AllLeaves, filter);
        self.config.parse_body = true;
        Ok(())
    }

    /// Append banners to the inline text parts of the message.
    /// When html is not given, the text banner is escaped for use in
    /// html parts.
    pub fn set_banner(&mut self, text: &str, html: Option<&str>) -> Result<()> {
        self.ensure_receiving("banner")?;
        let html = match html {
            Some(html) => HtmlBanner::new(html),
            None => HtmlBanner::from_text(text),
        };
        self.filters.register("text/plain", FilterScope::InlineOnly, TextBanner::new(text));
        self.filters.register("text/html", FilterScope::InlineOnly, html);
        self.config.parse_body = true;
        Ok(())
    }

    /// Register the hook that receives the attachments of the message.
    /// Only one hook may be registered.
    pub fn attachment_hooks(&mut self, hook: impl AttachmentHook + 'static) -> Result<()> {
        self.ensure_receiving("attachment hook")?;
        if self.attachment_hook.is_some() {
            return Err(TransactionError::DuplicateAttachmentHook);
        }
        self.attachment_hook = Some(Box::new(hook));
        self.config.parse_body = true;
        Ok(())
    }

    /// The parsed message, available after end_data when the body
    /// was parsed
    pub fn body(&self) -> Option<&MimePart> {
        self.body.as_ref()
    }

    /// The finished message, available after end_data
    pub fn message_stream(&self) -> Option<&MessageStream> {
        self.message_stream.as_ref()
    }

    /// Mark the end of the message data and produce the finished
    /// message. Resolves once the message is available and every
    /// attachment stream has been consumed or dropped.
    pub async fn end_data(&mut self) -> Result<()> {
        if self.state == State::Ended {
            return Err(TransactionError::AlreadyEnded);
        }
        self.state = State::Ended;

        let data = self.accumulator.finish();
        tracing::debug!(
            "end_data: {} bytes in {} lines",
            self.accumulator.len(),
            self.accumulator.lines()
        );

        let needs_parse = self.config.parse_body
            || !self.filters.is_empty()
            || self.attachment_hook.is_some();
        if !needs_parse {
            self.message_stream = Some(MessageStream::new(data));
            return Ok(());
        }

        let mut root = MimePart::parse_with_max_depth(data.clone(), self.config.max_depth);
        tracing::debug!(
            "parsed message: {} leaves, conformance {}",
            root.leaf_pointers().len(),
            root.conformance()
        );

        let barrier = CompletionBarrier::new();
        let mut changed = false;
        for ptr in root.leaf_pointers() {
            if let Some(part) = root.resolve_ptr_mut(&ptr) {
                changed |= self.process_leaf(part, &ptr, &barrier);
            }
        }

        let output = if changed {
            root.to_message_bytes()
        } else {
            data
        };
        self.body = Some(root);
        self.message_stream = Some(MessageStream::new(output));

        barrier.wait().await;
        Ok(())
    }

    /// Filter or stream a single leaf, returning true if its body was
    /// replaced
    fn process_leaf(
        &self,
        part: &mut MimePart,
        ptr: &PartPointer,
        barrier: &CompletionBarrier,
    ) -> bool {
        let info = part.info();
        let is_attachment = info.is_attachment();

        if self.filters.has_match(&info.mime_type, is_attachment) {
            let decoded = match part.decode_body() {
                Ok(decoded) => decoded,
                Err(err) => {
                    tracing::warn!(
                        "part {}: {err:#}, passing it through unfiltered",
                        ptr.id_string()
                    );
                    return false;
                }
            };

            let result = if self.config.parse_body && info.is_text {
                let label = info.charset_label();
                let (text, malformed) = decode_charset(label, &decoded);
                let Some(replacement) = self.filters.dispatch(
                    &info.mime_type,
                    "utf-8",
                    is_attachment,
                    text.as_bytes(),
                ) else {
                    return false;
                };
                let replacement = String::from_utf8_lossy(&replacement);

                if malformed || !is_known_charset(label) {
                    // The text seen by the filters is lossy, so only
                    // additions are written back onto the original bytes
                    match splice_undecodable(label, &decoded, &text, &replacement) {
                        Some(bytes) => part.replace_body_bytes(&bytes),
                        None => {
                            tracing::warn!(
                                "part {}: body is not valid {label} and the filter \
                                 changed its existing text, passing it through unfiltered",
                                ptr.id_string()
                            );
                            return false;
                        }
                    }
                } else {
                    part.replace_text_body(&replacement)
                }
            } else {
                let label = if info.is_text {
                    info.charset_label()
                } else {
                    info.charset.as_deref().unwrap_or("binary")
                };
                match self
                    .filters
                    .dispatch(&info.mime_type, label, is_attachment, &decoded)
                {
                    Some(replacement) => part.replace_body_bytes(&replacement),
                    None => return false,
                }
            };

            return match result {
                Ok(()) => {
                    tracing::debug!("part {}: body replaced by filter", ptr.id_string());
                    true
                }
                Err(err) => {
                    tracing::warn!("part {}: {err:#}, keeping original body", ptr.id_string());
                    false
                }
            };
        }

        let Some(hook) = self.attachment_hook.as_ref().filter(|_| is_attachment) else {
            return false;
        };
        let decoded = match part.decode_body() {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(
                    "part {}: {err:#}, not streaming attachment",
                    ptr.id_string()
                );
                return false;
            }
        };
        let attachment = AttachmentInfo {
            content_type: info.mime_type,
            filename: info.file_name,
            charset: info.charset,
            size: decoded.len(),
            part: ptr.clone(),
        };
        tracing::debug!(
            "part {}: streaming {} attachment of {} bytes",
            ptr.id_string(),
            attachment.content_type,
            attachment.size
        );
        let stream =
            AttachmentStream::new(decoded, self.config.attachment_chunk_size, barrier);
        hook.on_attachment(attachment, stream);

        false
    }
}
