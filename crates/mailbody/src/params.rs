use crate::nom_utils::{explain_nom, make_context_error, make_span, IResult, ParseError, Span};
use crate::{MailBodyError, Result};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, satisfy};
use nom::combinator::{all_consuming, map, opt, recognize};
use nom::error::context;
use nom::multi::{many0, many1};
use nom::sequence::{delimited, preceded, terminated, tuple};

impl MailBodyError {
    pub(crate) fn from_nom(input: Span, err: nom::Err<ParseError<Span<'_>>>) -> Self {
        MailBodyError::HeaderParse(explain_nom(input, err))
    }
}

fn is_utf8_non_ascii(c: char) -> bool {
    let c = c as u32;
    c == 0 || c >= 0x80
}

fn is_ctl(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{1f}' | '\u{7f}')
}

fn is_char(c: char) -> bool {
    matches!(c, '\u{01}'..='\u{ff}')
}

// vchar = { '\u{21}'..'\u{7e}' | utf8_non_ascii }
fn is_vchar(c: char) -> bool {
    let u = c as u32;
    (0x21..=0x7e).contains(&u) || is_utf8_non_ascii(c)
}

fn is_obs_no_ws_ctl(c: char) -> bool {
    matches!(
        c,
        '\u{01}'..='\u{08}' | '\u{0b}'..='\u{0c}' | '\u{0e}'..='\u{1f}' | '\u{7f}'
    )
}

// ctext = { '\u{21}'..'\u{27}' | '\u{2a}'..'\u{5b}' | '\u{5d}'..'\u{7e}' | obs_ctext | utf8_non_ascii }
fn is_ctext(c: char) -> bool {
    match c {
        '\u{21}'..='\u{27}' | '\u{2a}'..='\u{5b}' | '\u{5d}'..='\u{7e}' => true,
        c => is_obs_no_ws_ctl(c) || is_utf8_non_ascii(c),
    }
}

// qtext = { "\u{21}" | '\u{23}'..'\u{5b}' | '\u{5d}'..'\u{7e}' | obs_qtext | utf8_non_ascii }
fn is_qtext(c: char) -> bool {
    match c {
        '\u{21}' | '\u{23}'..='\u{5b}' | '\u{5d}'..='\u{7e}' => true,
        c => is_obs_no_ws_ctl(c) || is_utf8_non_ascii(c),
    }
}

fn is_tspecial(c: char) -> bool {
    matches!(
        c,
        '(' | ')' | '<' | '>' | '@' | ',' | ';' | ':' | '\\' | '"' | '/' | '[' | ']' | '?' | '='
    )
}

fn is_attribute_char(c: char) -> bool {
    match c {
        ' ' | '*' | '\'' | '%' => false,
        _ => is_char(c) && !is_ctl(c) && !is_tspecial(c),
    }
}

fn is_mime_token(c: char) -> bool {
    is_char(c) && c != ' ' && !is_ctl(c) && !is_tspecial(c)
}

fn is_quoted_pair(c: char) -> bool {
    match c {
        '\u{00}' | '\r' | '\n' | ' ' => true,
        c => is_obs_no_ws_ctl(c) || is_vchar(c),
    }
}

fn wsp(input: Span) -> IResult<Span, Span> {
    context("wsp", take_while1(|c| c == ' ' || c == '\t'))(input)
}

// Header values are unfolded before they get here, so folding
// whitespace is just a run of spaces and tabs.
fn fws(input: Span) -> IResult<Span, Span> {
    context("fws", recognize(many1(wsp)))(input)
}

// cfws = { ( (fws? ~ comment)+ ~ fws?) | fws }
fn cfws(input: Span) -> IResult<Span, Span> {
    context(
        "cfws",
        recognize(alt((
            recognize(tuple((many1(tuple((opt(fws), comment))), opt(fws)))),
            fws,
        ))),
    )(input)
}

// comment = { "(" ~ (fws? ~ ccontent)* ~ fws? ~ ")" }
fn comment(input: Span) -> IResult<Span, Span> {
    context(
        "comment",
        recognize(tuple((
            char('('),
            many0(tuple((opt(fws), ccontent))),
            opt(fws),
            char(')'),
        ))),
    )(input)
}

// ccontent = { ctext | quoted_pair | comment }
fn ccontent(input: Span) -> IResult<Span, Span> {
    context(
        "ccontent",
        alt((
            recognize(satisfy(is_ctext)),
            recognize(quoted_pair),
            comment,
        )),
    )(input)
}

// quoted_pair = { ( "\\"  ~ (vchar | wsp)) | obs_qp }
fn quoted_pair(input: Span) -> IResult<Span, char> {
    context("quoted_pair", preceded(char('\\'), satisfy(is_quoted_pair)))(input)
}

// quoted_string = { cfws? ~ "\"" ~ (fws? ~ qcontent)* ~ fws? ~ "\"" ~ cfws? }
fn quoted_string(input: Span) -> IResult<Span, String> {
    let (loc, (bits, trailer)) = context(
        "quoted_string",
        delimited(
            opt(cfws),
            delimited(
                char('"'),
                tuple((many0(tuple((opt(fws), qcontent))), opt(fws))),
                char('"'),
            ),
            opt(cfws),
        ),
    )(input)?;

    let mut result = String::new();
    for (ws, c) in bits {
        if let Some(ws) = ws {
            result.push_str(ws.fragment());
        }
        result.push(c);
    }
    if let Some(t) = trailer {
        result.push_str(t.fragment());
    }
    Ok((loc, result))
}

// qcontent = { qtext | quoted_pair }
fn qcontent(input: Span) -> IResult<Span, char> {
    context("qcontent", alt((satisfy(is_qtext), quoted_pair)))(input)
}

// encoded_word = { "=?" ~ charset ~ ("*" ~ language)? ~ "?" ~ encoding ~ "?" ~ encoded_text ~ "?=" }
fn encoded_word(input: Span) -> IResult<Span, String> {
    let word_token = |c: char| c != '*' && c != '?' && is_mime_token(c);
    let (loc, (charset, _language, _, encoding, _, text)) = context(
        "encoded_word",
        delimited(
            tag("=?"),
            tuple((
                take_while1(word_token),
                opt(preceded(char('*'), take_while1(word_token))),
                char('?'),
                take_while1(word_token),
                char('?'),
                take_while1(|c| is_vchar(c) && c != '?'),
            )),
            tag("?="),
        ),
    )(input)?;

    let bytes = match *encoding.fragment() {
        "B" | "b" => data_encoding::BASE64_MIME
            .decode(text.as_bytes())
            .map_err(|err| {
                make_context_error(
                    input,
                    format!("encoded_word: base64 decode failed: {err:#}"),
                )
            })?,
        "Q" | "q" => {
            quoted_printable::decode(text.replace('_', " "), quoted_printable::ParseMode::Robust)
                .map_err(|err| {
                    make_context_error(
                        input,
                        format!("encoded_word: quoted printable decode failed: {err:#}"),
                    )
                })?
        }
        encoding => {
            return Err(make_context_error(
                input,
                format!(
                    "encoded_word: invalid encoding '{encoding}', expected one of b, B, q or Q"
                ),
            ));
        }
    };

    let charset = encoding_rs::Encoding::for_label(charset.as_bytes()).ok_or_else(|| {
        make_context_error(
            input,
            format!("encoded_word: unsupported charset '{charset}'"),
        )
    })?;

    let (decoded, _malformed) = charset.decode_without_bom_handling(&bytes);

    Ok((loc, decoded.to_string()))
}

// mime_token = { (!(" " | ctl | tspecials) ~ char)+ }
fn mime_token(input: Span) -> IResult<Span, Span> {
    context("mime_token", take_while1(is_mime_token))(input)
}

// Trailing parameters, with the `;` separator tolerated as optional
// because there are implementations that omit it, and a stray
// trailing `;` allowed.
fn parameter_list(input: Span) -> IResult<Span, Vec<MimeParameter>> {
    terminated(
        many0(preceded(
            preceded(opt(char(';')), opt(cfws)),
            terminated(parameter, opt(cfws)),
        )),
        opt(tuple((char(';'), opt(cfws)))),
    )(input)
}

// content_type = { cfws? ~ mime_type ~ cfws? ~ "/" ~ cfws? ~ subtype ~
//  cfws? ~ (";"? ~ cfws? ~ parameter ~ cfws?)*
// }
fn content_type(input: Span) -> IResult<Span, MimeParameters> {
    let (loc, (mime_type, _, _, _, mime_subtype, _, parameters)) = context(
        "content_type",
        preceded(
            opt(cfws),
            tuple((
                mime_token,
                opt(cfws),
                char('/'),
                opt(cfws),
                mime_token,
                opt(cfws),
                parameter_list,
            )),
        ),
    )(input)?;

    let value = format!("{mime_type}/{mime_subtype}").to_ascii_lowercase();
    Ok((loc, MimeParameters { value, parameters }))
}

// Content-Transfer-Encoding and Content-Disposition are a single token
// followed by the same parameter syntax as Content-Type
fn token_with_parameters(input: Span) -> IResult<Span, MimeParameters> {
    let (loc, (value, _, parameters)) = context(
        "token_with_parameters",
        preceded(opt(cfws), tuple((mime_token, opt(cfws), parameter_list))),
    )(input)?;

    Ok((
        loc,
        MimeParameters {
            value: value.to_ascii_lowercase(),
            parameters,
        },
    ))
}

// parameter = { regular_parameter | extended_parameter }
fn parameter(input: Span) -> IResult<Span, MimeParameter> {
    context(
        "parameter",
        alt((
            regular_parameter,
            extended_param_with_charset,
            extended_param_no_charset,
        )),
    )(input)
}

fn ext_value(input: Span) -> IResult<Span, String> {
    map(
        recognize(many0(alt((ext_octet, take_while1(is_attribute_char))))),
        |s: Span| s.to_string(),
    )(input)
}

fn extended_param_with_charset(input: Span) -> IResult<Span, MimeParameter> {
    context(
        "extended_param_with_charset",
        map(
            tuple((
                attribute,
                opt(section),
                char('*'),
                opt(cfws),
                char('='),
                opt(cfws),
                opt(mime_charset),
                char('\''),
                opt(mime_language),
                char('\''),
                ext_value,
            )),
            |(name, section, _, _, _, _, mime_charset, _, mime_language, _, value)| MimeParameter {
                name: name.to_string(),
                section,
                mime_charset: mime_charset.map(|s| s.to_string()),
                mime_language: mime_language.map(|s| s.to_string()),
                uses_encoding: true,
                value,
            },
        ),
    )(input)
}

fn extended_param_no_charset(input: Span) -> IResult<Span, MimeParameter> {
    context(
        "extended_param_no_charset",
        map(
            tuple((
                attribute,
                opt(section),
                opt(char('*')),
                opt(cfws),
                char('='),
                opt(cfws),
                alt((quoted_string, ext_value)),
            )),
            |(name, section, star, _, _, _, value)| MimeParameter {
                name: name.to_string(),
                section,
                mime_charset: None,
                mime_language: None,
                uses_encoding: star.is_some(),
                value,
            },
        ),
    )(input)
}

fn mime_charset(input: Span) -> IResult<Span, Span> {
    context(
        "mime_charset",
        take_while1(|c| is_mime_token(c) && c != '\''),
    )(input)
}

fn mime_language(input: Span) -> IResult<Span, Span> {
    context(
        "mime_language",
        take_while1(|c| is_mime_token(c) && c != '\''),
    )(input)
}

fn ext_octet(input: Span) -> IResult<Span, Span> {
    context(
        "ext_octet",
        recognize(tuple((
            char('%'),
            satisfy(|c| c.is_ascii_hexdigit()),
            satisfy(|c| c.is_ascii_hexdigit()),
        ))),
    )(input)
}

// section = { "*" ~ ASCII_DIGIT+ }
fn section(input: Span) -> IResult<Span, u32> {
    context(
        "section",
        preceded(char('*'), nom::character::complete::u32),
    )(input)
}

// regular_parameter = { attribute ~ cfws? ~ "=" ~ cfws? ~ value }
fn regular_parameter(input: Span) -> IResult<Span, MimeParameter> {
    context(
        "regular_parameter",
        map(
            tuple((attribute, opt(cfws), char('='), opt(cfws), value)),
            |(name, _, _, _, value)| MimeParameter {
                name: name.to_string(),
                value,
                section: None,
                uses_encoding: false,
                mime_charset: None,
                mime_language: None,
            },
        ),
    )(input)
}

// attribute = { attribute_char+ }
fn attribute(input: Span) -> IResult<Span, Span> {
    context("attribute", take_while1(is_attribute_char))(input)
}

fn value(input: Span) -> IResult<Span, String> {
    context(
        "value",
        alt((map(mime_token, |s: Span| s.to_string()), quoted_string)),
    )(input)
}

fn parse_with<'a, R, F>(text: &'a str, parser: F) -> Result<R>
where
    F: Fn(Span<'a>) -> IResult<Span<'a>, R>,
{
    let input = make_span(text);
    let (_, result) =
        all_consuming(parser)(input).map_err(|err| MailBodyError::from_nom(input, err))?;
    Ok(result)
}

/// Decode any RFC 2047 encoded words found in text.
/// Whitespace separating two adjacent encoded words is dropped;
/// anything that fails to decode is kept as written.
pub fn decode_encoded_words(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut pending_space = String::new();
    let mut after_word = false;
    let mut rest = text;

    while let Some(c) = rest.chars().next() {
        if rest.starts_with("=?") {
            if let Ok((remain, decoded)) = encoded_word(make_span(rest)) {
                if !after_word {
                    result.push_str(&pending_space);
                }
                pending_space.clear();
                result.push_str(&decoded);
                rest = *remain.fragment();
                after_word = true;
                continue;
            }
        }

        if c == ' ' || c == '\t' {
            pending_space.push(c);
        } else {
            result.push_str(&pending_space);
            pending_space.clear();
            result.push(c);
            after_word = false;
        }
        rest = &rest[c.len_utf8()..];
    }

    result.push_str(&pending_space);
    result
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MimeParameter {
    name: String,
    section: Option<u32>,
    mime_charset: Option<String>,
    mime_language: Option<String>,
    uses_encoding: bool,
    value: String,
}

/// A MIME header value (a media type, transfer encoding or disposition)
/// together with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeParameters {
    /// The lowercased leading token, eg: `text/plain` or `attachment`
    pub value: String,
    parameters: Vec<MimeParameter>,
}

impl MimeParameters {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_ascii_lowercase(),
            parameters: vec![],
        }
    }

    pub fn parse_content_type(text: &str) -> Result<Self> {
        parse_with(text, content_type)
    }

    pub fn parse_token_with_parameters(text: &str) -> Result<Self> {
        parse_with(text, token_with_parameters)
    }

    /// A forgiving split on `;` and `=` for header values that the
    /// grammar rejects, such as unquoted boundaries containing `=`.
    /// Values are unquoted but otherwise taken literally.
    pub fn parse_lenient(text: &str) -> Self {
        let mut pieces = text.split(';');
        let value = pieces.next().unwrap_or("").trim().to_ascii_lowercase();
        let value: String = value.chars().filter(|c| !c.is_whitespace()).collect();

        let parameters = pieces
            .filter_map(|piece| {
                let (name, value) = piece.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                Some(MimeParameter {
                    name: name.to_string(),
                    section: None,
                    mime_charset: None,
                    mime_language: None,
                    uses_encoding: false,
                    value: value.to_string(),
                })
            })
            .collect();

        Self { value, parameters }
    }

    /// Retrieve the value for a named parameter.
    /// This method will attempt to decode any %-encoded values
    /// per RFC 2231 and combine multi-element fields into a single
    /// contiguous value.
    /// Invalid charsets and encoding will be silently ignored.
    pub fn get(&self, name: &str) -> Option<String> {
        let mut elements: Vec<_> = self
            .parameters
            .iter()
            .filter(|p| p.name.eq_ignore_ascii_case(name))
            .collect();
        if elements.is_empty() {
            return None;
        }
        elements.sort_by(|a, b| a.section.cmp(&b.section));

        let mut mime_charset = None;
        let mut result = String::new();

        for ele in elements {
            if let Some(cset) = ele.mime_charset.as_deref() {
                mime_charset = encoding_rs::Encoding::for_label(cset.as_bytes());
            }

            match mime_charset {
                Some(charset) if ele.uses_encoding => {
                    let bytes = percent_decode(&ele.value);
                    let (decoded, _malformed) = charset.decode_without_bom_handling(&bytes);
                    result.push_str(&decoded);
                }
                _ => result.push_str(&ele.value),
            }
        }

        Some(result)
    }

    /// Remove the named parameter
    pub fn remove(&mut self, name: &str) {
        self.parameters
            .retain(|p| !p.name.eq_ignore_ascii_case(name));
    }

    /// Set the named parameter, replacing any prior value in place
    pub fn set(&mut self, name: &str, value: &str) {
        let param = MimeParameter {
            name: name.to_string(),
            value: value.to_string(),
            section: None,
            mime_charset: None,
            mime_language: None,
            uses_encoding: false,
        };
        match self
            .parameters
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))
        {
            Some(idx) => {
                self.remove(name);
                self.parameters.insert(idx, param);
            }
            None => self.parameters.push(param),
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.value.starts_with("multipart/")
    }

    pub fn is_text(&self) -> bool {
        self.value.starts_with("text/")
    }

    /// Serialize as a single line header value.
    /// Parameters keep their original order; split RFC 2231 sections
    /// are joined back together.
    pub fn encode_value(&self) -> String {
        let mut result = self.value.clone();
        let mut names: Vec<&str> = vec![];
        for p in &self.parameters {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(&p.name)) {
                names.push(&p.name);
            }
        }

        for name in names {
            let Some(value) = self.get(name) else {
                continue;
            };
            result.push_str("; ");

            if !value.is_empty() && value.chars().all(is_mime_token) {
                result.push_str(&format!("{name}={value}"));
            } else if value.is_ascii() && value.chars().all(|c| c == ' ' || is_quoted_pair(c)) {
                result.push_str(name);
                result.push_str("=\"");
                for c in value.chars() {
                    if c == '"' || c == '\\' {
                        result.push('\\');
                    }
                    result.push(c);
                }
                result.push('"');
            } else {
                result.push_str(name);
                result.push_str("*=UTF-8''");
                for b in value.bytes() {
                    if b.is_ascii() && is_attribute_char(b as char) {
                        result.push(b as char);
                    } else {
                        result.push_str(&format!("%{b:02X}"));
                    }
                }
            }
        }
        result
    }
}

fn percent_decode(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' && idx + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[idx + 1..idx + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(b) = hex {
                result.push(b);
                idx += 3;
                continue;
            }
        }
        result.push(bytes[idx]);
        idx += 1;
    }
    result
}
