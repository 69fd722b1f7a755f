use nom::error::{ContextError, ErrorKind};
use nom_locate::LocatedSpan;
use std::fmt::{Debug, Write};

pub(crate) type Span<'a> = LocatedSpan<&'a str>;
pub(crate) type IResult<'a, A, B> = nom::IResult<A, B, ParseError<Span<'a>>>;

pub(crate) fn make_span(s: &str) -> Span<'_> {
    Span::new(s)
}

#[derive(Debug)]
pub(crate) enum ParseErrorKind {
    Context(&'static str),
    Char(char),
    Nom(ErrorKind),
    External(String),
}

/// Accumulates the chain of parsers that were active when a
/// header value failed to parse, innermost first.
#[derive(Debug)]
pub(crate) struct ParseError<I: Debug> {
    pub errors: Vec<(I, ParseErrorKind)>,
}

impl<I: Debug> ContextError<I> for ParseError<I> {
    fn add_context(input: I, ctx: &'static str, mut other: Self) -> Self {
        other.errors.push((input, ParseErrorKind::Context(ctx)));
        other
    }
}

impl<I: Debug> nom::error::ParseError<I> for ParseError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        Self {
            errors: vec![(input, ParseErrorKind::Nom(kind))],
        }
    }

    fn append(input: I, kind: ErrorKind, mut other: Self) -> Self {
        other.errors.push((input, ParseErrorKind::Nom(kind)));
        other
    }

    fn from_char(input: I, c: char) -> Self {
        Self {
            errors: vec![(input, ParseErrorKind::Char(c))],
        }
    }
}

pub(crate) fn make_context_error<S: Into<String>>(
    input: Span<'_>,
    reason: S,
) -> nom::Err<ParseError<Span<'_>>> {
    nom::Err::Error(ParseError {
        errors: vec![(input, ParseErrorKind::External(reason.into()))],
    })
}

/// Render a parse failure as a human readable explanation, with a
/// caret pointing at the column where each parser gave up.
/// Header values are unfolded before parsing, so there is only
/// ever a single line to show.
pub(crate) fn explain_nom(input: Span<'_>, err: nom::Err<ParseError<Span<'_>>>) -> String {
    let e = match err {
        nom::Err::Error(e) | nom::Err::Failure(e) => e,
        nom::Err::Incomplete(_) => return format!("{err:?}"),
    };

    let line: String = input
        .fragment()
        .chars()
        .map(|c| match c {
            '\t' => '\u{2409}',
            c => c,
        })
        .collect();

    let mut result = String::new();
    for (i, (span, kind)) in e.errors.iter().enumerate() {
        let what = match kind {
            ParseErrorKind::Char(expected) => match span.fragment().chars().next() {
                Some(actual) => format!("expected '{expected}', found {actual}"),
                None => format!("expected '{expected}', got end of input"),
            },
            ParseErrorKind::Context(context) => format!("in {context}"),
            ParseErrorKind::External(reason) => reason.clone(),
            ParseErrorKind::Nom(kind) => format!("in {kind:?}"),
        };

        if input.is_empty() {
            write!(&mut result, "{i}: {what}, got empty input\n\n").ok();
            continue;
        }

        let caret = format!("{}^", " ".repeat(span.get_utf8_column().saturating_sub(1)));
        write!(&mut result, "{i}: {what}:\n{line}\n{caret}\n\n").ok();
    }
    result
}
