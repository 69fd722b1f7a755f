use crate::{MailBodyError, MimePart, PartContent, Result};
use bytes::Bytes;
use std::convert::Infallible;

enum Step<'a> {
    Part(&'a MimePart),
    Raw(&'a [u8]),
}

impl MimePart {
    /// Visit the serialized form of the tree, piece by piece, in
    /// output order. Untouched parts yield exactly the bytes they
    /// were parsed from. The walk uses an explicit stack, so the
    /// nesting depth does not consume native stack.
    fn emit_pieces<E>(
        &self,
        mut emit: impl FnMut(&[u8]) -> std::result::Result<(), E>,
    ) -> std::result::Result<(), E> {
        let mut stack = vec![Step::Part(self)];

        while let Some(step) = stack.pop() {
            let part = match step {
                Step::Raw(bytes) => {
                    emit(bytes)?;
                    continue;
                }
                Step::Part(part) => part,
            };

            for header in part.headers().iter() {
                emit(header.raw().as_ref())?;
            }
            emit(part.separator())?;

            match part.content() {
                PartContent::Leaf { raw_body, .. } => emit(raw_body)?,
                PartContent::Multipart(mp) => {
                    emit(mp.preamble())?;
                    stack.push(Step::Raw(mp.epilogue()));
                    stack.push(Step::Raw(mp.closing_delimiter()));
                    for (delimiter, child) in
                        mp.delimiters().iter().zip(part.children().iter()).rev()
                    {
                        stack.push(Step::Part(child));
                        stack.push(Step::Raw(delimiter));
                    }
                }
            }
        }

        Ok(())
    }

    /// Write the message content to the provided output stream
    pub fn write_message<W: std::io::Write>(&self, out: &mut W) -> Result<()> {
        self.emit_pieces(|bytes| {
            out.write_all(bytes)
                .map_err(|_| MailBodyError::WriteMessageIOError)
        })
    }

    /// Serialize the tree into a single buffer
    pub fn to_message_bytes(&self) -> Bytes {
        let mut out = vec![];
        let result: std::result::Result<(), Infallible> = self.emit_pieces(|bytes| {
            out.extend_from_slice(bytes);
            Ok(())
        });
        match result {
            Ok(()) => Bytes::from(out),
            Err(never) => match never {},
        }
    }
}
