use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// The next byte begins a new line
    LineStart,
    /// Somewhere in the middle of a line
    InLine,
    /// A `.` at the start of a line has been held back
    Dot,
    /// A `.` then CR at the start of a line have been held back
    DotCr,
    /// The end of data marker has been seen
    Complete,
}

/// Buffers the raw bytes of a message as they arrive.
/// Chunks need not be split on line boundaries.
#[derive(Debug)]
pub struct ByteAccumulator {
    buffer: BytesMut,
    dot_stuffed: bool,
    state: State,
    bytes: usize,
    lines: usize,
}

impl ByteAccumulator {
    pub fn new(dot_stuffed: bool) -> Self {
        Self {
            buffer: BytesMut::new(),
            dot_stuffed,
            state: State::LineStart,
            bytes: 0,
            lines: 0,
        }
    }

    /// Number of bytes accumulated so far.
    /// This remains valid after `finish`.
    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Number of line breaks accumulated so far
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Whether the end of data marker was seen.
    /// Only dot stuffed input has one.
    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    pub fn add_data(&mut self, data: &[u8]) {
        if !self.dot_stuffed {
            self.push(data);
            return;
        }

        let mut data = data;
        while !data.is_empty() {
            match self.state {
                State::Complete => {
                    tracing::trace!("ignoring {} bytes after end of data", data.len());
                    return;
                }
                State::LineStart => {
                    if data[0] == b'.' {
                        self.state = State::Dot;
                        data = &data[1..];
                    } else {
                        self.state = State::InLine;
                    }
                }
                State::InLine => match memchr::memchr(b'\n', data) {
                    Some(idx) => {
                        self.push(&data[..=idx]);
                        data = &data[idx + 1..];
                        self.state = State::LineStart;
                    }
                    None => {
                        self.push(data);
                        data = &[];
                    }
                },
                State::Dot => match data[0] {
                    b'\r' => {
                        self.state = State::DotCr;
                        data = &data[1..];
                    }
                    b'\n' => {
                        self.state = State::Complete;
                    }
                    _ => {
                        // A stuffed dot; the held one is dropped and
                        // the rest of the line is kept as is
                        self.state = State::InLine;
                    }
                },
                State::DotCr => {
                    if data[0] == b'\n' {
                        self.state = State::Complete;
                    } else {
                        self.push(b"\r");
                        self.state = State::InLine;
                    }
                }
            }
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.bytes += data.len();
        self.lines += memchr::memchr_iter(b'\n', data).count();
        self.buffer.extend_from_slice(data);
    }

    /// Take the accumulated bytes. Held back bytes of an unfinished
    /// line that turned out not to be the end marker are kept.
    pub fn finish(&mut self) -> Bytes {
        match self.state {
            State::DotCr => self.push(b"\r"),
            State::Dot | State::LineStart | State::InLine | State::Complete => {}
        }
        self.state = State::Complete;
        std::mem::take(&mut self.buffer).freeze()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn accumulate(chunks: &[&[u8]], dot_stuffed: bool) -> (Bytes, bool, usize) {
        let mut acc = ByteAccumulator::new(dot_stuffed);
        for chunk in chunks {
            acc.add_data(chunk);
        }
        let complete = acc.is_complete();
        let lines = acc.lines();
        (acc.finish(), complete, lines)
    }

    #[test]
    fn plain_data_is_kept_verbatim() {
        let (data, complete, lines) =
            accumulate(&[b"Subject: hi\r\n", b"\r\n", b".\r\n", b"after"], false);
        assert_eq!(data.as_ref(), b"Subject: hi\r\n\r\n.\r\nafter");
        assert!(!complete);
        k9::assert_equal!(lines, 3);
    }

    #[test]
    fn dot_unstuffing() {
        let (data, complete, lines) = accumulate(
            &[b"Subject: hi\r\n\r\n", b"..leading dot\r\n", b"...\r\n", b".\r\n"],
            true,
        );
        assert_eq!(
            data.as_ref(),
            b"Subject: hi\r\n\r\n.leading dot\r\n..\r\n"
        );
        assert!(complete);
        k9::assert_equal!(lines, 4);
    }

    #[test]
    fn marker_split_across_chunks() {
        let message: &[u8] = b"a\r\n..b\r\nc.\r\n.\r\nignored\r\n";
        let expected: &[u8] = b"a\r\n.b\r\nc.\r\n";
        for split in 0..message.len() {
            let (head, tail) = message.split_at(split);
            let (data, complete, _) = accumulate(&[head, tail], true);
            assert_eq!(data.as_ref(), expected, "split at {split}");
            assert!(complete, "split at {split}");
        }

        let bytewise: Vec<&[u8]> = message.chunks(1).collect();
        let (data, complete, _) = accumulate(&bytewise, true);
        assert_eq!(data.as_ref(), expected);
        assert!(complete);
    }

    #[test]
    fn lf_marker_and_unterminated_input() {
        let (data, complete, _) = accumulate(&[b"x\n.\n"], true);
        assert_eq!(data.as_ref(), b"x\n");
        assert!(complete);

        let (data, complete, _) = accumulate(&[b"x\r\n.\r"], true);
        assert_eq!(data.as_ref(), b"x\r\n\r");
        assert!(!complete);

        let (data, complete, _) = accumulate(&[b".\rz\r\n"], true);
        assert_eq!(data.as_ref(), b"\rz\r\n");
        assert!(!complete);
    }
}
