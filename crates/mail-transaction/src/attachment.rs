use bytes::{Bytes, BytesMut};
use mailbody::PartPointer;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{channel, unbounded_channel, Receiver, Sender, UnboundedReceiver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The next contiguous piece of the decoded attachment
    Data(Bytes),
    /// The attachment is complete; nothing follows
    End,
}

/// What is known about an attachment before its content is read
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentInfo {
    /// The lowercased media type
    pub content_type: String,
    pub filename: Option<String>,
    pub charset: Option<String>,
    /// The decoded size in bytes
    pub size: usize,
    /// Where the part sits in the message
    pub part: PartPointer,
}

/// Receives each attachment of a message as a stream of its
/// decoded content
pub trait AttachmentHook: Send + Sync {
    fn on_attachment(&self, info: AttachmentInfo, stream: AttachmentStream);
}

impl<F> AttachmentHook for F
where
    F: Fn(AttachmentInfo, AttachmentStream) + Send + Sync,
{
    fn on_attachment(&self, info: AttachmentInfo, stream: AttachmentStream) {
        (self)(info, stream)
    }
}

/// Counts the attachment streams that are still being consumed.
/// `wait` resolves once every stream created from it has been
/// read to exhaustion or dropped.
#[derive(Debug)]
pub struct CompletionBarrier {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for CompletionBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionBarrier {
    pub fn new() -> Self {
        let (tx, rx) = channel(1);
        Self { tx, rx }
    }

    fn guard(&self) -> Sender<()> {
        self.tx.clone()
    }

    pub async fn wait(self) {
        let Self { tx, mut rx } = self;
        drop(tx);
        // Nothing is ever sent; this returns None once the last
        // outstanding guard is dropped
        let _ = rx.recv().await;
    }
}

/// The consumer side of an attachment.
/// Every event is buffered before the stream is handed out, so a
/// consumer may read it at its own pace, synchronously or not.
#[derive(Debug)]
pub struct AttachmentStream {
    rx: UnboundedReceiver<StreamEvent>,
    guard: Option<Sender<()>>,
}

impl AttachmentStream {
    /// Split data into chunk_size slices that share its storage,
    /// producing at least one Data event followed by End
    pub fn new(data: Bytes, chunk_size: usize, barrier: &CompletionBarrier) -> Self {
        let (tx, rx) = unbounded_channel();
        let chunk_size = chunk_size.max(1);

        let mut offset = 0;
        loop {
            let end = (offset + chunk_size).min(data.len());
            // The receiver is alive here, so the send cannot fail
            let _ = tx.send(StreamEvent::Data(data.slice(offset..end)));
            offset = end;
            if offset >= data.len() {
                break;
            }
        }
        let _ = tx.send(StreamEvent::End);

        Self {
            rx,
            guard: Some(barrier.guard()),
        }
    }

    /// Wait for the next event. Returns None after End has been
    /// delivered.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        let event = self.rx.recv().await;
        if event.is_none() {
            self.guard.take();
        }
        event
    }

    /// Take the next event if it is already available
    pub fn try_next(&mut self) -> Option<StreamEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Disconnected) => {
                self.guard.take();
                None
            }
            Err(TryRecvError::Empty) => None,
        }
    }

    /// Read the remainder of the stream into a single buffer
    pub async fn collect(&mut self) -> Bytes {
        let mut buf = BytesMut::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Data(data) => buf.extend_from_slice(&data),
                StreamEvent::End => {}
            }
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn drain(stream: &mut AttachmentStream) -> Vec<StreamEvent> {
        let mut events = vec![];
        while let Some(event) = stream.try_next() {
            events.push(event);
        }
        events
    }

    #[test]
    fn chunking() {
        let barrier = CompletionBarrier::new();
        let data = Bytes::from_static(b"0123456789");
        let mut stream = AttachmentStream::new(data.clone(), 4, &barrier);
        k9::assert_equal!(
            drain(&mut stream),
            vec![
                StreamEvent::Data(Bytes::from_static(b"0123")),
                StreamEvent::Data(Bytes::from_static(b"4567")),
                StreamEvent::Data(Bytes::from_static(b"89")),
                StreamEvent::End,
            ]
        );
        assert!(stream.guard.is_none());
    }

    #[test]
    fn empty_attachment_has_one_data_event() {
        let barrier = CompletionBarrier::new();
        let mut stream = AttachmentStream::new(Bytes::new(), 4, &barrier);
        k9::assert_equal!(
            drain(&mut stream),
            vec![StreamEvent::Data(Bytes::new()), StreamEvent::End]
        );
    }

    #[test]
    fn chunks_share_storage() {
        let barrier = CompletionBarrier::new();
        let data = Bytes::from(vec![b'x'; 100]);
        let mut stream = AttachmentStream::new(data.clone(), 64, &barrier);
        match stream.try_next() {
            Some(StreamEvent::Data(chunk)) => {
                k9::assert_equal!(chunk.as_ptr(), data.as_ptr());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn barrier_waits_for_consumers() {
        let barrier = CompletionBarrier::new();
        let mut streams: Vec<AttachmentStream> = (0u8..3)
            .map(|i| AttachmentStream::new(Bytes::from(vec![i; 10]), 3, &barrier))
            .collect();

        let dropped = streams.pop().unwrap();
        drop(dropped);

        let consumers: Vec<_> = streams
            .into_iter()
            .map(|mut stream| {
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    stream.collect().await
                })
            })
            .collect();

        barrier.wait().await;

        for consumer in consumers {
            k9::assert_equal!(consumer.await.unwrap().len(), 10);
        }
    }
}
