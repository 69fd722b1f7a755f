use bytes::Bytes;

/// The finished, serialized message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageStream {
    data: Bytes,
}

impl MessageStream {
    pub(crate) fn new(data: Bytes) -> Self {
        Self { data }
    }

    /// The complete message bytes
    pub fn get_data(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy the message into out
    pub fn write_to<W: std::io::Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(&self.data)
    }
}
