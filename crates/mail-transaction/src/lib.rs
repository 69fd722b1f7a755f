//! Drives a message through body filters, banners and attachment
//! extraction as its data arrives.

mod accumulator;
mod attachment;
mod banner;
mod config;
mod error;
mod filter;
mod stream;
mod transaction;

pub use accumulator::ByteAccumulator;
pub use attachment::{
    AttachmentHook, AttachmentInfo, AttachmentStream, CompletionBarrier, StreamEvent,
};
pub use banner::{HtmlBanner, TextBanner};
pub use config::TransactionConfig;
pub use error::{Result, TransactionError};
pub use filter::{BodyFilter, ContentTypeMatch, FilterRegistry, FilterScope};
pub use stream::MessageStream;
pub use transaction::Transaction;

pub fn create_transaction() -> Transaction {
    Transaction::new()
}
