mod conformance;
mod encoding;
mod error;
mod header;
mod headermap;
mod mimepart;
mod nom_utils;
mod normalize;
mod params;
mod reassemble;

pub use error::MailBodyError;
pub type Result<T> = std::result::Result<T, MailBodyError>;

pub use conformance::Conformance;
pub use encoding::*;
pub use header::{Header, HeaderParseResult};
pub use headermap::*;
pub use mimepart::*;
pub use normalize::{has_lone_cr_or_lf, normalize_crlf, LineEnding};
pub use params::{decode_encoded_words, MimeParameters};
