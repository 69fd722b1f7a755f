use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MailBodyError {
    #[error("invalid header: {0}")]
    HeaderParse(String),
    #[error("failed to decode body: {0}")]
    BodyParse(String),
    #[error("invalid Content-Transfer-Encoding: {0}")]
    InvalidContentTransferEncoding(String),
    #[error("error writing message")]
    WriteMessageIOError,
}
