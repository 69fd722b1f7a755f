use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransactionError {
    #[error("add_data called after end_data")]
    DataAfterEnd,
    #[error("end_data has already been called")]
    AlreadyEnded,
    #[error("an attachment hook is already registered")]
    DuplicateAttachmentHook,
    #[error("{0} cannot be registered after end_data")]
    RegistrationAfterEnd(&'static str),
}

pub type Result<T> = std::result::Result<T, TransactionError>;
