use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    #[error("Not enough space in page")]
    InsufficientSpace,
    #[error("Record in slot {0} not found")]
    RecordNotFound(u16),
    #[error("Invalid slot {0}")]
    InvalidRecordId(u16),
    #[error("Record of {0} bytes exceeds the page limit")]
    RecordTooLarge(usize),
    #[error("Unknown page type {0}")]
    InvalidPageType(u32),
    #[error("Page buffer has invalid length {0}")]
    InvalidLength(usize),
    #[error("Malformed page: {0}")]
    Malformed(String),
}
