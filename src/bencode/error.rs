use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),

    #[error("invalid integer")]
    InvalidInteger,

    #[error("invalid byte string length")]
    InvalidLength,

    #[error("dictionary key is not a byte string")]
    NonStringKey,

    #[error("nesting too deep")]
    NestingTooDeep,

    #[error("trailing data after value")]
    TrailingData,
}
