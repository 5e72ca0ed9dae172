use callprof_trace::{DecodeError, EncodeError, TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed snapshot: {0}")]
    Decode(#[from] DecodeError),

    #[error("Cannot encode snapshot: {0}")]
    Encode(#[from] EncodeError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not a callprof profile: {0}")]
    NotAProfile(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGUMENTS: i32 = 2;
    pub const HANDSHAKE_FAILED: i32 = 3;
    pub const DATABASE_ERROR: i32 = 6;
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Handshake(_) => exit_code::HANDSHAKE_FAILED,
            Error::Database(_) | Error::NotAProfile(_) => exit_code::DATABASE_ERROR,
            Error::InvalidArgument(_) => exit_code::INVALID_ARGUMENTS,
            _ => exit_code::GENERAL_ERROR,
        }
    }
}
