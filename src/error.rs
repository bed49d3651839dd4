use serde::{Deserialize, Serialize};

/// Result type shared by every layer of the core.
pub type Result<T> = core::result::Result<T, Error>;

/// Wire code reported for a successful operation.
pub const SUCCESS_CODE: u8 = 0;

/// Flat result enumeration shared by frames, channels, drivers, command
/// handlers and the platform manager. Success is `Ok(..)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum Error {
    #[error("operation timed out")]
    Timeout,
    #[error("resource busy")]
    Busy,
    #[error("illegal argument or state")]
    Illegal,
    #[error("insufficient space or data")]
    NoSpace,
    #[error("unspecified error")]
    Error,
    #[error("already exists")]
    Exist,
    #[error("no such entry")]
    NoEnt,
    #[error("permission denied")]
    Perm,
    #[error("operation partially completed")]
    Partial,
    #[error("negative acknowledgement")]
    Nack,
    #[error("operation not implemented")]
    NotImplemented,
}

impl Error {
    /// One-byte code used on the wire.
    pub fn code(self) -> u8 {
        match self {
            Error::Timeout => 1,
            Error::Busy => 2,
            Error::Illegal => 3,
            Error::NoSpace => 4,
            Error::Error => 5,
            Error::Exist => 6,
            Error::NoEnt => 7,
            Error::Perm => 8,
            Error::Partial => 9,
            Error::Nack => 10,
            Error::NotImplemented => 11,
        }
    }

    /// Decodes a wire code. `Ok(())` for [`SUCCESS_CODE`]; unknown codes
    /// collapse into `Error::Error`.
    pub fn from_code(code: u8) -> Result<()> {
        match code {
            SUCCESS_CODE => Ok(()),
            1 => Err(Error::Timeout),
            2 => Err(Error::Busy),
            3 => Err(Error::Illegal),
            4 => Err(Error::NoSpace),
            6 => Err(Error::Exist),
            7 => Err(Error::NoEnt),
            8 => Err(Error::Perm),
            9 => Err(Error::Partial),
            10 => Err(Error::Nack),
            11 => Err(Error::NotImplemented),
            _ => Err(Error::Error),
        }
    }
}

/// Wire code for the outcome of an operation.
pub fn result_code<T>(result: &Result<T>) -> u8 {
    match result {
        Ok(_) => SUCCESS_CODE,
        Err(e) => e.code(),
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let mapped = match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::Timeout,
            ErrorKind::NotFound => Error::NoEnt,
            ErrorKind::PermissionDenied => Error::Perm,
            ErrorKind::AlreadyExists => Error::Exist,
            ErrorKind::ConnectionRefused => Error::Nack,
            _ => Error::Error,
        };
        tracing::warn!("I/O failure mapped to {:?}: {}", mapped, err);
        mapped
    }
}
