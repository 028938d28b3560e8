use thiserror::Error;

/// Closed error taxonomy for the flashing engine.
///
/// Every fatal condition the engine can hit maps to exactly one variant;
/// see DESIGN.md for the policy attached to each kind.
#[derive(Debug, Error)]
pub enum Error {
    #[error("serial read timed out")]
    Timeout,

    #[error("invalid SLIP escape sequence")]
    InvalidEscape,

    #[error("bad response: op={op:#06x} error={error:#04x}")]
    BadResponse { op: u16, error: u8 },

    #[error("no supported board variant responded to the ISP greeting")]
    UnsupportedBoard,

    #[error("unsupported .kfpkg flash-list.json version: {0}")]
    UnsupportedPackage(String),

    #[error("{0}")]
    BadInput(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod timeout {
    pub trait ErrorExt {
        fn is_timeout(&self) -> bool;
    }
}

impl timeout::ErrorExt for Error {
    fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(err) => err.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

impl<T> timeout::ErrorExt for Result<T> {
    fn is_timeout(&self) -> bool {
        self.as_ref().err().map_or(false, |err| err.is_timeout())
    }
}
