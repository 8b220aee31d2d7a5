use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for counter programming and hardware access.
///
/// Backend operations report structured failures one level up; the engine
/// classifies them into these variants. `HardwareAbsent` is informational
/// (a probe found nothing) and never aborts a whole programming operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("access to {0} denied: insufficient privileges")]
    AccessDenied(&'static str),

    #[error("the PMU is held by another client")]
    Busy,

    #[error("unsupported processor (family {family:#x}, model {model:#x})")]
    UnsupportedProcessor { family: u32, model: u32 },

    #[error("hardware absent: {0}")]
    HardwareAbsent(&'static str),

    #[error("transient I/O failure after retries")]
    TransientIo(#[source] io::Error),

    #[error("invariant violated: {0}")]
    Invariant(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("not supported on this platform: {0}")]
    Unsupported(&'static str),
}

/// Coarse return codes kept for clients that only need the classic
/// success/denied/busy distinction of `program`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    MsrAccessDenied,
    PmuBusy,
    UnknownError,
}

impl Error {
    /// Maps an error onto the coarse code surface.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::AccessDenied(_) => ErrorCode::MsrAccessDenied,
            Error::Busy => ErrorCode::PmuBusy,
            Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                ErrorCode::MsrAccessDenied
            }
            _ => ErrorCode::UnknownError,
        }
    }

    /// Classifies a raw I/O error from a backend into the taxonomy.
    pub(crate) fn from_backend(what: &'static str, e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::PermissionDenied => Error::AccessDenied(what),
            io::ErrorKind::NotFound => Error::HardwareAbsent(what),
            io::ErrorKind::Interrupted => Error::TransientIo(e),
            _ => Error::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_errors_map_to_msr_access_denied() {
        let e = Error::from_backend(
            "/dev/cpu/0/msr",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(e, Error::AccessDenied(_)));
        assert_eq!(e.code(), ErrorCode::MsrAccessDenied);
    }

    #[test]
    fn missing_devices_are_absent_not_fatal() {
        let e = Error::from_backend("pci 0:0:10.2", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(e, Error::HardwareAbsent(_)));
        assert_eq!(e.code(), ErrorCode::UnknownError);
    }
}
