use std::{fmt::Display, io, num::NonZeroU32};

/// Error returned synchronously from `usb-async` operations.
///
/// Allocation of transfers and buffers, and cancellation requests, report
/// failure through this type. The outcome of a submitted transfer is reported
/// through its [`Completion`][crate::Completion] instead.
#[derive(Debug, Clone)]
pub struct Error {
    pub(crate) kind: ErrorKind,
    pub(crate) code: Option<NonZeroU32>,
    pub(crate) message: &'static str,
}

impl Error {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self {
            kind,
            code: None,
            message,
        }
    }

    /// Create an error carrying a native error code.
    ///
    /// A code of zero is treated as absent.
    pub fn with_code(kind: ErrorKind, code: u32, message: &'static str) -> Self {
        Self {
            kind,
            code: NonZeroU32::new(code),
            message,
        }
    }

    #[track_caller]
    pub(crate) fn log_error(self) -> Self {
        log::error!("{}", self);
        self
    }

    #[track_caller]
    pub(crate) fn log_debug(self) -> Self {
        log::debug!("{}", self);
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error code from the native layer, if applicable.
    ///
    /// On Linux this is the `errno` value.
    pub fn os_error(&self) -> Option<u32> {
        self.code.map(|c| c.get())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.code {
            write!(f, " (error {})", code.get())?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err.kind {
            ErrorKind::Disconnected => io::ErrorKind::NotConnected,
            ErrorKind::Busy => io::ErrorKind::Other, // TODO: ResourceBusy once MSRV allows
            ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::InvalidArgument => io::ErrorKind::InvalidInput,
            ErrorKind::OutOfMemory => io::ErrorKind::OutOfMemory,
            ErrorKind::Unsupported => io::ErrorKind::Unsupported,
            ErrorKind::Other => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// General category of error as part of an [`Error`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Device is disconnected.
    Disconnected,

    /// Device, interface, or endpoint is in use by another application, kernel driver, or handle.
    Busy,

    /// This user or application does not have permission to perform the requested operation.
    PermissionDenied,

    /// The transfer is not in flight, e.g. when cancelling a transfer that already completed.
    NotFound,

    /// The native layer rejected a parameter of the request.
    InvalidArgument,

    /// A transfer or buffer could not be allocated.
    OutOfMemory,

    /// The requested operation is not supported by the native layer.
    Unsupported,

    /// Uncategorized error.
    Other,
}

/// Transfer error.
///
/// Reported in the `status` of a [`Completion`][crate::Completion] when the
/// transfer did not complete successfully, including when the native layer
/// rejected the submission.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Transfer was cancelled.
    Cancelled,

    /// Endpoint in a STALL condition.
    ///
    /// This is used by the device to signal that an error occurred. For bulk
    /// and interrupt endpoints, the stall condition must be cleared before
    /// further transfers can succeed. For control endpoints, the stall is
    /// cleared automatically on the next SETUP packet.
    Stall,

    /// Device disconnected.
    Disconnected,

    /// Hardware issue or protocol violation.
    Fault,

    /// The transfer did not complete before its timeout expired.
    Timeout,

    /// The device sent more data than requested.
    Overflow,

    /// The request has an invalid argument or is not supported by this OS.
    InvalidArgument,

    /// Unknown or OS-specific error.
    ///
    /// It won't be considered a breaking change to map unhandled errors from
    /// `Unknown` to one of the above variants. If you are matching on the
    /// OS error code, make sure to also handle the corresponding variant.
    Unknown(u32),
}

impl Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Cancelled => write!(f, "transfer was cancelled"),
            TransferError::Stall => write!(f, "endpoint stalled"),
            TransferError::Disconnected => write!(f, "device disconnected"),
            TransferError::Fault => write!(f, "hardware fault or protocol violation"),
            TransferError::Timeout => write!(f, "transfer timed out"),
            TransferError::Overflow => write!(f, "device sent more data than requested"),
            TransferError::InvalidArgument => write!(f, "invalid or unsupported argument"),
            TransferError::Unknown(e) => write!(f, "unknown error (error {e})"),
        }
    }
}

impl std::error::Error for TransferError {}

/// A submission rejected by the native layer completes with the
/// corresponding `TransferError`.
impl From<Error> for TransferError {
    fn from(err: Error) -> Self {
        match err.kind {
            ErrorKind::Disconnected => TransferError::Disconnected,
            ErrorKind::InvalidArgument | ErrorKind::Unsupported => TransferError::InvalidArgument,
            _ => TransferError::Unknown(err.os_error().unwrap_or(0)),
        }
    }
}

impl From<TransferError> for io::Error {
    fn from(value: TransferError) -> Self {
        match value {
            TransferError::Cancelled => io::Error::new(io::ErrorKind::Interrupted, value),
            TransferError::Stall => io::Error::new(io::ErrorKind::ConnectionReset, value),
            TransferError::Disconnected => io::Error::new(io::ErrorKind::ConnectionAborted, value),
            TransferError::Fault => io::Error::other(value),
            TransferError::Timeout => io::Error::new(io::ErrorKind::TimedOut, value),
            TransferError::Overflow => io::Error::new(io::ErrorKind::InvalidData, value),
            TransferError::InvalidArgument => io::Error::new(io::ErrorKind::InvalidInput, value),
            TransferError::Unknown(_) => io::Error::other(value),
        }
    }
}
