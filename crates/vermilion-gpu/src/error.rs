use thiserror::Error;

/// Error taxonomy for the device core.
///
/// Parameter and state errors are returned synchronously and never retried by
/// the core. [`Error::Timeout`] is recoverable; callers may retry or treat it
/// as a liveness failure. Fatal hardware conditions are never surfaced to the
/// in-flight caller that happened to trip them — they schedule a deferred
/// device-wide teardown, after which every waiter and submitter observes
/// [`Error::Destroyed`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("bad parameter")]
    BadParameter,
    #[error("object not initialized")]
    NotInitialized,
    #[error("object already initialized")]
    AlreadyInitialized,
    #[error("no more available")]
    NoMoreAvailable,
    #[error("wait timed out")]
    Timeout,
    #[error("underlying system operation failed")]
    SystemError,
    #[error("fatal hardware error")]
    FatalHardware,
    #[error("device destroyed")]
    Destroyed,
}

pub type Result<T> = std::result::Result<T, Error>;
