//! Recoverable/fatal classification shared by every retrying loop

use std::io;

use crate::client::KinesisClientError;
use crate::error::{CheckpointError, ConsumerError};
use crate::lease::LeaseError;

/// Whether an error is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Recoverable,
    Fatal,
}

/// Implemented by error types that know their own retry class
pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }
}

/// AWS error codes that indicate throttling or a transient service fault
const RECOVERABLE_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "LimitExceededException",
    "ThrottlingException",
    "Throttling",
    "RequestLimitExceeded",
    "KMSThrottlingException",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "InternalFailure",
    "InternalFailureException",
    "InternalServerError",
    "ExpiredIteratorException",
];

/// Lowercase fragments of transient transport and service failures
const RECOVERABLE_MARKERS: &[&str] = &[
    "throttl",
    "rate exceeded",
    "throughput exceeded",
    "capacity exceeded",
    "service unavailable",
    "internal failure",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "timed out",
    "dispatch failure",
    "iterator expired",
];

pub fn classify_code(code: &str) -> ErrorClass {
    if RECOVERABLE_CODES.contains(&code) {
        ErrorClass::Recoverable
    } else {
        ErrorClass::Fatal
    }
}

pub fn classify_message(message: &str) -> ErrorClass {
    let lowered = message.to_ascii_lowercase();
    if RECOVERABLE_CODES.iter().any(|code| message.contains(code))
        || RECOVERABLE_MARKERS.iter().any(|marker| lowered.contains(marker))
    {
        ErrorClass::Recoverable
    } else {
        ErrorClass::Fatal
    }
}

fn classify_io(err: &io::Error) -> ErrorClass {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::UnexpectedEof => ErrorClass::Recoverable,
        _ => ErrorClass::Fatal,
    }
}

/// Classify an arbitrary error by walking its source chain.
///
/// Typed crate errors decide first. Otherwise I/O error kinds and well-known
/// AWS codes or messages mark the error recoverable, and anything else is
/// fatal.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<KinesisClientError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<LeaseError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<CheckpointError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<ConsumerError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<io::Error>() {
            if classify_io(e) == ErrorClass::Recoverable {
                return ErrorClass::Recoverable;
            }
        }
    }

    classify_message(&format!("{:#}", err))
}
