//! Error types for svcpool.

use crate::wire::ServiceTag;

/// Service registration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The tag is outside the registry's fixed range.
    TagOutOfRange(ServiceTag),
    /// Another service already occupies this tag.
    TagInUse(ServiceTag),
    /// A zero concurrency limit could never admit a request.
    ZeroConcurrency(ServiceTag),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::TagOutOfRange(tag) => write!(f, "service tag {} out of range", tag),
            Error::TagInUse(tag) => write!(f, "service tag {} already registered", tag),
            Error::ZeroConcurrency(tag) => {
                write!(f, "service tag {} registered with zero concurrency", tag)
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for svcpool operations.
pub type Result<T> = std::result::Result<T, Error>;
