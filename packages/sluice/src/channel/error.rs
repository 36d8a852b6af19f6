//! Channel error types.
//!
//! Closing is the only failure a channel can inflict on an operation, and only puts surface it
//! as an error; a take on a closed, drained channel resolves to `None` instead. The remaining
//! types report the `try` and timeout flavors of the blocking adjuncts giving up.
//!
//! Types carrying the undelivered message implement `Debug` by hand, without the payload, so
//! they stay printable for any message type.

use std::fmt::{self, Debug, Formatter};
use thiserror::Error;

/// Error returned by a put whose channel closed before delivery.
#[derive(Error, Copy, Clone, Eq, PartialEq)]
#[error("channel closed")]
pub struct PutError<T> {
    /// The message that was not delivered.
    pub msg: T,
}

impl<T> Debug for PutError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.pad("PutError(..)")
    }
}

/// Why a non-blocking put failed.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TryPutCause {
    /// The channel is closed.
    #[error("channel closed")]
    Closed,
    /// The put would have parked.
    #[error("channel full")]
    Full,
}

/// Error returned by a put that could not complete immediately.
#[derive(Error, Copy, Clone, Eq, PartialEq)]
#[error("{cause}")]
pub struct TryPutError<T> {
    /// The message that was not delivered.
    pub msg: T,
    /// Why the put failed.
    pub cause: TryPutCause,
}

impl<T> Debug for TryPutError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("TryPutError")
            .field("cause", &self.cause)
            .finish_non_exhaustive()
    }
}

impl<T> From<PutError<T>> for TryPutError<T> {
    fn from(e: PutError<T>) -> Self {
        TryPutError {
            msg: e.msg,
            cause: TryPutCause::Closed,
        }
    }
}

/// Error returned by a blocking put that gave up at its deadline.
#[derive(Error, Copy, Clone, Eq, PartialEq)]
pub enum PutTimeoutError<T> {
    /// The channel closed before delivery.
    #[error("channel closed")]
    Closed {
        /// The message that was not delivered.
        msg: T,
    },
    /// The deadline passed before the put could complete.
    #[error("put timed out")]
    TimedOut {
        /// The message that was not delivered.
        msg: T,
    },
}

impl<T> PutTimeoutError<T> {
    /// The undelivered message, whichever way the put failed.
    pub fn into_msg(self) -> T {
        match self {
            Self::Closed { msg } | Self::TimedOut { msg } => msg,
        }
    }
}

impl<T> Debug for PutTimeoutError<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Closed { .. } => f.pad("PutTimeoutError::Closed(..)"),
            Self::TimedOut { .. } => f.pad("PutTimeoutError::TimedOut(..)"),
        }
    }
}

impl<T> From<PutError<T>> for PutTimeoutError<T> {
    fn from(e: PutError<T>) -> Self {
        PutTimeoutError::Closed { msg: e.msg }
    }
}

/// Error returned by a take that could not complete immediately.
///
/// Only an open, empty channel produces this; a closed and drained channel resolves to
/// `Ok(None)` instead.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[error("channel empty and not closed")]
pub struct TryTakeError;

/// Error returned by a blocking take that gave up at its deadline.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[error("take timed out")]
pub struct TakeTimeoutError;
