use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::{CommandFrame, OwnerId};

/// This enum contains all error messages this library can return. Most fallible API functions return a [`Result<(), CommandFrameError>`].
///
/// The per-frame loop itself never fails: stale writes, lost packets and
/// resyncs are handled in place and surfaced through [`crate::telemetry`].
///
/// [`Result<(), CommandFrameError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandFrameError {
    /// A configuration value is out of range.
    InvalidConfig {
        /// Further specifies which value was rejected.
        info: String,
    },
    /// An invalid frame number was provided.
    InvalidFrame {
        /// The frame that was invalid.
        frame: CommandFrame,
        /// A description of why the frame was invalid.
        reason: String,
    },
    /// A packet could not be encoded or decoded.
    Serialization {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// No channel is registered for the given owner.
    UnknownChannel {
        /// The owner that was looked up.
        owner: OwnerId,
    },
    /// The manager cannot run fixed frames yet, e.g. a client without a local owner.
    NotPrepared {
        /// Why the manager is not prepared.
        reason: String,
    },
    /// An internal error occurred that should not happen under normal operation.
    /// If you encounter this error, please report it as a bug.
    InternalError {
        /// A description of the internal error.
        context: String,
    },
}

impl Display for CommandFrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandFrameError::InvalidConfig { info } => {
                write!(f, "Invalid configuration: {}", info)
            }
            CommandFrameError::InvalidFrame { frame, reason } => {
                write!(f, "Invalid command frame {}: {}", frame, reason)
            }
            CommandFrameError::Serialization { context } => {
                write!(f, "Serialization error: {}", context)
            }
            CommandFrameError::UnknownChannel { owner } => {
                write!(f, "No net channel registered for owner {}", owner)
            }
            CommandFrameError::NotPrepared { reason } => {
                write!(f, "Command frame manager is not prepared: {}", reason)
            }
            CommandFrameError::InternalError { context } => {
                write!(f, "Internal error (please report as bug): {}", context)
            }
        }
    }
}

impl Error for CommandFrameError {}

impl From<CodecError> for CommandFrameError {
    fn from(err: CodecError) -> Self {
        CommandFrameError::Serialization {
            context: err.to_string(),
        }
    }
}
