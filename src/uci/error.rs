use core::fmt::{self, Display, Formatter};

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::Status;

/// An error that can occur while framing, dispatching or sending messages
pub enum Error {
    /// The allocator is exhausted or the TX queue is full
    NoMemory,

    /// A transport is already attached, or the resource is held by someone
    /// else
    Busy,

    /// An argument is not acceptable, for example detaching while no
    /// transport is attached
    InvalidArgument,

    /// The configuration was not valid
    InvalidConfiguration,

    /// A packet header or payload could not be decoded
    Frame(byte::Error),

    /// The payload is larger than allowed for its message type
    PayloadTooLarge {
        /// Announced payload length
        len: usize,
        /// Limit for the message type
        max: usize,
    },

    /// The packet length does not match the length in its header
    LengthMismatch {
        /// Length announced in the header
        expected: usize,
        /// Length actually received
        actual: usize,
    },

    /// A segment does not belong to the message being reassembled
    SegmentMismatch,

    /// A data segment names another session than the first segment
    SessionMismatch,

    /// The application data of a data message does not add up
    DataLengthMismatch,

    /// The transport could not move a packet
    Transport,

    /// The operation failed with a UCI status to report on the wire
    Status(Status),
}

impl Error {
    /// Status to put in the response of a command that failed with this error
    pub fn status(&self) -> Status {
        match self {
            Error::Status(status) => *status,
            Error::Frame(_) | Error::SegmentMismatch | Error::SessionMismatch => {
                Status::SYNTAX_ERROR
            }
            Error::PayloadTooLarge { .. }
            | Error::LengthMismatch { .. }
            | Error::DataLengthMismatch => Status::INVALID_MESSAGE_SIZE,
            Error::NoMemory
            | Error::Busy
            | Error::InvalidArgument
            | Error::InvalidConfiguration
            | Error::Transport => Status::FAILED,
        }
    }
}

impl From<byte::Error> for Error {
    fn from(error: byte::Error) -> Self {
        Error::Frame(error)
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Status(status)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

// `byte::Error` carries no `Format` implementation, so this can't be derived.
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NoMemory => write!(f, "NoMemory"),
            Error::Busy => write!(f, "Busy"),
            Error::InvalidArgument => write!(f, "InvalidArgument"),
            Error::InvalidConfiguration => write!(f, "InvalidConfiguration"),
            Error::Frame(error) => write!(f, "Frame({:?})", error),
            Error::PayloadTooLarge { len, max } => {
                write!(f, "PayloadTooLarge {{ len: {:?}, max: {:?} }}", len, max)
            }
            Error::LengthMismatch { expected, actual } => write!(
                f,
                "LengthMismatch {{ expected: {:?}, actual: {:?} }}",
                expected, actual,
            ),
            Error::SegmentMismatch => write!(f, "SegmentMismatch"),
            Error::SessionMismatch => write!(f, "SessionMismatch"),
            Error::DataLengthMismatch => write!(f, "DataLengthMismatch"),
            Error::Transport => write!(f, "Transport"),
            Error::Status(status) => write!(f, "Status({:?})", status),
        }
    }
}

#[cfg(feature = "defmt")]
impl Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::NoMemory => defmt::write!(f, "NoMemory"),
            Error::Busy => defmt::write!(f, "Busy"),
            Error::InvalidArgument => defmt::write!(f, "InvalidArgument"),
            Error::InvalidConfiguration => defmt::write!(f, "InvalidConfiguration"),
            Error::Frame(error) => defmt::write!(f, "Frame({:?})", defmt::Debug2Format(error)),
            Error::PayloadTooLarge { len, max } => {
                defmt::write!(f, "PayloadTooLarge {{ len: {:?}, max: {:?} }}", len, max)
            }
            Error::LengthMismatch { expected, actual } => defmt::write!(
                f,
                "LengthMismatch {{ expected: {:?}, actual: {:?} }}",
                expected,
                actual,
            ),
            Error::SegmentMismatch => defmt::write!(f, "SegmentMismatch"),
            Error::SessionMismatch => defmt::write!(f, "SessionMismatch"),
            Error::DataLengthMismatch => defmt::write!(f, "DataLengthMismatch"),
            Error::Transport => defmt::write!(f, "Transport"),
            Error::Status(status) => defmt::write!(f, "Status({:?})", status),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errors_map_to_wire_status() {
        assert_eq!(Error::Status(Status::REJECTED).status(), Status::REJECTED);
        assert_eq!(
            Error::Frame(byte::Error::Incomplete).status(),
            Status::SYNTAX_ERROR
        );
        assert_eq!(
            Error::LengthMismatch {
                expected: 4,
                actual: 3
            }
            .status(),
            Status::INVALID_MESSAGE_SIZE
        );
        assert_eq!(Error::NoMemory.status(), Status::FAILED);
    }

    #[cfg(feature = "defmt")]
    #[test]
    fn test_defmt() {
        let error = Error::PayloadTooLarge { len: 300, max: 255 };

        defmt::info!("error: {:?}", error);
    }
}
