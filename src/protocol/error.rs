//! Error types and wire error codes.

use enum_primitive_derive::Primitive;
use thiserror::Error;

use super::command::CommandTag;

/// A generic protocol error.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The peer's version is not supported by this library.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),
    /// A command other than what we were expecting was received.
    #[error("unexpected command: {0:?}")]
    UnexpectedCommand(CommandTag),
    /// The message is invalid.
    #[error("invalid message: {0}")]
    Invalid(String),
    /// An I/O error occurred, such as an unexpected EOF while reading a
    /// tagstruct.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The command is not implemented by this library.
    #[error("unimplemented command: {0:?}")]
    Unimplemented(CommandTag),
    /// An error code from a remote server.
    #[error("server error: {0:?}")]
    ServerError(ErrorCode),
    /// A pending reply timed out.
    #[error("timeout waiting for reply")]
    Timeout,
}

/// An error code understood by the wire protocol.
///
/// Sent to clients in error replies; each value is stable.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum ErrorCode {
    /// Access failure
    AccessDenied = 1,
    /// Unknown command
    Command = 2,
    /// Invalid argument
    Invalid = 3,
    /// Entity exists
    Exist = 4,
    /// No such entity
    NoEntity = 5,
    /// Connection refused
    ConnectionRefused = 6,
    /// Protocol error
    Protocol = 7,
    /// Timeout
    Timeout = 8,
    /// No authentication key
    AuthKey = 9,
    /// Internal error
    Internal = 10,
    /// Connection terminated
    ConnectionTerminated = 11,
    /// Entity killed
    Killed = 12,
    /// Invalid server address
    InvalidServer = 13,
    /// Module initialization failed
    ModInitFailed = 14,
    /// Bad state
    BadState = 15,
    /// No data
    NoData = 16,
    /// Incompatible protocol version
    Version = 17,
    /// Data too large
    TooLarge = 18,
    /// Operation not supported
    NotSupported = 19,
    /// The error code was unknown to the peer
    Unknown = 20,
    /// Extension does not exist
    NoExtension = 21,
    /// Obsolete functionality
    Obsolete = 22,
    /// Missing implementation
    NotImplemented = 23,
    /// The caller forked and tried to reuse the connection
    Forked = 24,
    /// An I/O error happened
    Io = 25,
    /// Device or resource busy
    Busy = 26,
}
