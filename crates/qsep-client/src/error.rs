//! Error types for the client library.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::protocol::Opcode;

/// Client error type.
///
/// None of these are retried internally. A failed cursor leaves the server
/// side in an undefined position, so the caller decides whether to reconnect.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The peer closed the connection mid-read or mid-write.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection establishment timed out.
    #[error("connection timeout after {0}ms")]
    ConnectionTimeout(u64),

    /// Any other I/O failure.
    #[error("io error: {0}")]
    Io(io::Error),

    /// Malformed data on the wire (bad length prefix, negative count, ...).
    #[error("protocol error{}: {message}", during(.opcode))]
    Protocol {
        /// Command whose response was malformed, when known.
        opcode: Option<Opcode>,
        /// What was wrong.
        message: String,
    },

    /// A status code that is not valid at this point of the exchange.
    #[error("unexpected status from {opcode}: expected {expected}, received {received}")]
    UnexpectedStatus {
        /// Command whose response carried the status.
        opcode: Opcode,
        /// Human readable description of the accepted statuses.
        expected: &'static str,
        /// Status actually received.
        received: i32,
    },

    /// A row count that does not match the command's contract.
    #[error("unexpected count from {opcode}: expected {expected}, received {received}")]
    UnexpectedCount {
        /// Command whose response carried the count.
        opcode: Opcode,
        /// Expected count.
        expected: i32,
        /// Count actually received.
        received: i32,
    },

    /// The server returned a non-zero error code.
    #[error("server error from {opcode}: code {code}")]
    Server {
        /// Command that failed.
        opcode: Opcode,
        /// Error code reported by the server.
        code: i32,
    },

    /// A column declared a type tag outside integer/string/double.
    #[error("unsupported field type tag {tag} for column {column:?}")]
    UnsupportedFieldType {
        /// Column name.
        column: String,
        /// Raw type tag.
        tag: i32,
    },

    /// The table has neither an ID column nor an integer column to sort by.
    #[error("table {table} has no sortable integer column")]
    NoSortableColumn {
        /// Raw table index.
        table: i32,
    },

    /// A row buffer shorter than the table's fixed footprint.
    #[error("truncated row: expected at least {expected} bytes, got {actual}")]
    TruncatedRow {
        /// Minimum number of bytes.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The greeting strings could not be read.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Operation attempted outside its required state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// What the caller tried to do.
        operation: &'static str,
        /// State the component was in.
        state: String,
    },

    /// No column with this name.
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    /// No table with this name.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn during(opcode: &Option<Opcode>) -> String {
    opcode.map(|op| format!(" in {}", op)).unwrap_or_default()
}

impl ClientError {
    /// Creates a `Protocol` error.
    pub fn protocol(opcode: Option<Opcode>, message: impl Into<String>) -> Self {
        Self::Protocol {
            opcode,
            message: message.into(),
        }
    }

    /// Creates an `InvalidState` error.
    pub fn invalid_state(operation: &'static str, state: impl fmt::Display) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Returns true if the error came from the connection itself.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::ConnectionFailed(_)
                | Self::ConnectionTimeout(_)
                | Self::Io(_)
        )
    }

    /// Returns true for responses that do not follow the protocol.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::UnexpectedStatus { .. } | Self::UnexpectedCount { .. }
        )
    }

    /// Returns true if the session can no longer be used for cursor work.
    pub fn is_fatal_to_session(&self) -> bool {
        self.is_connection_error() || self.is_protocol_error() || matches!(self, Self::Handshake(_))
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Self::ConnectionClosed,
            _ => Self::Io(err),
        }
    }
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Greeting read, no transaction yet.
    Connected,
    /// Transaction created and active.
    InTransaction,
    /// A response was abandoned part way through; the stream can no longer
    /// be framed.
    Poisoned,
    /// Quit sent or connection lost.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::InTransaction => write!(f, "in_transaction"),
            ConnectionState::Poisoned => write!(f, "poisoned"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}
