//! QSEP wire constants.
//!
//! Every integer on the wire is a 32-bit signed little-endian value, and every
//! command is terminated by [`FLUSH`].

use std::fmt;

// =============================================================================
// Commands
// =============================================================================

/// Command code sent as the first integer of every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Opcode {
    /// End the connection. Response: status.
    Quit = 1,
    /// Terminator. Only ever sent as the trailing parameter of a command.
    Flush = 2,
    /// Response: error code, transaction handle.
    TransactionCreate = 3,
    /// Params: transaction handle. Response: error code.
    TransactionAccept = 5,
    /// Params: raw index, field list, transaction, sort keys. Response: error code, table handle.
    TableCreate = 7,
    /// Params: table handle. Response: error code.
    TableDestroy = 8,
    /// Params: table handle, status. Response: status.
    TableSetStatus = 10,
    /// Params: table handle, delta. Response: status, count.
    TableMoveBy = 16,
    /// Params: table handle, count. Response: per-row status and row bytes.
    TableMultiGetForward = 17,
    /// Params: table handle. Response: status, row bytes.
    TableGet = 19,
    /// Response: error code, count, (name, index) pairs.
    QueryAllTables = 20,
    /// Params: raw index. Response: error code, count, field definitions.
    QueryTableFields = 22,
}

impl Opcode {
    /// Converts the opcode to its wire value.
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Creates an opcode from its wire value.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Quit),
            2 => Some(Self::Flush),
            3 => Some(Self::TransactionCreate),
            5 => Some(Self::TransactionAccept),
            7 => Some(Self::TableCreate),
            8 => Some(Self::TableDestroy),
            10 => Some(Self::TableSetStatus),
            16 => Some(Self::TableMoveBy),
            17 => Some(Self::TableMultiGetForward),
            19 => Some(Self::TableGet),
            20 => Some(Self::QueryAllTables),
            22 => Some(Self::QueryTableFields),
            _ => None,
        }
    }

    /// Returns the command name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Quit => "Quit",
            Self::Flush => "Flush",
            Self::TransactionCreate => "TransactionCreate",
            Self::TransactionAccept => "TransactionAccept",
            Self::TableCreate => "TableCreate",
            Self::TableDestroy => "TableDestroy",
            Self::TableSetStatus => "TableSetStatus",
            Self::TableMoveBy => "TableMoveBy",
            Self::TableMultiGetForward => "TableMultiGetForward",
            Self::TableGet => "TableGet",
            Self::QueryAllTables => "QueryAllTables",
            Self::QueryTableFields => "QueryTableFields",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_i32())
    }
}

/// Trailing parameter that tells the server to process the buffered command.
pub const FLUSH: i32 = Opcode::Flush.as_i32();

// =============================================================================
// Table statuses
// =============================================================================

/// Cursor status codes.
pub mod status {
    /// Success, or "a row follows".
    pub const OK: i32 = 0;
    /// Cursor set to beginning-of-table.
    pub const BOF: i32 = 2;
    /// End of table.
    pub const EOF: i32 = 4;
}

// =============================================================================
// Field types
// =============================================================================

/// Type tags reported by `QueryTableFields`.
pub mod field_tag {
    /// Little-endian integer of declared width.
    pub const INTEGER: i32 = 1;
    /// Fixed-width byte string.
    pub const STRING: i32 = 2;
    /// IEEE-754 double.
    pub const DOUBLE: i32 = 3;
}

/// Width of a double column; the server does not send it.
pub const DOUBLE_WIDTH: usize = 8;

// =============================================================================
// Scratch tables and cursors
// =============================================================================

/// Sort function id for integer comparison (`INTEGERCOMPFUNC`).
pub const SORT_INTEGER_COMPARE: i32 = 1;

/// Rows requested per `TableMultiGetForward`.
pub const DEFAULT_BATCH_SIZE: usize = 2000;

/// Upper bound on a length-prefixed string. Anything larger is treated as a
/// desynchronized stream rather than allocated.
pub const MAX_STRING_LEN: usize = 16 * 1024 * 1024;

/// Number of trailing bytes after the fixed columns of a row.
///
/// One byte per started group of eight columns. Their meaning is not
/// documented; they are read and discarded.
pub const fn trailing_bytes(column_count: usize) -> usize {
    column_count.div_ceil(8)
}
