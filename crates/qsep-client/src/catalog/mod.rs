//! Table catalog.
//!
//! Enumerates raw tables and retrieves their column layout. A
//! [`TableDescriptor`] is immutable once built and can be reused across any
//! number of table reads.

use std::fmt;
use std::io::{Read, Write};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::protocol::{field_tag, trailing_bytes, Opcode, DOUBLE_WIDTH};
use crate::session::Session;

/// Primitive column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// Little-endian integer of declared width.
    Integer,
    /// Fixed-width byte string.
    String,
    /// IEEE-754 double, always 8 bytes.
    Double,
}

impl FieldType {
    /// Creates a field type from its wire tag.
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            field_tag::INTEGER => Some(Self::Integer),
            field_tag::STRING => Some(Self::String),
            field_tag::DOUBLE => Some(Self::Double),
            _ => None,
        }
    }

    /// Returns the wire tag.
    pub const fn tag(self) -> i32 {
        match self {
            Self::Integer => field_tag::INTEGER,
            Self::String => field_tag::STRING,
            Self::Double => field_tag::DOUBLE,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Integer => write!(f, "INTEGER"),
            FieldType::String => write!(f, "STRING"),
            FieldType::Double => write!(f, "DOUBLE"),
        }
    }
}

/// One column of a raw table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    name: String,
    field_type: FieldType,
    width: usize,
    ordinal: u32,
}

impl ColumnDescriptor {
    /// Creates a column. Doubles are always 8 bytes wide regardless of
    /// `width`.
    pub fn new(name: impl Into<String>, field_type: FieldType, width: usize, ordinal: u32) -> Self {
        let width = match field_type {
            FieldType::Double => DOUBLE_WIDTH,
            _ => width,
        };
        Self {
            name: name.into(),
            field_type,
            width,
            ordinal,
        }
    }

    /// Column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column type.
    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    /// Width in bytes within a row.
    pub fn width(&self) -> usize {
        self.width
    }

    /// 1-based position within a row.
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }
}

/// Layout of a raw table.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    raw_index: i32,
    columns: Vec<ColumnDescriptor>,
    footprint: usize,
    row_count: Option<u64>,
    id_column: OnceLock<Option<u32>>,
}

impl PartialEq for TableDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.raw_index == other.raw_index
            && self.columns == other.columns
            && self.footprint == other.footprint
            && self.row_count == other.row_count
    }
}

impl TableDescriptor {
    /// Creates a descriptor from columns in row layout order.
    pub fn new(raw_index: i32, columns: Vec<ColumnDescriptor>) -> Self {
        let footprint = columns.iter().map(ColumnDescriptor::width).sum();
        Self {
            raw_index,
            columns,
            footprint,
            row_count: None,
            id_column: OnceLock::new(),
        }
    }

    /// Sets the declared row count. Cursors report it in [`Progress`].
    ///
    /// [`Progress`]: crate::cursor::Progress
    pub fn with_row_count(mut self, rows: u64) -> Self {
        self.row_count = Some(rows);
        self
    }

    /// Raw table index.
    pub fn raw_index(&self) -> i32 {
        self.raw_index
    }

    /// Columns in row layout order.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Column by 1-based ordinal.
    pub fn column(&self, ordinal: u32) -> Option<&ColumnDescriptor> {
        let pos = usize::try_from(ordinal).ok()?.checked_sub(1)?;
        self.columns.get(pos)
    }

    /// Column by name, ignoring ASCII case.
    pub fn column_by_name(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Width of the column at 0-based `position`.
    pub fn column_size(&self, position: usize) -> Option<usize> {
        self.columns.get(position).map(ColumnDescriptor::width)
    }

    /// Sum of all column widths.
    pub fn row_footprint(&self) -> usize {
        self.footprint
    }

    /// Trailing bytes sent after the fixed columns of every row.
    pub fn bitmap_len(&self) -> usize {
        trailing_bytes(self.columns.len())
    }

    /// Exact number of bytes one row occupies on the wire.
    pub fn wire_row_len(&self) -> usize {
        self.footprint + self.bitmap_len()
    }

    /// Declared row count, if known. Field queries never report one, so it
    /// is only set for descriptors built with [`with_row_count`].
    ///
    /// [`with_row_count`]: TableDescriptor::with_row_count
    pub fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    /// Ordinal of the column used as the row key.
    ///
    /// The first column named `ID` (any case), else the first integer
    /// column. Computed once.
    pub fn id_column(&self) -> Option<u32> {
        *self.id_column.get_or_init(|| {
            self.columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case("ID"))
                .or_else(|| {
                    self.columns
                        .iter()
                        .find(|c| c.field_type == FieldType::Integer)
                })
                .map(ColumnDescriptor::ordinal)
        })
    }

    /// Column scratch tables are sorted by, resolved from [`id_column`].
    ///
    /// [`id_column`]: TableDescriptor::id_column
    pub fn sort_column(&self) -> Option<&ColumnDescriptor> {
        self.id_column().and_then(|ordinal| self.column(ordinal))
    }
}

impl fmt::Display for TableDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table {} ({} columns, {} bytes):",
            self.raw_index,
            self.columns.len(),
            self.footprint
        )?;
        for c in &self.columns {
            write!(f, " {}:{} {}[{}]", c.ordinal, c.name, c.field_type, c.width)?;
        }
        Ok(())
    }
}

/// Catalog entry for a raw table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// Raw table index.
    pub index: i32,
}

impl fmt::Display for TableInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name, self.index)
    }
}

/// Finds a table by name, ignoring ASCII case.
pub fn find_table<'t>(tables: &'t [TableInfo], name: &str) -> Option<&'t TableInfo> {
    tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
}

/// Schema queries over a session.
pub struct Catalog<'a, S: Read + Write> {
    session: &'a mut Session<S>,
}

impl<'a, S: Read + Write> Catalog<'a, S> {
    /// Creates a catalog over `session`.
    pub fn new(session: &'a mut Session<S>) -> Self {
        Self { session }
    }

    /// Lists raw tables in server order.
    pub fn list_tables(&mut self) -> ClientResult<Vec<TableInfo>> {
        self.session.send_command(Opcode::QueryAllTables, &[])?;
        self.session.expect_ok(Opcode::QueryAllTables)?;

        let reported = self.session.read_i32()?;
        if reported < 0 {
            warn!("QueryAllTables reported negative count {}", reported);
        }
        let count = reported.unsigned_abs();
        debug!("Database has {} tables", count);

        let mut tables = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let name = self.session.read_string()?;
            let index = self.session.read_i32()?;
            debug!("Table {} has raw index {}", name, index);
            tables.push(TableInfo { name, index });
        }
        Ok(tables)
    }

    /// Retrieves the column layout of a raw table.
    ///
    /// A field list that cannot be parsed leaves the rest of the reply
    /// unread, so the session is poisoned.
    pub fn describe_table(&mut self, raw_index: i32) -> ClientResult<TableDescriptor> {
        self.session
            .send_command(Opcode::QueryTableFields, &[raw_index])?;
        self.session.expect_ok(Opcode::QueryTableFields)?;

        let columns = self.read_columns();
        let columns = self.session.poison_on_error(columns)?;

        let descriptor = TableDescriptor::new(raw_index, columns);
        debug!("Described {}", descriptor);
        Ok(descriptor)
    }

    fn read_columns(&mut self) -> ClientResult<Vec<ColumnDescriptor>> {
        let count = self.session.read_i32()?;
        let count = u32::try_from(count).map_err(|_| {
            ClientError::protocol(
                Some(Opcode::QueryTableFields),
                format!("field count must not be negative, got {}", count),
            )
        })?;

        let mut columns = Vec::with_capacity(count.min(1024) as usize);
        for ordinal in 1..=count {
            let name = self.session.read_string()?;
            let tag = self.session.read_i32()?;
            let field_type = FieldType::from_tag(tag).ok_or_else(|| {
                ClientError::UnsupportedFieldType {
                    column: name.clone(),
                    tag,
                }
            })?;

            let width = match field_type {
                FieldType::Integer | FieldType::String => {
                    let size = self.session.read_i32()?;
                    usize::try_from(size).map_err(|_| {
                        ClientError::protocol(
                            Some(Opcode::QueryTableFields),
                            format!("negative width {} for column {:?}", size, name),
                        )
                    })?
                }
                FieldType::Double => DOUBLE_WIDTH,
            };
            columns.push(ColumnDescriptor::new(name, field_type, width, ordinal));
        }
        Ok(columns)
    }

    /// Lists tables and returns the one named `name`.
    pub fn find_table(&mut self, name: &str) -> ClientResult<TableInfo> {
        let tables = self.list_tables()?;
        find_table(&tables, name)
            .cloned()
            .ok_or_else(|| ClientError::UnknownTable(name.to_string()))
    }
}
