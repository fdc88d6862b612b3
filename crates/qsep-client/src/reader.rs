//! Whole-table reads.
//!
//! Resolves the table layout, opens a scratch table projecting every field
//! sorted by the key column, drains it through a cursor and destroys it.
//! If anything fails after the scratch table exists, destruction is still
//! attempted and the original error is returned. A poisoned or closed
//! session cannot send the destroy; the handle then stays in
//! [`Session::open_tables`].

use std::io::{Read, Write};

use tracing::{debug, info, warn};

use crate::catalog::{Catalog, ColumnDescriptor, TableDescriptor};
use crate::cursor::{BatchCursor, Progress, SingleRowCursor};
use crate::error::{ClientError, ClientResult, ConnectionState};
use crate::protocol::{Opcode, SORT_INTEGER_COMPARE};
use crate::record::Record;
use crate::session::Session;

/// Cursor mode used to drain the scratch table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadMode {
    /// `TableMultiGetForward` batches.
    #[default]
    Batch,
    /// One `TableMoveBy` + `TableGet` per row.
    SingleRow,
}

/// Rows of one table together with its layout.
#[derive(Debug, Clone, PartialEq)]
pub struct TableData {
    /// Table layout.
    pub descriptor: TableDescriptor,
    /// Rows in key order.
    pub rows: Vec<Record>,
}

impl TableData {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table had no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Reads whole tables over a session.
pub struct TableReader<'a, S: Read + Write> {
    session: &'a mut Session<S>,
    mode: ReadMode,
}

impl<'a, S: Read + Write> TableReader<'a, S> {
    /// Creates a batch-mode reader over `session`.
    pub fn new(session: &'a mut Session<S>) -> Self {
        Self {
            session,
            mode: ReadMode::Batch,
        }
    }

    /// Selects the cursor mode.
    pub fn mode(mut self, mode: ReadMode) -> Self {
        self.mode = mode;
        self
    }

    /// Reads every row of the raw table `raw_index`.
    pub fn read_table(
        &mut self,
        raw_index: i32,
        progress: &mut dyn FnMut(Progress),
    ) -> ClientResult<TableData> {
        let descriptor = Catalog::new(self.session).describe_table(raw_index)?;
        let rows = self.read_table_with_descriptor(&descriptor, progress)?;
        Ok(TableData { descriptor, rows })
    }

    /// Looks up a table by name and reads it.
    pub fn read_table_by_name(
        &mut self,
        name: &str,
        progress: &mut dyn FnMut(Progress),
    ) -> ClientResult<TableData> {
        let table = Catalog::new(self.session).find_table(name)?;
        self.read_table(table.index, progress)
    }

    /// Reads every row using an already retrieved descriptor.
    pub fn read_table_with_descriptor(
        &mut self,
        descriptor: &TableDescriptor,
        progress: &mut dyn FnMut(Progress),
    ) -> ClientResult<Vec<Record>> {
        let sort_column = descriptor
            .sort_column()
            .ok_or(ClientError::NoSortableColumn {
                table: descriptor.raw_index(),
            })?;

        let handle = create_scratch_table(self.session, descriptor, sort_column)?;

        let rows = match self.mode {
            ReadMode::Batch => {
                BatchCursor::new(self.session, descriptor, handle).read_all(progress)
            }
            ReadMode::SingleRow => {
                SingleRowCursor::new(self.session, descriptor, handle).read_all(progress)
            }
        };

        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                if self.session.state() != ConnectionState::InTransaction {
                    warn!(
                        "Scratch table {} not destroyed, session is {}",
                        handle,
                        self.session.state()
                    );
                } else if let Err(cleanup) = self.session.destroy_table(handle) {
                    warn!(
                        "Cleanup of scratch table {} failed after error ({}): {}",
                        handle, err, cleanup
                    );
                }
                return Err(err);
            }
        };

        self.session.destroy_table(handle)?;
        info!(
            "Read {} rows from table {}",
            rows.len(),
            descriptor.raw_index()
        );
        Ok(rows)
    }
}

/// Sends `TableCreate` projecting all fields, sorted by `sort_column` with
/// integer comparison, and returns the scratch table handle.
fn create_scratch_table<S: Read + Write>(
    session: &mut Session<S>,
    descriptor: &TableDescriptor,
    sort_column: &ColumnDescriptor,
) -> ClientResult<i32> {
    let transaction = session.require_transaction("create a scratch table")?;

    let field_count = descriptor.column_count();
    let field_count_param = i32::try_from(field_count).map_err(|_| {
        ClientError::protocol(
            Some(Opcode::TableCreate),
            format!("too many fields: {}", field_count),
        )
    })?;
    let sort_param = i32::try_from(sort_column.ordinal()).map_err(|_| {
        ClientError::protocol(
            Some(Opcode::TableCreate),
            format!("sort column {} out of range", sort_column.ordinal()),
        )
    })?;

    let mut params = Vec::with_capacity(field_count + 6);
    params.push(descriptor.raw_index());
    params.push(field_count_param);
    params.extend(1..=field_count_param);
    params.push(transaction);
    params.push(1);
    params.push(sort_param);
    params.push(SORT_INTEGER_COMPARE);

    debug!(
        "Creating scratch table over {} sorted by {}",
        descriptor.raw_index(),
        sort_column.name()
    );
    session.send_command(Opcode::TableCreate, &params)?;
    session.expect_ok(Opcode::TableCreate)?;
    let handle = session.read_i32()?;
    session.register_table(handle);
    Ok(handle)
}
