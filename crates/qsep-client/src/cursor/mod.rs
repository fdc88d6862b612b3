//! Server-side cursor protocol.
//!
//! Both cursors operate on an already created scratch table handle and pull
//! rows lazily. Reaching end-of-table is a terminal state, not an error.
//!
//! Batch mode:
//!
//! ```text
//! TableSetStatus(BOF) -> 2
//! TableMoveBy(1)      -> status, count         (4 = empty table)
//! loop:
//!   TableMultiGetForward(n)
//!     n times: status 0 + row | status 4 (stop)
//!   if no EOF: trailing status 0
//! ```
//!
//! Single-row mode repeats `TableMoveBy(1)` + `TableGet` per row and is much
//! slower; it exists for servers where the multi-row fetch misbehaves.
//!
//! Any unexpected status moves the cursor to `Failed`. The server-side
//! position is then undefined. If the status arrived in the middle of a
//! multi-row reply, the rows after it are still in the stream and the
//! session is poisoned as well.

use std::fmt;
use std::io::{Read, Write};

use tracing::debug;

use crate::catalog::TableDescriptor;
use crate::error::{ClientError, ClientResult};
use crate::protocol::{status, Opcode};
use crate::record::{Record, RowDecoder};
use crate::session::Session;

/// Progress notification, fired once per batch or once per single row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Rows retrieved by the step that triggered this notification.
    pub rows: usize,
    /// Rows retrieved so far, including `rows`.
    pub total: usize,
    /// Declared row count of the table, when known.
    pub expected: Option<u64>,
}

/// Cursor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Beginning-of-table not yet requested.
    Unpositioned,
    /// Positioned on a row; more data may follow.
    Positioned,
    /// End of table reached.
    Exhausted,
    /// A protocol or connection error occurred.
    Failed,
}

impl fmt::Display for CursorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorState::Unpositioned => write!(f, "unpositioned"),
            CursorState::Positioned => write!(f, "positioned"),
            CursorState::Exhausted => write!(f, "exhausted"),
            CursorState::Failed => write!(f, "failed"),
        }
    }
}

/// Reads rows in batches with `TableMultiGetForward`.
pub struct BatchCursor<'a, S: Read + Write> {
    session: &'a mut Session<S>,
    decoder: RowDecoder<'a>,
    handle: i32,
    expected: Option<u64>,
    batch_size: usize,
    state: CursorState,
    total: usize,
    row_buf: Vec<u8>,
}

impl<'a, S: Read + Write> BatchCursor<'a, S> {
    /// Creates a cursor over scratch table `handle`, using the session's
    /// batch size.
    pub fn new(session: &'a mut Session<S>, descriptor: &'a TableDescriptor, handle: i32) -> Self {
        let batch_size = session.batch_size();
        Self {
            session,
            decoder: RowDecoder::new(descriptor),
            handle,
            expected: descriptor.row_count(),
            batch_size,
            state: CursorState::Unpositioned,
            total: 0,
            row_buf: vec![0u8; descriptor.wire_row_len()],
        }
    }

    /// Overrides the number of rows requested per fetch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, i32::MAX as usize);
        self
    }

    /// Current state.
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Rows read so far.
    pub fn rows_read(&self) -> usize {
        self.total
    }

    /// Fetches the next batch.
    ///
    /// Returns `None` once the table is exhausted. A batch that ends on EOF
    /// may be empty.
    pub fn next_batch(&mut self) -> ClientResult<Option<Vec<Record>>> {
        match self.state {
            CursorState::Exhausted => return Ok(None),
            CursorState::Failed => {
                return Err(ClientError::invalid_state("read a batch", self.state))
            }
            CursorState::Unpositioned | CursorState::Positioned => {}
        }

        let result = self.fetch();
        if result.is_err() {
            self.state = CursorState::Failed;
        }
        result
    }

    /// Reads every remaining batch, notifying `progress` after each one.
    pub fn read_all(mut self, progress: &mut dyn FnMut(Progress)) -> ClientResult<Vec<Record>> {
        let mut rows = Vec::new();
        while let Some(batch) = self.next_batch()? {
            progress(Progress {
                rows: batch.len(),
                total: self.total,
                expected: self.expected,
            });
            rows.extend(batch);
        }
        debug!("Read {} rows from scratch table {}", rows.len(), self.handle);
        Ok(rows)
    }

    fn fetch(&mut self) -> ClientResult<Option<Vec<Record>>> {
        if self.state == CursorState::Unpositioned {
            set_beginning_of_table(self.session, self.handle)?;

            // The first move positions on row one; its count is not used.
            let (st, count) = move_by(self.session, self.handle, 1)?;
            debug!("Initial move: status {}, count {}", st, count);
            match st {
                status::OK => self.state = CursorState::Positioned,
                status::EOF => {
                    self.state = CursorState::Exhausted;
                    return Ok(None);
                }
                received => {
                    return Err(ClientError::UnexpectedStatus {
                        opcode: Opcode::TableMoveBy,
                        expected: "0 or 4",
                        received,
                    })
                }
            }
        }

        // Validated to fit when set.
        let requested = self.batch_size as i32;
        self.session
            .send_command(Opcode::TableMultiGetForward, &[self.handle, requested])?;

        let batch = self.read_batch();
        let (batch, reached_eof) = self.session.poison_on_error(batch)?;
        if reached_eof {
            self.state = CursorState::Exhausted;
        }

        self.total += batch.len();
        let stats = self.session.stats_mut();
        stats.batches_read += 1;
        stats.rows_decoded += batch.len() as u64;
        debug!("Batch of {} rows read", batch.len());

        Ok(Some(batch))
    }

    /// Reads one `TableMultiGetForward` reply. Returns the rows and whether
    /// the server reported end of table.
    fn read_batch(&mut self) -> ClientResult<(Vec<Record>, bool)> {
        let mut batch = Vec::with_capacity(self.batch_size.min(4096));
        for _ in 0..self.batch_size {
            match self.session.read_i32()? {
                status::OK => {
                    self.session.read_exact(&mut self.row_buf)?;
                    batch.push(self.decoder.decode(&self.row_buf)?);
                }
                status::EOF => return Ok((batch, true)),
                received => {
                    return Err(ClientError::UnexpectedStatus {
                        opcode: Opcode::TableMultiGetForward,
                        expected: "0 or 4",
                        received,
                    })
                }
            }
        }

        let trailing = self.session.read_i32()?;
        if trailing != status::OK {
            return Err(ClientError::UnexpectedStatus {
                opcode: Opcode::TableMultiGetForward,
                expected: "0 after a full batch",
                received: trailing,
            });
        }
        Ok((batch, false))
    }
}

/// Reads one row at a time with `TableMoveBy` + `TableGet`.
pub struct SingleRowCursor<'a, S: Read + Write> {
    session: &'a mut Session<S>,
    decoder: RowDecoder<'a>,
    handle: i32,
    expected: Option<u64>,
    state: CursorState,
    total: usize,
    row_buf: Vec<u8>,
}

impl<'a, S: Read + Write> SingleRowCursor<'a, S> {
    /// Creates a cursor over scratch table `handle`.
    pub fn new(session: &'a mut Session<S>, descriptor: &'a TableDescriptor, handle: i32) -> Self {
        Self {
            session,
            decoder: RowDecoder::new(descriptor),
            handle,
            expected: descriptor.row_count(),
            state: CursorState::Unpositioned,
            total: 0,
            row_buf: vec![0u8; descriptor.wire_row_len()],
        }
    }

    /// Current state.
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Rows read so far.
    pub fn rows_read(&self) -> usize {
        self.total
    }

    /// Fetches the next row, or `None` at end of table.
    pub fn next_row(&mut self) -> ClientResult<Option<Record>> {
        match self.state {
            CursorState::Exhausted => return Ok(None),
            CursorState::Failed => return Err(ClientError::invalid_state("read a row", self.state)),
            CursorState::Unpositioned | CursorState::Positioned => {}
        }

        let result = self.fetch();
        if result.is_err() {
            self.state = CursorState::Failed;
        }
        result
    }

    /// Reads every remaining row, notifying `progress` after each one.
    pub fn read_all(mut self, progress: &mut dyn FnMut(Progress)) -> ClientResult<Vec<Record>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
            progress(Progress {
                rows: 1,
                total: self.total,
                expected: self.expected,
            });
        }
        debug!("Read {} rows from scratch table {}", rows.len(), self.handle);
        Ok(rows)
    }

    fn fetch(&mut self) -> ClientResult<Option<Record>> {
        if self.state == CursorState::Unpositioned {
            set_beginning_of_table(self.session, self.handle)?;
            self.state = CursorState::Positioned;
        }

        let (st, count) = move_by(self.session, self.handle, 1)?;
        match st {
            status::EOF => {
                self.state = CursorState::Exhausted;
                return Ok(None);
            }
            status::OK if count == 1 => {}
            status::OK => {
                return Err(ClientError::UnexpectedCount {
                    opcode: Opcode::TableMoveBy,
                    expected: 1,
                    received: count,
                })
            }
            received => {
                return Err(ClientError::UnexpectedStatus {
                    opcode: Opcode::TableMoveBy,
                    expected: "0 or 4",
                    received,
                })
            }
        }

        self.session.send_command(Opcode::TableGet, &[self.handle])?;
        let st = self.session.read_i32()?;
        if st != status::OK {
            return Err(ClientError::UnexpectedStatus {
                opcode: Opcode::TableGet,
                expected: "0",
                received: st,
            });
        }
        self.session.read_exact(&mut self.row_buf)?;
        let record = self.decoder.decode(&self.row_buf)?;

        self.total += 1;
        self.session.stats_mut().rows_decoded += 1;
        Ok(Some(record))
    }
}

/// Sends `TableSetStatus(BOF)` and checks the acknowledgement.
fn set_beginning_of_table<S: Read + Write>(session: &mut Session<S>, handle: i32) -> ClientResult<()> {
    session.send_command(Opcode::TableSetStatus, &[handle, status::BOF])?;
    match session.read_i32()? {
        status::BOF => {
            debug!("Cursor at beginning of table {}", handle);
            Ok(())
        }
        received => Err(ClientError::UnexpectedStatus {
            opcode: Opcode::TableSetStatus,
            expected: "2",
            received,
        }),
    }
}

/// Sends `TableMoveBy` and returns `(status, count)`.
fn move_by<S: Read + Write>(
    session: &mut Session<S>,
    handle: i32,
    delta: i32,
) -> ClientResult<(i32, i32)> {
    session.send_command(Opcode::TableMoveBy, &[handle, delta])?;
    let st = session.read_i32()?;
    let count = session.read_i32()?;
    Ok((st, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDescriptor, FieldType};
    use crate::error::ConnectionState;
    use crate::record::{encode_row, Value};
    use crate::transport::{MemoryStream, ResponseBuilder};

    const HANDLE: i32 = 31;

    fn descriptor() -> TableDescriptor {
        TableDescriptor::new(
            9,
            vec![
                ColumnDescriptor::new("ID", FieldType::Integer, 4, 1),
                ColumnDescriptor::new("QTY", FieldType::Integer, 2, 2),
            ],
        )
    }

    fn row(td: &TableDescriptor, id: i64) -> Vec<u8> {
        encode_row(td, &Record::new(vec![Value::Integer(id), Value::Integer(id * 10)])).unwrap()
    }

    fn session_with(reply: ResponseBuilder) -> Session<MemoryStream> {
        let reply = ResponseBuilder::new().handshake("db", "1", 1).raw(&reply.build());
        Session::from_stream(MemoryStream::new(reply.build())).unwrap()
    }

    /// Scripts a batch-mode conversation for `rows` rows.
    fn batch_script(td: &TableDescriptor, rows: usize, batch_size: usize) -> ResponseBuilder {
        let mut reply = ResponseBuilder::new().int(status::BOF);
        if rows == 0 {
            return reply.ints(&[status::EOF, 0]);
        }
        reply = reply.ints(&[status::OK, 1]);

        let mut next = 0;
        loop {
            let mut sent = 0;
            while sent < batch_size && next < rows {
                reply = reply.int(status::OK).raw(&row(td, next as i64 + 1));
                sent += 1;
                next += 1;
            }
            if sent < batch_size {
                return reply.int(status::EOF);
            }
            reply = reply.int(status::OK);
        }
    }

    #[test]
    fn test_batch_cursor_counts() {
        let td = descriptor();
        for rows in [1, 2, 3, 4, 7] {
            let mut session = session_with(batch_script(&td, rows, 3));
            let mut notified = Vec::new();
            let records = BatchCursor::new(&mut session, &td, HANDLE)
                .with_batch_size(3)
                .read_all(&mut |p| notified.push(p))
                .unwrap();

            assert_eq!(records.len(), rows);
            for (i, record) in records.iter().enumerate() {
                assert_eq!(record.get(1).unwrap().as_i64(), Some(i as i64 + 1));
            }
            assert_eq!(notified.iter().map(|p| p.rows).sum::<usize>(), rows);
            assert_eq!(notified.last().unwrap().total, rows);
            assert_eq!(session.get_ref().remaining(), 0, "rows = {}", rows);
        }
    }

    #[test]
    fn test_batch_cursor_wire_commands() {
        let td = descriptor();
        let mut session = session_with(batch_script(&td, 2, 5));
        BatchCursor::new(&mut session, &td, HANDLE)
            .with_batch_size(5)
            .read_all(&mut |_| {})
            .unwrap();

        assert_eq!(
            &session.get_ref().written_ints()[2..],
            &[10, HANDLE, 2, 2, 16, HANDLE, 1, 2, 17, HANDLE, 5, 2]
        );
        assert_eq!(session.stats().batches_read, 1);
        assert_eq!(session.stats().rows_decoded, 2);
    }

    #[test]
    fn test_batch_cursor_empty_table() {
        let td = descriptor();
        let mut session = session_with(batch_script(&td, 0, 5));
        let mut cursor = BatchCursor::new(&mut session, &td, HANDLE);

        assert!(cursor.next_batch().unwrap().is_none());
        assert_eq!(cursor.state(), CursorState::Exhausted);
        assert!(cursor.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_batch_cursor_bad_bof_ack() {
        let td = descriptor();
        let mut session = session_with(ResponseBuilder::new().int(0));
        let mut cursor = BatchCursor::new(&mut session, &td, HANDLE);

        let err = cursor.next_batch().unwrap_err();
        assert!(matches!(
            err,
            ClientError::UnexpectedStatus {
                opcode: Opcode::TableSetStatus,
                received: 0,
                ..
            }
        ));
        assert_eq!(cursor.state(), CursorState::Failed);
        assert!(matches!(
            cursor.next_batch(),
            Err(ClientError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_batch_cursor_undefined_move_status() {
        let td = descriptor();
        let mut session = session_with(ResponseBuilder::new().int(status::BOF).ints(&[7, 0]));
        let err = BatchCursor::new(&mut session, &td, HANDLE)
            .read_all(&mut |_| {})
            .unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_batch_cursor_undefined_row_status() {
        let td = descriptor();
        let reply = ResponseBuilder::new()
            .int(status::BOF)
            .ints(&[status::OK, 1])
            .int(status::OK)
            .raw(&row(&td, 1))
            .int(7);
        let mut session = session_with(reply);
        let err = BatchCursor::new(&mut session, &td, HANDLE)
            .read_all(&mut |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::UnexpectedStatus {
                opcode: Opcode::TableMultiGetForward,
                received: 7,
                ..
            }
        ));
        assert_eq!(session.state(), ConnectionState::Poisoned);
    }

    #[test]
    fn test_abandoned_batch_blocks_further_commands() {
        let td = descriptor();
        // Row 2 carries an undefined status and rows 3 and 4 are still queued.
        let reply = ResponseBuilder::new()
            .int(status::BOF)
            .ints(&[status::OK, 1])
            .int(status::OK)
            .raw(&row(&td, 1))
            .int(9)
            .int(status::OK)
            .raw(&row(&td, 3))
            .int(status::OK)
            .raw(&row(&td, 4))
            .int(status::OK);
        let mut session = session_with(reply);
        let err = BatchCursor::new(&mut session, &td, HANDLE)
            .with_batch_size(4)
            .read_all(&mut |_| {})
            .unwrap_err();
        assert!(err.is_protocol_error());

        let written = session.get_ref().written_ints().len();
        assert!(matches!(
            session.destroy_table(HANDLE),
            Err(ClientError::InvalidState { .. })
        ));
        assert!(matches!(
            session.catalog().describe_table(9),
            Err(ClientError::InvalidState { .. })
        ));
        assert_eq!(session.get_ref().written_ints().len(), written);
    }

    #[test]
    fn test_complete_reply_error_keeps_session() {
        let td = descriptor();
        let mut session = session_with(ResponseBuilder::new().int(status::BOF).ints(&[7, 0]));
        let mut cursor = BatchCursor::new(&mut session, &td, HANDLE);

        assert!(cursor.next_batch().is_err());
        assert_eq!(cursor.state(), CursorState::Failed);
        assert_eq!(session.state(), ConnectionState::InTransaction);
        assert_eq!(session.get_ref().remaining(), 0);
    }

    #[test]
    fn test_progress_carries_declared_row_count() {
        let td = descriptor().with_row_count(2);
        let mut session = session_with(batch_script(&td, 2, 5));

        let mut notified = Vec::new();
        BatchCursor::new(&mut session, &td, HANDLE)
            .with_batch_size(5)
            .read_all(&mut |p| notified.push(p))
            .unwrap();
        assert_eq!(
            notified,
            vec![Progress {
                rows: 2,
                total: 2,
                expected: Some(2)
            }]
        );
    }

    #[test]
    fn test_batch_cursor_bad_trailing_status() {
        let td = descriptor();
        let reply = ResponseBuilder::new()
            .int(status::BOF)
            .ints(&[status::OK, 1])
            .int(status::OK)
            .raw(&row(&td, 1))
            .int(status::EOF + 1);
        let mut session = session_with(reply);
        let err = BatchCursor::new(&mut session, &td, HANDLE)
            .with_batch_size(1)
            .read_all(&mut |_| {})
            .unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_batch_cursor_connection_lost_mid_row() {
        let td = descriptor();
        let reply = ResponseBuilder::new()
            .int(status::BOF)
            .ints(&[status::OK, 1])
            .int(status::OK)
            .raw(&row(&td, 1)[..3]);
        let mut session = session_with(reply);
        let err = BatchCursor::new(&mut session, &td, HANDLE)
            .read_all(&mut |_| {})
            .unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
    }

    #[test]
    fn test_single_row_cursor() {
        let td = descriptor();
        let mut reply = ResponseBuilder::new().int(status::BOF);
        for id in 1..=3 {
            reply = reply.ints(&[status::OK, 1]).int(status::OK).raw(&row(&td, id));
        }
        reply = reply.ints(&[status::EOF, 0]);
        let mut session = session_with(reply);

        let mut notified = Vec::new();
        let records = SingleRowCursor::new(&mut session, &td, HANDLE)
            .read_all(&mut |p| notified.push(p))
            .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[2].get(2).unwrap().as_i64(), Some(30));
        assert_eq!(notified.len(), 3);
        assert!(notified.iter().all(|p| p.rows == 1));
        assert_eq!(notified[2].total, 3);
        assert_eq!(
            &session.get_ref().written_ints()[2..14],
            &[10, HANDLE, 2, 2, 16, HANDLE, 1, 2, 19, HANDLE, 2, 16]
        );
    }

    #[test]
    fn test_single_row_cursor_bad_count() {
        let td = descriptor();
        let reply = ResponseBuilder::new().int(status::BOF).ints(&[status::OK, 2]);
        let mut session = session_with(reply);
        let mut cursor = SingleRowCursor::new(&mut session, &td, HANDLE);

        let err = cursor.next_row().unwrap_err();
        assert!(matches!(
            err,
            ClientError::UnexpectedCount {
                expected: 1,
                received: 2,
                ..
            }
        ));
        assert_eq!(cursor.state(), CursorState::Failed);
    }

    #[test]
    fn test_single_row_cursor_bad_get_status() {
        let td = descriptor();
        let reply = ResponseBuilder::new()
            .int(status::BOF)
            .ints(&[status::OK, 1])
            .int(status::EOF);
        let mut session = session_with(reply);
        let mut cursor = SingleRowCursor::new(&mut session, &td, HANDLE);

        let err = cursor.next_row().unwrap_err();
        assert!(matches!(
            err,
            ClientError::UnexpectedStatus {
                opcode: Opcode::TableGet,
                received: status::EOF,
                ..
            }
        ));
        assert_eq!(cursor.state(), CursorState::Failed);
        assert!(matches!(
            cursor.next_row(),
            Err(ClientError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_single_row_cursor_empty_table() {
        let td = descriptor();
        let reply = ResponseBuilder::new().int(status::BOF).ints(&[status::EOF, 0]);
        let mut session = session_with(reply);
        let records = SingleRowCursor::new(&mut session, &td, HANDLE)
            .read_all(&mut |_| panic!("no progress expected"))
            .unwrap();
        assert!(records.is_empty());
    }
}
