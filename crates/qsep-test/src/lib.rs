//! # qsep-test
//!
//! Scripted QSEP server for end-to-end tests of `qsep-client`.
//!
//! [`MockServer`] listens on an ephemeral loopback port, accepts a single
//! connection and answers every command the client issues from an in-memory
//! [`MockDatabase`]. Scratch tables are sorted by the requested key column and
//! keep their own cursor position, so the client's batch and single-row modes
//! see the same row sequence a real server would produce. [`Fault`]s inject
//! bad statuses or a dropped connection at chosen points.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use qsep_client::protocol::{status, Opcode, FLUSH};
use qsep_client::transport::{read_i32_le, ResponseBuilder};
use qsep_client::{
    encode_row, ClientConfig, ClientError, ClientResult, ColumnDescriptor, FieldType, Record,
    TableDescriptor,
};
use tracing::{debug, warn};

/// A raw table served by the mock.
#[derive(Debug, Clone)]
pub struct MockTable {
    /// Table name.
    pub name: String,
    /// Layout, including the raw index.
    pub descriptor: TableDescriptor,
    /// Rows in storage order.
    pub rows: Vec<Record>,
}

impl MockTable {
    /// Creates an empty table.
    pub fn new(name: impl Into<String>, index: i32, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            name: name.into(),
            descriptor: TableDescriptor::new(index, columns),
            rows: Vec::new(),
        }
    }

    /// Replaces the rows.
    pub fn with_rows(mut self, rows: Vec<Record>) -> Self {
        self.rows = rows;
        self
    }

    /// Raw table index.
    pub fn index(&self) -> i32 {
        self.descriptor.raw_index()
    }
}

/// Contents of the mock server.
#[derive(Debug, Clone)]
pub struct MockDatabase {
    /// Name sent in the greeting.
    pub name: String,
    /// Version sent in the greeting.
    pub version: String,
    /// Transaction handle handed out by `TransactionCreate`.
    pub transaction: i32,
    /// Raw tables in catalog order.
    pub tables: Vec<MockTable>,
}

impl MockDatabase {
    /// Creates an empty database.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            transaction: 1,
            tables: Vec::new(),
        }
    }

    /// Adds a table.
    pub fn with_table(mut self, table: MockTable) -> Self {
        self.tables.push(table);
        self
    }

    fn table(&self, index: i32) -> Option<&MockTable> {
        self.tables.iter().find(|t| t.index() == index)
    }
}

/// Misbehaviour injected into the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every `TableMoveBy` answers with this status and count 0.
    MoveByStatus(i32),
    /// After this many rows, a multi-row fetch sends `status` instead of a row.
    RowStatus {
        /// Rows sent before the fault.
        after_rows: usize,
        /// Status sent in place of the next row.
        status: i32,
    },
    /// The connection is dropped once this many rows have been sent.
    CloseAfterRows(usize),
    /// `QueryAllTables` reports its count negated.
    NegativeTableCount,
    /// `TransactionAccept` answers with this error code.
    AcceptError(i32),
    /// `TableCreate` answers with this error code.
    TableCreateError(i32),
}

/// A command received by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCommand {
    /// Raw opcode.
    pub opcode: i32,
    /// Parameters, excluding the flush marker.
    pub params: Vec<i32>,
}

impl ReceivedCommand {
    /// Returns true if this is `opcode`.
    pub fn is(&self, opcode: Opcode) -> bool {
        self.opcode == opcode.as_i32()
    }
}

/// A single-connection QSEP server running on its own thread.
pub struct MockServer {
    addr: SocketAddr,
    log: Arc<Mutex<Vec<ReceivedCommand>>>,
    handle: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Starts a well-behaved server.
    pub fn start(db: MockDatabase) -> io::Result<Self> {
        Self::start_with_faults(db, Vec::new())
    }

    /// Starts a server with injected faults.
    pub fn start_with_faults(db: MockDatabase, faults: Vec<Fault>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let log = Arc::new(Mutex::new(Vec::new()));

        let thread_log = Arc::clone(&log);
        let handle = thread::spawn(move || match listener.accept() {
            Ok((stream, peer)) => {
                debug!("Mock server accepted {}", peer);
                let mut conn = Connection::new(stream, db, faults, thread_log);
                if let Err(e) = conn.serve() {
                    debug!("Mock server connection ended: {}", e);
                }
            }
            Err(e) => warn!("Mock server accept failed: {}", e),
        });

        Ok(Self {
            addr,
            log,
            handle: Some(handle),
        })
    }

    /// Address the server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Client configuration pointing at this server.
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.addr.ip().to_string(), self.addr.port())
    }

    /// Commands received so far.
    pub fn commands(&self) -> Vec<ReceivedCommand> {
        self.log.lock().clone()
    }

    /// Commands received so far with the given opcode.
    pub fn commands_of(&self, opcode: Opcode) -> Vec<ReceivedCommand> {
        self.log
            .lock()
            .iter()
            .filter(|c| c.is(opcode))
            .cloned()
            .collect()
    }

    /// Waits for the connection to end.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Server-side state of a scratch table.
struct Scratch {
    rows: Vec<Vec<u8>>,
    /// 0 before the first row, `rows.len() + 1` past the end.
    position: usize,
}

impl Scratch {
    fn current(&self) -> Option<&[u8]> {
        self.position
            .checked_sub(1)
            .and_then(|i| self.rows.get(i))
            .map(Vec::as_slice)
    }
}

struct Connection {
    stream: TcpStream,
    db: MockDatabase,
    faults: Vec<Fault>,
    log: Arc<Mutex<Vec<ReceivedCommand>>>,
    scratch: HashMap<i32, Scratch>,
    next_handle: i32,
    rows_sent: usize,
}

impl Connection {
    fn new(
        stream: TcpStream,
        db: MockDatabase,
        faults: Vec<Fault>,
        log: Arc<Mutex<Vec<ReceivedCommand>>>,
    ) -> Self {
        Self {
            stream,
            db,
            faults,
            log,
            scratch: HashMap::new(),
            next_handle: 100,
            rows_sent: 0,
        }
    }

    fn fault(&self, pick: impl Fn(&Fault) -> Option<i32>) -> Option<i32> {
        self.faults.iter().find_map(pick)
    }

    fn serve(&mut self) -> ClientResult<()> {
        let greeting = ResponseBuilder::new()
            .string(&self.db.name)
            .string(&self.db.version);
        self.reply(greeting)?;

        loop {
            let raw = read_i32_le(&mut self.stream)?;
            let opcode = Opcode::from_i32(raw)
                .ok_or_else(|| ClientError::protocol(None, format!("unknown opcode {}", raw)))?;
            let params = self.read_params(opcode)?;
            let flush = read_i32_le(&mut self.stream)?;
            if flush != FLUSH {
                return Err(ClientError::protocol(
                    Some(opcode),
                    format!("not terminated by flush, got {}", flush),
                ));
            }
            debug!("Mock server received {} {:?}", opcode, params);
            self.log.lock().push(ReceivedCommand {
                opcode: raw,
                params: params.clone(),
            });

            if !self.handle(opcode, &params)? {
                return Ok(());
            }
        }
    }

    fn read_params(&mut self, opcode: Opcode) -> ClientResult<Vec<i32>> {
        let fixed = match opcode {
            Opcode::Quit
            | Opcode::Flush
            | Opcode::TransactionCreate
            | Opcode::QueryAllTables => 0,
            Opcode::TransactionAccept
            | Opcode::TableDestroy
            | Opcode::TableGet
            | Opcode::QueryTableFields => 1,
            Opcode::TableSetStatus | Opcode::TableMoveBy | Opcode::TableMultiGetForward => 2,
            Opcode::TableCreate => return self.read_table_create_params(),
        };
        (0..fixed).map(|_| read_i32_le(&mut self.stream)).collect()
    }

    /// raw index, n, n ordinals, transaction, k, k × (field, function)
    fn read_table_create_params(&mut self) -> ClientResult<Vec<i32>> {
        let mut params = vec![read_i32_le(&mut self.stream)?];
        let fields = read_i32_le(&mut self.stream)?;
        params.push(fields);
        for _ in 0..fields.max(0) {
            params.push(read_i32_le(&mut self.stream)?);
        }
        params.push(read_i32_le(&mut self.stream)?);
        let sorts = read_i32_le(&mut self.stream)?;
        params.push(sorts);
        for _ in 0..sorts.max(0) * 2 {
            params.push(read_i32_le(&mut self.stream)?);
        }
        Ok(params)
    }

    /// Returns false once the connection should end.
    fn handle(&mut self, opcode: Opcode, params: &[i32]) -> ClientResult<bool> {
        let reply = match opcode {
            Opcode::Quit => {
                self.reply(ResponseBuilder::new().int(0))?;
                return Ok(false);
            }
            Opcode::Flush => ResponseBuilder::new(),
            Opcode::TransactionCreate => ResponseBuilder::new().int(0).int(self.db.transaction),
            Opcode::TransactionAccept => {
                let code = self
                    .fault(|f| match f {
                        Fault::AcceptError(code) => Some(*code),
                        _ => None,
                    })
                    .unwrap_or(if params[0] == self.db.transaction { 0 } else { 1 });
                ResponseBuilder::new().int(code)
            }
            Opcode::QueryAllTables => self.query_all_tables(),
            Opcode::QueryTableFields => self.query_table_fields(params[0]),
            Opcode::TableCreate => self.table_create(params),
            Opcode::TableDestroy => {
                let code = if self.scratch.remove(&params[0]).is_some() { 0 } else { 1 };
                ResponseBuilder::new().int(code)
            }
            Opcode::TableSetStatus => match self.scratch.get_mut(&params[0]) {
                Some(scratch) if params[1] == status::BOF => {
                    scratch.position = 0;
                    ResponseBuilder::new().int(status::BOF)
                }
                _ => ResponseBuilder::new().int(-1),
            },
            Opcode::TableMoveBy => self.move_by(params[0], params[1]),
            Opcode::TableGet => match self.scratch.get(&params[0]).and_then(Scratch::current) {
                Some(row) => ResponseBuilder::new().int(status::OK).raw(row),
                None => ResponseBuilder::new().int(status::EOF),
            },
            Opcode::TableMultiGetForward => return self.multi_get_forward(params[0], params[1]),
        };
        self.reply(reply)?;
        Ok(true)
    }

    fn query_all_tables(&self) -> ResponseBuilder {
        let count = self.db.tables.len() as i32;
        let count = if self.faults.contains(&Fault::NegativeTableCount) {
            -count
        } else {
            count
        };
        let mut reply = ResponseBuilder::new().int(0).int(count);
        for table in &self.db.tables {
            reply = reply.string(&table.name).int(table.index());
        }
        reply
    }

    fn query_table_fields(&self, index: i32) -> ResponseBuilder {
        let Some(table) = self.db.table(index) else {
            return ResponseBuilder::new().int(1);
        };
        let columns = table.descriptor.columns();
        let mut reply = ResponseBuilder::new().int(0).int(columns.len() as i32);
        for column in columns {
            reply = reply
                .string(column.name())
                .int(column.field_type().tag());
            if column.field_type() != FieldType::Double {
                reply = reply.int(column.width() as i32);
            }
        }
        reply
    }

    fn table_create(&mut self, params: &[i32]) -> ResponseBuilder {
        if let Some(code) = self.fault(|f| match f {
            Fault::TableCreateError(code) => Some(*code),
            _ => None,
        }) {
            return ResponseBuilder::new().int(code);
        }

        let index = params[0];
        let fields = params[1].max(0) as usize;
        let transaction = params[2 + fields];
        let sort_field = params.get(4 + fields).copied().unwrap_or(0);

        let Some(table) = self.db.table(index) else {
            return ResponseBuilder::new().int(1);
        };
        if transaction != self.db.transaction {
            return ResponseBuilder::new().int(2);
        }

        let mut rows: Vec<&Record> = table.rows.iter().collect();
        let key = |r: &Record| {
            u32::try_from(sort_field)
                .ok()
                .and_then(|ordinal| r.get(ordinal))
                .and_then(|v| v.as_i64())
                .unwrap_or(i64::MIN)
        };
        rows.sort_by_key(|r| key(*r));

        let encoded: Result<Vec<_>, _> = rows
            .into_iter()
            .map(|r| encode_row(&table.descriptor, r))
            .collect();
        let Ok(encoded) = encoded else {
            return ResponseBuilder::new().int(3);
        };

        let handle = self.next_handle;
        self.next_handle += 1;
        self.scratch.insert(
            handle,
            Scratch {
                rows: encoded,
                position: 0,
            },
        );
        ResponseBuilder::new().int(0).int(handle)
    }

    fn move_by(&mut self, handle: i32, delta: i32) -> ResponseBuilder {
        if let Some(st) = self.fault(|f| match f {
            Fault::MoveByStatus(st) => Some(*st),
            _ => None,
        }) {
            return ResponseBuilder::new().int(st).int(0);
        }

        let Some(scratch) = self.scratch.get_mut(&handle) else {
            return ResponseBuilder::new().int(-1).int(0);
        };
        let target = scratch.position as i64 + i64::from(delta);
        if target >= 1 && target <= scratch.rows.len() as i64 {
            scratch.position = target as usize;
            ResponseBuilder::new().int(status::OK).int(delta)
        } else {
            scratch.position = scratch.rows.len() + 1;
            ResponseBuilder::new().int(status::EOF).int(0)
        }
    }

    /// Streams rows from the current position, one reply per row.
    fn multi_get_forward(&mut self, handle: i32, count: i32) -> ClientResult<bool> {
        let row_fault = self.fault(|f| match f {
            Fault::RowStatus { after_rows, .. } => Some(*after_rows as i32),
            _ => None,
        });
        let close_after = self.fault(|f| match f {
            Fault::CloseAfterRows(n) => Some(*n as i32),
            _ => None,
        });

        let Some(scratch) = self.scratch.get_mut(&handle) else {
            self.reply(ResponseBuilder::new().int(-1))?;
            return Ok(true);
        };

        let mut reply = ResponseBuilder::new();
        let mut reached_eof = false;
        for _ in 0..count.max(0) {
            if close_after == Some(self.rows_sent as i32) {
                self.stream.write_all(&reply.build())?;
                return Ok(false);
            }
            if row_fault == Some(self.rows_sent as i32) {
                let st = self
                    .faults
                    .iter()
                    .find_map(|f| match f {
                        Fault::RowStatus { status, .. } => Some(*status),
                        _ => None,
                    })
                    .unwrap_or(-1);
                reply = reply.int(st);
                self.stream.write_all(&reply.build())?;
                return Ok(true);
            }

            let row = if scratch.position == 0 {
                None
            } else {
                scratch.rows.get(scratch.position - 1)
            };
            match row {
                Some(row) => {
                    reply = reply.int(status::OK).raw(row);
                    scratch.position += 1;
                    self.rows_sent += 1;
                }
                None => {
                    reply = reply.int(status::EOF);
                    reached_eof = true;
                    break;
                }
            }
        }
        if !reached_eof {
            reply = reply.int(status::OK);
        }
        self.stream.write_all(&reply.build())?;
        Ok(true)
    }

    fn reply(&mut self, reply: ResponseBuilder) -> ClientResult<()> {
        self.stream.write_all(&reply.build())?;
        Ok(())
    }
}

/// Shorthand for an integer column.
pub fn int_column(name: &str, width: usize, ordinal: u32) -> ColumnDescriptor {
    ColumnDescriptor::new(name, FieldType::Integer, width, ordinal)
}

/// Shorthand for a string column.
pub fn string_column(name: &str, width: usize, ordinal: u32) -> ColumnDescriptor {
    ColumnDescriptor::new(name, FieldType::String, width, ordinal)
}

/// Shorthand for a double column.
pub fn double_column(name: &str, ordinal: u32) -> ColumnDescriptor {
    ColumnDescriptor::new(name, FieldType::Double, 8, ordinal)
}
