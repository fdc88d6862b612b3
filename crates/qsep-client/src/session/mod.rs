//! Protocol session.
//!
//! A [`Session`] owns one connection and the single transaction opened on it.
//!
//! ```text
//! Disconnected ──connect──▶ Connected ──TransactionCreate──▶ InTransaction
//!                                                                  │
//!                                   Closed ◀──Accept + Quit────────┘
//! ```
//!
//! Any `ConnectionClosed` error moves the session straight to `Closed`.
//! A protocol error that leaves part of a reply unread moves it to
//! `Poisoned`: the next integer on the stream could belong to anything, so
//! every further command is refused.
//! The session does not interpret responses; each caller reads the reply
//! shape its opcode defines.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult, ConnectionState};
use crate::protocol::{Opcode, DEFAULT_BATCH_SIZE};
use crate::reader::TableReader;
use crate::stats::ClientStats;
use crate::transport;

/// Server identity captured from the greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Database name.
    pub database: String,
    /// Database version string.
    pub version: String,
}

/// Result of [`Session::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishOutcome {
    /// Error code returned by `TransactionAccept`. Non-zero codes are logged
    /// but do not prevent quitting.
    pub accept_code: i32,
    /// Status returned by `Quit`.
    pub quit_status: i32,
}

impl FinishOutcome {
    /// Returns true if the transaction was accepted cleanly.
    pub fn accepted(&self) -> bool {
        self.accept_code == 0
    }
}

/// A QSEP connection with its transaction.
pub struct Session<S: Read + Write = TcpStream> {
    stream: S,
    info: ConnectionInfo,
    state: ConnectionState,
    transaction: Option<i32>,
    /// Scratch tables created and not yet destroyed.
    open_tables: Vec<i32>,
    /// Last command sent, used to attribute transport-level errors.
    last_opcode: Option<Opcode>,
    batch_size: usize,
    stats: ClientStats,
}

impl<S: Read + Write> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("info", &self.info)
            .field("state", &self.state)
            .field("transaction", &self.transaction)
            .field("open_tables", &self.open_tables)
            .field("last_opcode", &self.last_opcode)
            .finish()
    }
}

impl Session<TcpStream> {
    /// Connects to the server, reads the greeting and opens a transaction.
    pub fn connect(config: &ClientConfig) -> ClientResult<Self> {
        config.validate()?;

        let target = config.connection_string();
        let addrs = target
            .to_socket_addrs()
            .map_err(|e| ClientError::ConnectionFailed(format!("{}: {}", target, e)))?;

        let mut last_err = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        let stream = match (stream, last_err) {
            (Some(stream), _) => stream,
            (None, Some(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(ClientError::ConnectionTimeout(
                    config.connect_timeout.as_millis() as u64,
                ))
            }
            (None, Some(e)) => {
                return Err(ClientError::ConnectionFailed(format!("{}: {}", target, e)))
            }
            (None, None) => {
                return Err(ClientError::ConnectionFailed(format!(
                    "{}: no addresses resolved",
                    target
                )))
            }
        };

        stream.set_read_timeout(config.read_timeout)?;
        stream.set_nodelay(config.nodelay)?;
        info!("Connected to {}", target);

        let mut session = Self::handshake(stream)?;
        session.batch_size = config.batch_size;
        Ok(session)
    }
}

impl<S: Read + Write> Session<S> {
    /// Runs the handshake over an already established stream.
    pub fn from_stream(stream: S) -> ClientResult<Self> {
        Self::handshake(stream)
    }

    fn handshake(mut stream: S) -> ClientResult<Self> {
        let database = transport::read_string(&mut stream)
            .map_err(|e| ClientError::Handshake(format!("reading database name: {}", e)))?;
        let version = transport::read_string(&mut stream)
            .map_err(|e| ClientError::Handshake(format!("reading database version: {}", e)))?;

        let stats = ClientStats {
            bytes_read: (8 + database.chars().count() + version.chars().count()) as u64,
            ..Default::default()
        };
        let mut session = Self {
            stream,
            info: ConnectionInfo { database, version },
            state: ConnectionState::Connected,
            transaction: None,
            open_tables: Vec::new(),
            last_opcode: None,
            batch_size: DEFAULT_BATCH_SIZE,
            stats,
        };
        info!(
            database = %session.info.database,
            version = %session.info.version,
            "Handshake complete"
        );

        session.send_command(Opcode::TransactionCreate, &[])?;
        session.expect_ok(Opcode::TransactionCreate)?;
        let handle = session.read_i32()?;
        session.transaction = Some(handle);
        session.state = ConnectionState::InTransaction;
        info!("Transaction {} created", handle);

        Ok(session)
    }

    /// Returns the server identity.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Returns the current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns the active transaction handle.
    pub fn transaction_handle(&self) -> Option<i32> {
        self.transaction
    }

    /// Returns the scratch tables that are still open.
    pub fn open_tables(&self) -> &[i32] {
        &self.open_tables
    }

    /// Returns the rows requested per multi-row fetch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Sets the rows requested per multi-row fetch.
    pub fn set_batch_size(&mut self, batch_size: usize) -> ClientResult<()> {
        if batch_size == 0 || i32::try_from(batch_size).is_err() {
            return Err(ClientError::InvalidConfig(format!(
                "batch_size must be between 1 and {}",
                i32::MAX
            )));
        }
        self.batch_size = batch_size;
        Ok(())
    }

    /// Returns usage statistics.
    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut ClientStats {
        &mut self.stats
    }

    /// Returns a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Returns the table catalog for this session.
    pub fn catalog(&mut self) -> Catalog<'_, S> {
        Catalog::new(self)
    }

    /// Returns a table reader for this session.
    pub fn reader(&mut self) -> TableReader<'_, S> {
        TableReader::new(self)
    }

    /// Writes a command: opcode, each parameter, then the flush marker.
    pub fn send_command(&mut self, opcode: Opcode, params: &[i32]) -> ClientResult<()> {
        self.ensure_open("send a command")?;

        let frame = transport::encode_command(opcode, params);
        debug!("Sending {} with {} params", opcode, params.len());
        self.last_opcode = Some(opcode);
        let result = transport::write_bytes(&mut self.stream, &frame);
        self.track(result)?;

        self.stats.commands_sent += 1;
        self.stats.bytes_written += frame.len() as u64;
        Ok(())
    }

    /// Reads one integer from the response.
    pub fn read_i32(&mut self) -> ClientResult<i32> {
        self.ensure_open("read a response")?;
        let result = transport::read_i32_le(&mut self.stream);
        let value = self.track(result)?;
        self.stats.bytes_read += 4;
        Ok(value)
    }

    /// Reads one length-prefixed string from the response.
    pub fn read_string(&mut self) -> ClientResult<String> {
        self.ensure_open("read a response")?;
        let result = transport::read_length_prefixed(&mut self.stream);
        let bytes = self.track(result)?;
        self.stats.bytes_read += 4 + bytes.len() as u64;
        Ok(transport::latin1_to_string(&bytes))
    }

    /// Fills `buf` from the response.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> ClientResult<()> {
        self.ensure_open("read a response")?;
        let result = transport::read_exact(&mut self.stream, buf);
        self.track(result)?;
        self.stats.bytes_read += buf.len() as u64;
        Ok(())
    }

    /// Reads an error code and fails unless it is zero.
    pub fn expect_ok(&mut self, opcode: Opcode) -> ClientResult<()> {
        match self.read_i32()? {
            0 => Ok(()),
            code => Err(ClientError::Server { opcode, code }),
        }
    }

    /// Returns the transaction handle, or `InvalidState` outside a transaction.
    pub fn require_transaction(&self, operation: &'static str) -> ClientResult<i32> {
        match (self.state, self.transaction) {
            (ConnectionState::InTransaction, Some(handle)) => Ok(handle),
            (state, _) => Err(ClientError::invalid_state(operation, state)),
        }
    }

    pub(crate) fn register_table(&mut self, handle: i32) {
        self.open_tables.push(handle);
        self.stats.tables_opened += 1;
    }

    /// Destroys a scratch table.
    ///
    /// The handle is forgotten even if the server reports an error.
    pub fn destroy_table(&mut self, handle: i32) -> ClientResult<()> {
        self.ensure_open("destroy a scratch table")?;
        self.open_tables.retain(|&h| h != handle);
        self.send_command(Opcode::TableDestroy, &[handle])?;
        self.expect_ok(Opcode::TableDestroy)?;
        debug!("Scratch table {} destroyed", handle);
        Ok(())
    }

    /// Accepts the transaction and quits.
    ///
    /// Scratch tables still open are destroyed first on a best-effort basis.
    /// A non-zero accept code is reported in the outcome and does not stop
    /// the quit.
    pub fn finish(&mut self) -> ClientResult<FinishOutcome> {
        let transaction = self.require_transaction("finish the transaction")?;

        for handle in std::mem::take(&mut self.open_tables) {
            if let Err(e) = self.destroy_table(handle) {
                warn!("Failed to destroy scratch table {}: {}", handle, e);
                if self.state != ConnectionState::InTransaction {
                    return Err(e);
                }
            }
        }

        self.send_command(Opcode::TransactionAccept, &[transaction])?;
        let accept_code = self.read_i32()?;
        if accept_code != 0 {
            warn!("TransactionAccept returned error code {}", accept_code);
        }
        self.transaction = None;

        self.send_command(Opcode::Quit, &[])?;
        let quit_status = self.read_i32()?;
        self.state = ConnectionState::Closed;
        info!("Session finished, quit status {}", quit_status);

        Ok(FinishOutcome {
            accept_code,
            quit_status,
        })
    }

    fn ensure_open(&self, operation: &'static str) -> ClientResult<()> {
        match self.state {
            ConnectionState::Connected | ConnectionState::InTransaction => Ok(()),
            state => Err(ClientError::invalid_state(operation, state)),
        }
    }

    /// Refuses every further command. Used when a reply was abandoned part
    /// way through.
    pub(crate) fn poison(&mut self, cause: &ClientError) {
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::InTransaction
        ) {
            warn!("Session poisoned: {}", cause);
            self.state = ConnectionState::Poisoned;
        }
    }

    /// Poisons the session if `result` failed for any reason other than a
    /// lost connection or a server error code.
    pub(crate) fn poison_on_error<T>(&mut self, result: ClientResult<T>) -> ClientResult<T> {
        if let Err(e) = &result {
            if !e.is_connection_error() && !matches!(e, ClientError::Server { .. }) {
                self.poison(e);
            }
        }
        result
    }

    fn track<T>(&mut self, result: ClientResult<T>) -> ClientResult<T> {
        match result {
            Err(ClientError::ConnectionClosed) => {
                warn!("Connection lost, session closed");
                self.state = ConnectionState::Closed;
                self.transaction = None;
                self.open_tables.clear();
                Err(ClientError::ConnectionClosed)
            }
            Err(ClientError::Protocol { opcode, message }) => {
                let err = ClientError::Protocol {
                    opcode: opcode.or(self.last_opcode),
                    message,
                };
                self.poison(&err);
                Err(err)
            }
            other => other,
        }
    }
}
