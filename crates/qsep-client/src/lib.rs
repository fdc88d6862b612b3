//! # qsep-client
//!
//! Blocking client for the QSEP binary table protocol.
//!
//! QSEP is a stateful command/response protocol: the client opens a TCP
//! connection, creates a transaction, discovers table layouts and then drives
//! a server-side cursor to stream rows back. This crate provides:
//!
//! - **Transport**: exact-read little-endian codec over any `Read + Write`
//! - **Session**: handshake, transaction lifecycle and the command primitive
//! - **Catalog**: table listing and column layouts
//! - **Records**: decoding of fixed-width binary rows into typed values
//! - **Cursors**: batch and single-row retrieval with progress callbacks
//! - **Reader**: whole-table reads through a sorted scratch table
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use qsep_client::{ClientConfig, Session};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("192.168.1.20", 4100);
//!     let mut session = Session::connect(&config)?;
//!     println!("Connected to {}", session.info().database);
//!
//!     let tables = session.catalog().list_tables()?;
//!     let products = tables.iter().find(|t| t.name == "PRODUCTS").unwrap();
//!
//!     let data = session.reader().read_table(products.index, &mut |p| {
//!         println!("{} rows so far", p.total);
//!     })?;
//!     for row in &data.rows {
//!         println!("{:?}", row.get_by_name(&data.descriptor, "SKU")?);
//!     }
//!
//!     session.finish()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency
//!
//! The protocol has no pipelining. A [`Session`] is driven by one caller at a
//! time through `&mut` borrows; parallel reads need separate sessions.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error types.
pub mod error;

/// Client configuration.
pub mod config;

/// Wire constants.
pub mod protocol;

/// Wire codec and in-memory test stream.
pub mod transport;

/// Connection and transaction lifecycle.
pub mod session;

/// Table listing and layouts.
pub mod catalog;

/// Row decoding.
pub mod record;

/// Cursor protocol.
pub mod cursor;

/// Whole-table reads.
pub mod reader;

/// Session statistics.
pub mod stats;

// Re-exports
pub use catalog::{Catalog, ColumnDescriptor, FieldType, TableDescriptor, TableInfo};
pub use config::ClientConfig;
pub use cursor::{BatchCursor, CursorState, Progress, SingleRowCursor};
pub use error::{ClientError, ClientResult, ConnectionState};
pub use protocol::Opcode;
pub use reader::{ReadMode, TableData, TableReader};
pub use record::{decode, encode_row, Record, RowDecoder, Value};
pub use session::{ConnectionInfo, FinishOutcome, Session};
pub use stats::ClientStats;
