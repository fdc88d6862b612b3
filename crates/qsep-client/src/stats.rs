//! Session statistics.

/// Statistics about session usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Commands written, including quit.
    pub commands_sent: u64,
    /// Bytes written to the socket.
    pub bytes_written: u64,
    /// Bytes consumed from the socket, greeting included.
    pub bytes_read: u64,
    /// Scratch tables created.
    pub tables_opened: u64,
    /// Multi-row fetches completed.
    pub batches_read: u64,
    /// Rows decoded by either cursor mode.
    pub rows_decoded: u64,
}

impl ClientStats {
    /// Average rows per completed batch.
    pub fn avg_batch_len(&self) -> f64 {
        if self.batches_read == 0 {
            0.0
        } else {
            self.rows_decoded as f64 / self.batches_read as f64
        }
    }
}
