use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Lsn, INVALID_LSN};
use crate::transaction::wal::log_record::{LogRecord, Result};

/// Size of the frame prefix: payload length then CRC-32 of the payload
pub const FRAME_HEADER_SIZE: usize = 8;

/// Configuration for log buffer behavior
#[derive(Debug, Clone)]
pub struct LogBufferConfig {
    /// Bytes buffered before an append triggers a write to the log file
    pub buffer_size: usize,
}

impl Default for LogBufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
        }
    }
}

/// Encode a record into its on-disk frame
pub fn encode_frame(record: &LogRecord) -> Result<Vec<u8>> {
    let payload = record.serialize()?;
    let mut frame = vec![0u8; FRAME_HEADER_SIZE + payload.len()];
    LittleEndian::write_u32(&mut frame[0..4], payload.len() as u32);
    LittleEndian::write_u32(&mut frame[4..8], crc32fast::hash(&payload));
    frame[FRAME_HEADER_SIZE..].copy_from_slice(&payload);
    Ok(frame)
}

/// Log records appended in memory but not yet handed to the log file.
/// Frames are stored back to back in LSN order.
#[derive(Debug)]
pub struct LogBuffer {
    data: Vec<u8>,
    config: LogBufferConfig,
    /// Lowest and highest LSN in the buffer
    min_lsn: Lsn,
    max_lsn: Lsn,
    records: usize,
}

/// Frames taken out of the buffer for writing
#[derive(Debug)]
pub struct FlushBatch {
    pub data: Vec<u8>,
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
}

impl LogBuffer {
    pub fn new(config: LogBufferConfig) -> Self {
        Self {
            data: Vec::with_capacity(config.buffer_size),
            config,
            min_lsn: INVALID_LSN,
            max_lsn: INVALID_LSN,
            records: 0,
        }
    }

    /// Append an encoded frame. Returns true once the buffer has reached its
    /// configured size and should be written out.
    pub fn append(&mut self, lsn: Lsn, frame: &[u8]) -> bool {
        self.data.extend_from_slice(frame);
        if self.min_lsn == INVALID_LSN {
            self.min_lsn = lsn;
        }
        self.max_lsn = self.max_lsn.max(lsn);
        self.records += 1;
        self.data.len() >= self.config.buffer_size
    }

    /// Hand the buffered frames to the caller, leaving the buffer empty
    pub fn take(&mut self) -> FlushBatch {
        let data = std::mem::replace(&mut self.data, Vec::with_capacity(self.config.buffer_size));
        self.records = 0;
        FlushBatch {
            data,
            first_lsn: std::mem::replace(&mut self.min_lsn, INVALID_LSN),
            last_lsn: std::mem::replace(&mut self.max_lsn, INVALID_LSN),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn max_lsn(&self) -> Lsn {
        self.max_lsn
    }

    /// Fraction of the configured size in use
    pub fn utilization(&self) -> f32 {
        self.data.len() as f32 / self.config.buffer_size as f32
    }
}
