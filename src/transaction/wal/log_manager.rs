use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::config::StorageConfig;
use crate::common::types::{Lsn, PageId, TxnId, INVALID_LSN, INVALID_TXN_ID};
use crate::transaction::wal::log_buffer::{encode_frame, FlushBatch, LogBuffer, LogBufferConfig};
use crate::transaction::wal::log_file::{find_segments, read_frame, segment_path, FrameRead, SegmentHeader};
use crate::transaction::wal::log_iterator::LogRecordIterator;
use crate::transaction::wal::log_record::{
    ActiveTransaction, CheckpointContent, LogRecord, LogRecordContent, LogRecordError, LogRecordType,
};

/// Error type for log manager operations
#[derive(Error, Debug)]
pub enum LogManagerError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Log record error: {0}")]
    LogRecordError(#[from] LogRecordError),

    #[error("Invalid log file format: {0}")]
    InvalidFormat(String),

    #[error("Corrupted log record in segment {segment} at offset {offset}")]
    Corrupted { segment: u64, offset: u64 },

    #[error("Invalid log state: {0}")]
    InvalidState(String),

    #[error("Write-ahead log stopped after a failed write; reopen the store to recover")]
    Failed,
}

/// Result type for log manager operations
pub type Result<T> = std::result::Result<T, LogManagerError>;

/// Configuration for the log manager
#[derive(Debug, Clone)]
pub struct LogManagerConfig {
    /// Path to the log directory
    pub log_dir: PathBuf,

    /// Base name for segment files; segment n is `<base>.<n>`
    pub log_file_base_name: String,

    /// Size at which the active segment is closed and a new one started
    pub max_log_file_size: u64,

    pub buffer_config: LogBufferConfig,

    /// Whether a flush also forces the data to stable storage
    pub force_sync: bool,
}

impl Default for LogManagerConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("wal"),
            log_file_base_name: "quarry.log".to_string(),
            max_log_file_size: 16 * 1024 * 1024,
            buffer_config: LogBufferConfig::default(),
            force_sync: true,
        }
    }
}

impl From<&StorageConfig> for LogManagerConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            log_dir: config.wal_directory(),
            log_file_base_name: "quarry.log".to_string(),
            max_log_file_size: config.log_segment_size,
            buffer_config: LogBufferConfig {
                buffer_size: config.log_buffer_size,
            },
            force_sync: config.sync_on_commit,
        }
    }
}

/// LSN counter and the in-memory tail of the log
struct LogState {
    next_lsn: Lsn,
    buffer: LogBuffer,
}

/// The active segment file
struct SegmentWriter {
    file: File,
    segment: u64,
    size: u64,
    /// Highest LSN written to a segment, synced or not
    written_lsn: Lsn,
}

/// Write-ahead log manager.
///
/// `append_log_record` assigns LSNs under a single mutex so log order is
/// append order. Buffered frames reach the segment files on `flush_till_lsn`
/// or when the buffer fills; writes are serialized by the writer mutex,
/// which is always taken after the state mutex.
///
/// A failed write loses the frames of its batch, whose LSNs are already
/// handed out. The manager then refuses every further append and flush so
/// nothing is acknowledged past the hole; restart recovery picks up from
/// what reached the segments.
pub struct LogManager {
    config: LogManagerConfig,
    state: Mutex<LogState>,
    writer: Mutex<SegmentWriter>,
    /// Highest LSN known to be written (and synced, with `force_sync`)
    flushed_lsn: AtomicU64,
    failed: AtomicBool,
}

impl LogManager {
    /// Open the log in `config.log_dir`, creating the first segment if none
    /// exists. A torn tail in the last segment is truncated.
    pub fn new(config: LogManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.log_dir)?;
        let segments = find_segments(&config.log_dir, &config.log_file_base_name)?;

        let (writer, last_lsn) = match segments.last() {
            None => {
                let writer = Self::create_segment(&config, 1, 1)?;
                (writer, INVALID_LSN)
            }
            Some((segment, path)) => Self::open_segment(*segment, path)?,
        };

        info!(
            "Opened write-ahead log in {} at segment {}, last LSN {}",
            config.log_dir.display(),
            writer.segment,
            last_lsn
        );

        Ok(Self {
            state: Mutex::new(LogState {
                next_lsn: last_lsn + 1,
                buffer: LogBuffer::new(config.buffer_config.clone()),
            }),
            writer: Mutex::new(writer),
            flushed_lsn: AtomicU64::new(last_lsn),
            failed: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &LogManagerConfig {
        &self.config
    }

    /// Append a record and return its LSN. The record is durable only after
    /// `flush_till_lsn` covers it.
    pub fn append_log_record(
        &self,
        txn_id: TxnId,
        prev_lsn: Lsn,
        record_type: LogRecordType,
        content: LogRecordContent,
    ) -> Result<Lsn> {
        let mut state = self.state.lock();
        self.check_usable()?;
        let lsn = state.next_lsn;
        let record = LogRecord::new(lsn, txn_id, prev_lsn, record_type, content);
        let frame = encode_frame(&record)?;
        state.next_lsn += 1;

        if state.buffer.append(lsn, &frame) {
            let batch = state.buffer.take();
            let mut writer = self.writer.lock();
            drop(state);
            self.write_batch(&mut writer, batch, false)?;
        }
        Ok(lsn)
    }

    /// Make every record up to `target_lsn` durable
    pub fn flush_till_lsn(&self, target_lsn: Lsn) -> Result<()> {
        if target_lsn == INVALID_LSN || target_lsn <= self.flushed_lsn() {
            return Ok(());
        }
        self.flush().map(|_| ())
    }

    /// Write and sync everything appended so far. Returns the flushed LSN.
    pub fn flush(&self) -> Result<Lsn> {
        let mut state = self.state.lock();
        self.check_usable()?;
        let batch = state.buffer.take();
        let mut writer = self.writer.lock();
        drop(state);
        self.write_batch(&mut writer, batch, true)?;
        Ok(self.flushed_lsn())
    }

    /// Last LSN handed out
    pub fn current_lsn(&self) -> Lsn {
        self.state.lock().next_lsn - 1
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }

    /// Whether a write failure has stopped the log
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn check_usable(&self) -> Result<()> {
        if self.has_failed() {
            return Err(LogManagerError::Failed);
        }
        Ok(())
    }

    /// Append a checkpoint record and flush it
    pub fn checkpoint(&self, active_txns: Vec<ActiveTransaction>, dirty_pages: Vec<(PageId, Lsn)>) -> Result<Lsn> {
        let lsn = self.append_log_record(
            INVALID_TXN_ID,
            INVALID_LSN,
            LogRecordType::Checkpoint,
            LogRecordContent::Checkpoint(CheckpointContent::new(active_txns, dirty_pages)),
        )?;
        self.flush_till_lsn(lsn)?;
        Ok(lsn)
    }

    /// Iterate over every record with LSN >= `from_lsn`, oldest first.
    /// Buffered records are written out first so they are included.
    pub fn replay(&self, from_lsn: Lsn) -> Result<LogRecordIterator> {
        self.flush()?;
        let segments = find_segments(&self.config.log_dir, &self.config.log_file_base_name)?;
        Ok(LogRecordIterator::new(segments, from_lsn))
    }

    /// Delete whole segments whose records all precede `lsn`. The active
    /// segment is never removed. Returns the number of segments deleted.
    pub fn truncate_before(&self, lsn: Lsn) -> Result<usize> {
        let writer = self.writer.lock();
        let segments = find_segments(&self.config.log_dir, &self.config.log_file_base_name)?;

        let mut removed = 0;
        for window in segments.windows(2) {
            let (segment, path) = &window[0];
            let (_, next_path) = &window[1];
            if *segment >= writer.segment {
                break;
            }
            let next_first = SegmentHeader::read_from(&mut File::open(next_path)?)?.first_lsn;
            if next_first > lsn {
                break;
            }
            std::fs::remove_file(path)?;
            removed += 1;
        }
        if removed > 0 {
            info!("Removed {} log segments before LSN {}", removed, lsn);
        }
        Ok(removed)
    }

    pub fn segment_count(&self) -> Result<usize> {
        Ok(find_segments(&self.config.log_dir, &self.config.log_file_base_name)?.len())
    }

    /// Write a batch, stopping the log if any part of it fails
    fn write_batch(&self, writer: &mut SegmentWriter, batch: FlushBatch, sync: bool) -> Result<()> {
        // A batch taken before an earlier failure must not land after the hole
        self.check_usable()?;
        let (first_lsn, last_lsn) = (batch.first_lsn, batch.last_lsn);
        let result = self.write_batch_inner(writer, batch, sync);
        if let Err(e) = &result {
            self.failed.store(true, Ordering::SeqCst);
            error!("Write-ahead log stopped: writing LSNs {}..={} failed: {}", first_lsn, last_lsn, e);
        }
        result
    }

    fn write_batch_inner(&self, writer: &mut SegmentWriter, batch: FlushBatch, sync: bool) -> Result<()> {
        if !batch.data.is_empty() {
            if writer.size > SegmentHeader::SIZE
                && writer.size + batch.data.len() as u64 > self.config.max_log_file_size
            {
                self.roll_segment(writer, batch.first_lsn)?;
            }
            writer.file.seek(SeekFrom::Start(writer.size))?;
            writer.file.write_all(&batch.data)?;
            writer.size += batch.data.len() as u64;
        }

        writer.written_lsn = writer.written_lsn.max(batch.last_lsn);

        if sync && self.config.force_sync {
            writer.file.sync_data()?;
        }
        if sync || !self.config.force_sync {
            self.flushed_lsn.fetch_max(writer.written_lsn, Ordering::SeqCst);
        }
        Ok(())
    }

    fn roll_segment(&self, writer: &mut SegmentWriter, first_lsn: Lsn) -> Result<()> {
        writer.file.sync_data()?;
        let mut next = Self::create_segment(&self.config, writer.segment + 1, first_lsn)?;
        next.written_lsn = writer.written_lsn;
        debug!("Rolled log to segment {} at LSN {}", next.segment, first_lsn);
        *writer = next;
        Ok(())
    }

    fn create_segment(config: &LogManagerConfig, segment: u64, first_lsn: Lsn) -> Result<SegmentWriter> {
        let path = segment_path(&config.log_dir, &config.log_file_base_name, segment);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        SegmentHeader::new(segment, first_lsn).write_to(&mut file)?;
        file.sync_all()?;
        Ok(SegmentWriter {
            file,
            segment,
            size: SegmentHeader::SIZE,
            written_lsn: first_lsn.saturating_sub(1),
        })
    }

    /// Open the last segment, scanning it to find the highest LSN and
    /// cutting off anything after the last intact frame
    fn open_segment(segment: u64, path: &Path) -> Result<(SegmentWriter, Lsn)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let header = SegmentHeader::read_from(&mut file)
            .map_err(|_| LogManagerError::InvalidFormat(format!("truncated header in {}", path.display())))?;
        if !header.validate() || header.segment != segment {
            return Err(LogManagerError::InvalidFormat(format!("bad header in {}", path.display())));
        }

        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(SegmentHeader::SIZE))?;

        let mut end = SegmentHeader::SIZE;
        let mut last_lsn = header.first_lsn.saturating_sub(1);
        loop {
            match read_frame(&mut reader)? {
                FrameRead::Record(record, len) => {
                    last_lsn = last_lsn.max(record.lsn);
                    end += len;
                }
                FrameRead::End => break,
                FrameRead::Torn => {
                    warn!(
                        "Truncating torn log tail in segment {}: {} bytes after offset {}",
                        segment,
                        file_len - end,
                        end
                    );
                    file.set_len(end)?;
                    file.sync_all()?;
                    break;
                }
            }
        }

        let writer = SegmentWriter {
            file,
            segment,
            size: end,
            written_lsn: last_lsn,
        };
        Ok((writer, last_lsn))
    }
}
