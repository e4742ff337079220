use std::fs::File;
use std::io::{self, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::warn;

use crate::common::types::Lsn;
use crate::transaction::wal::log_file::{read_frame, FrameRead, SegmentHeader};
use crate::transaction::wal::log_manager::{LogManagerError, Result};
use crate::transaction::wal::log_record::LogRecord;

/// Lazy forward iterator over the log, one segment open at a time.
/// Yields records with LSN >= the starting LSN.
pub struct LogRecordIterator {
    segments: Vec<(u64, PathBuf)>,
    /// Index of the next segment to open
    next_segment: usize,
    current: Option<OpenSegment>,
    start_lsn: Lsn,
    done: bool,
}

struct OpenSegment {
    segment: u64,
    reader: BufReader<File>,
    offset: u64,
    is_last: bool,
}

impl LogRecordIterator {
    pub fn new(segments: Vec<(u64, PathBuf)>, start_lsn: Lsn) -> Self {
        Self {
            segments,
            next_segment: 0,
            current: None,
            start_lsn,
            done: false,
        }
    }

    /// Open the next segment that can hold records at or after the start LSN
    fn open_next(&mut self) -> Result<bool> {
        while self.next_segment < self.segments.len() {
            let index = self.next_segment;
            self.next_segment += 1;
            let is_last = index + 1 == self.segments.len();

            if !is_last {
                let next_first = match read_header(&self.segments[index + 1].1)? {
                    Some(header) => header.first_lsn,
                    None => continue,
                };
                if next_first <= self.start_lsn {
                    continue;
                }
            }

            let (segment, path) = &self.segments[index];
            let file = match File::open(path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let mut reader = BufReader::new(file);
            let header = SegmentHeader::read_from(&mut reader)?;
            if !header.validate() {
                return Err(LogManagerError::InvalidFormat(format!("bad header in {}", path.display())));
            }
            reader.seek(SeekFrom::Start(SegmentHeader::SIZE))?;
            self.current = Some(OpenSegment {
                segment: *segment,
                reader,
                offset: SegmentHeader::SIZE,
                is_last,
            });
            return Ok(true);
        }
        Ok(false)
    }

    fn next_record(&mut self) -> Result<Option<LogRecord>> {
        loop {
            if self.current.is_none() && !self.open_next()? {
                return Ok(None);
            }
            let Some(open) = self.current.as_mut() else {
                return Ok(None);
            };

            match read_frame(&mut open.reader)? {
                FrameRead::Record(record, len) => {
                    open.offset += len;
                    if record.lsn >= self.start_lsn {
                        return Ok(Some(record));
                    }
                }
                FrameRead::End => self.current = None,
                FrameRead::Torn if open.is_last => {
                    warn!("Log replay stopped at torn frame in segment {} offset {}", open.segment, open.offset);
                    return Ok(None);
                }
                FrameRead::Torn => {
                    return Err(LogManagerError::Corrupted {
                        segment: open.segment,
                        offset: open.offset,
                    });
                }
            }
        }
    }
}

impl Iterator for LogRecordIterator {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn read_header(path: &Path) -> Result<Option<SegmentHeader>> {
    match File::open(path) {
        Ok(mut file) => Ok(Some(SegmentHeader::read_from(&mut file)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_LSN;
    use crate::transaction::wal::log_manager::{LogManager, LogManagerConfig};
    use crate::transaction::wal::log_record::{LogRecordContent, LogRecordType, TransactionOperationContent};
    use std::io::Write;

    #[test]
    fn test_replay_skips_earlier_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogManager::new(LogManagerConfig {
            log_dir: dir.path().to_path_buf(),
            ..LogManagerConfig::default()
        })
        .unwrap();

        for txn in 1..=5 {
            log.append_log_record(
                txn,
                INVALID_LSN,
                LogRecordType::Begin,
                LogRecordContent::Transaction(TransactionOperationContent::now()),
            )
            .unwrap();
        }

        let txns: Vec<u64> = log.replay(3).unwrap().map(|r| r.unwrap().txn_id).collect();
        assert_eq!(txns, vec![3, 4, 5]);
    }

    #[test]
    fn test_corrupt_middle_segment_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogManagerConfig {
            log_dir: dir.path().to_path_buf(),
            max_log_file_size: 128,
            buffer_config: crate::transaction::wal::log_buffer::LogBufferConfig { buffer_size: 1 },
            ..LogManagerConfig::default()
        };
        let log = LogManager::new(config.clone()).unwrap();
        for txn in 1..=6 {
            log.append_log_record(
                txn,
                INVALID_LSN,
                LogRecordType::Begin,
                LogRecordContent::Transaction(TransactionOperationContent::now()),
            )
            .unwrap();
        }
        log.flush().unwrap();

        let first = crate::transaction::wal::log_file::segment_path(dir.path(), &config.log_file_base_name, 1);
        let mut file = std::fs::OpenOptions::new().append(true).open(first).unwrap();
        file.write_all(&[0xAB; 12]).unwrap();

        let results: Vec<_> = log.replay(1).unwrap().collect();
        assert!(matches!(results.last(), Some(Err(LogManagerError::Corrupted { segment: 1, .. }))));
    }
}
