use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::types::{Lsn, PageId, TxnId, INVALID_LSN, INVALID_TXN_ID};

/// Error type for log record operations
#[derive(Error, Debug)]
pub enum LogRecordError {
    #[error("Failed to serialize log record: {0}")]
    SerializationError(String),

    #[error("Failed to deserialize log record: {0}")]
    DeserializationError(String),

    #[error("Invalid log record format")]
    InvalidFormat,
}

/// Result type for log record operations
pub type Result<T> = std::result::Result<T, LogRecordError>;

/// Types of log records supported by the WAL system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogRecordType {
    /// Marks the beginning of a transaction
    Begin,
    /// Marks the successful completion of a transaction
    Commit,
    /// Marks the end of a rollback; every change has been compensated
    Abort,
    /// A record placed into a page slot
    Insert,
    /// A record rewritten in its slot
    Update,
    /// A record tombstoned in its slot
    Delete,
    /// A key added to an index
    IndexInsert,
    /// A key removed from an index
    IndexDelete,
    /// Redo-only full images of pages touched by one structural change
    PageImage,
    /// Compensation record written while undoing another record
    Compensation,
    /// Marks a checkpoint in the log
    Checkpoint,
}

impl LogRecordType {
    /// Records that rollback must reverse
    pub fn is_undoable(self) -> bool {
        matches!(
            self,
            LogRecordType::Insert
                | LogRecordType::Update
                | LogRecordType::Delete
                | LogRecordType::IndexInsert
                | LogRecordType::IndexDelete
        )
    }
}

/// A change to one slot of a heap page. Which images are present decides
/// the kind: after only is an insert, before only a delete, both an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataOperationContent {
    /// Root page of the table that owns the record
    pub table_id: PageId,
    pub page_id: PageId,
    pub slot: u16,
    pub before_image: Option<Vec<u8>>,
    pub after_image: Option<Vec<u8>>,
}

impl DataOperationContent {
    pub fn kind(&self) -> LogRecordType {
        match (&self.before_image, &self.after_image) {
            (None, Some(_)) => LogRecordType::Insert,
            (Some(_), None) => LogRecordType::Delete,
            _ => LogRecordType::Update,
        }
    }

    /// The change that reverses this one
    pub fn inverse(&self) -> Self {
        Self {
            table_id: self.table_id,
            page_id: self.page_id,
            slot: self.slot,
            before_image: self.after_image.clone(),
            after_image: self.before_image.clone(),
        }
    }
}

/// A logical index change, identified by the index anchor page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOperationContent {
    pub index_id: PageId,
    pub key: Vec<u8>,
    pub value: u64,
}

/// Full page images, each the serialized 4096-byte slot without checksum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImageContent {
    pub pages: Vec<(PageId, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationContent {
    /// Next record of the transaction still to undo
    pub undo_next_lsn: Lsn,
    /// Record this compensation reverses
    pub compensated_lsn: Lsn,
    /// Heap change made by the undo; index undos are redone through page images
    pub redo: Option<DataOperationContent>,
}

/// A transaction that was active when a checkpoint was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTransaction {
    pub txn_id: TxnId,
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
}

/// Structure representing the content of a checkpoint log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointContent {
    /// Timestamp when the checkpoint occurred
    pub timestamp: u64,
    pub active_transactions: Vec<ActiveTransaction>,
    /// Dirty pages at checkpoint time (page_id, rec_lsn)
    pub dirty_pages: Vec<(PageId, Lsn)>,
}

impl CheckpointContent {
    pub fn new(active_transactions: Vec<ActiveTransaction>, dirty_pages: Vec<(PageId, Lsn)>) -> Self {
        Self {
            timestamp: unix_timestamp(),
            active_transactions,
            dirty_pages,
        }
    }
}

/// Structure representing the content of a transaction operation log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOperationContent {
    pub timestamp: u64,
}

impl TransactionOperationContent {
    pub fn now() -> Self {
        Self { timestamp: unix_timestamp() }
    }
}

/// Union of all possible log record content types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecordContent {
    Transaction(TransactionOperationContent),
    Data(DataOperationContent),
    Index(IndexOperationContent),
    PageImage(PageImageContent),
    Compensation(CompensationContent),
    Checkpoint(CheckpointContent),
}

/// Main log record structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Log Sequence Number - unique identifier for this log record
    pub lsn: Lsn,
    /// Transaction that generated this record, INVALID_TXN_ID for system records
    pub txn_id: TxnId,
    /// LSN of the previous log record in this transaction
    pub prev_lsn: Lsn,
    pub record_type: LogRecordType,
    pub content: LogRecordContent,
}

impl LogRecord {
    pub fn new(
        lsn: Lsn,
        txn_id: TxnId,
        prev_lsn: Lsn,
        record_type: LogRecordType,
        content: LogRecordContent,
    ) -> Self {
        Self {
            lsn,
            txn_id,
            prev_lsn,
            record_type,
            content,
        }
    }

    pub fn new_begin(lsn: Lsn, txn_id: TxnId) -> Self {
        Self::new(
            lsn,
            txn_id,
            INVALID_LSN,
            LogRecordType::Begin,
            LogRecordContent::Transaction(TransactionOperationContent::now()),
        )
    }

    pub fn new_commit(lsn: Lsn, txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new(
            lsn,
            txn_id,
            prev_lsn,
            LogRecordType::Commit,
            LogRecordContent::Transaction(TransactionOperationContent::now()),
        )
    }

    pub fn new_data(lsn: Lsn, txn_id: TxnId, prev_lsn: Lsn, content: DataOperationContent) -> Self {
        Self::new(lsn, txn_id, prev_lsn, content.kind(), LogRecordContent::Data(content))
    }

    pub fn new_checkpoint(
        lsn: Lsn,
        active_transactions: Vec<ActiveTransaction>,
        dirty_pages: Vec<(PageId, Lsn)>,
    ) -> Self {
        Self::new(
            lsn,
            INVALID_TXN_ID,
            INVALID_LSN,
            LogRecordType::Checkpoint,
            LogRecordContent::Checkpoint(CheckpointContent::new(active_transactions, dirty_pages)),
        )
    }

    /// Pages whose state this record changes when redone
    pub fn touched_pages(&self) -> Vec<PageId> {
        match &self.content {
            LogRecordContent::Data(data) => vec![data.page_id],
            LogRecordContent::PageImage(images) => images.pages.iter().map(|(id, _)| *id).collect(),
            LogRecordContent::Compensation(clr) => clr.redo.iter().map(|data| data.page_id).collect(),
            _ => Vec::new(),
        }
    }

    /// Serialize the log record to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self).map_err(|e| LogRecordError::SerializationError(e.to_string()))
    }

    /// Deserialize bytes into a log record
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        deserialize(data).map_err(|e| LogRecordError::DeserializationError(e.to_string()))
    }
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_content() -> DataOperationContent {
        DataOperationContent {
            table_id: 3,
            page_id: 7,
            slot: 2,
            before_image: None,
            after_image: Some(vec![7, 8, 9]),
        }
    }

    #[test]
    fn test_data_kind_follows_images() {
        let insert = insert_content();
        assert_eq!(insert.kind(), LogRecordType::Insert);

        let delete = insert.inverse();
        assert_eq!(delete.kind(), LogRecordType::Delete);
        assert_eq!(delete.before_image, Some(vec![7, 8, 9]));

        let update = DataOperationContent {
            before_image: Some(vec![1]),
            ..insert
        };
        assert_eq!(update.kind(), LogRecordType::Update);
        assert_eq!(update.inverse().after_image, Some(vec![1]));
    }

    #[test]
    fn test_compensation_record_serialization() {
        let record = LogRecord::new(
            8,
            100,
            7,
            LogRecordType::Compensation,
            LogRecordContent::Compensation(CompensationContent {
                undo_next_lsn: 4,
                compensated_lsn: 6,
                redo: Some(insert_content().inverse()),
            }),
        );
        let deserialized = LogRecord::deserialize(&record.serialize().unwrap()).unwrap();
        assert_eq!(record, deserialized);
        assert_eq!(deserialized.touched_pages(), vec![7]);
    }

    #[test]
    fn test_checkpoint_record_serialization() {
        let active = vec![ActiveTransaction { txn_id: 100, first_lsn: 3, last_lsn: 9 }];
        let record = LogRecord::new_checkpoint(12, active.clone(), vec![(4, 5), (6, 7)]);
        let deserialized = LogRecord::deserialize(&record.serialize().unwrap()).unwrap();

        match deserialized.content {
            LogRecordContent::Checkpoint(c) => {
                assert_eq!(c.active_transactions, active);
                assert_eq!(c.dirty_pages, vec![(4, 5), (6, 7)]);
            }
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn test_undoable_kinds() {
        assert!(LogRecordType::Insert.is_undoable());
        assert!(LogRecordType::IndexDelete.is_undoable());
        assert!(!LogRecordType::PageImage.is_undoable());
        assert!(!LogRecordType::Compensation.is_undoable());
        assert!(!LogRecordType::Commit.is_undoable());
    }

    #[test]
    fn test_deserialize_invalid_data() {
        let result = LogRecord::deserialize(&[1, 2, 3, 4]);
        assert!(matches!(result, Err(LogRecordError::DeserializationError(_))));

        let not_a_record = bincode::serialize(&("random_string_not_a_log_record")).unwrap();
        assert!(LogRecord::deserialize(&not_a_record).is_err());
    }
}
