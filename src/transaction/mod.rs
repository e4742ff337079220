pub mod concurrency;
pub mod recovery;
pub mod wal;

pub use concurrency::{
    ClrLogger, LockError, LockManager, LockMode, LockTarget, Transaction, TransactionError, TransactionManager,
    TransactionState, UndoHandler,
};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use wal::{LogManager, LogRecord, LogRecordType};
