pub mod lock_manager;
pub mod transaction;
pub mod transaction_manager;

pub use lock_manager::{LockError, LockManager, LockMode, LockTarget};
pub use transaction::{Transaction, TransactionError, TransactionState};
pub use transaction_manager::{ClrLogger, TransactionManager, UndoHandler};
