pub mod retry;
pub mod sender;

pub use retry::{PendingTask, RetryQueue, RetryWorker, TaskKind};
pub use sender::FileSender;
