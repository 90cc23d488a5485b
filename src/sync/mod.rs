pub mod engine;
pub mod oplog;

pub use engine::SyncEngine;
pub use oplog::{OpKind, OpLog, Operation};
