// The data shard's streaming read engine: point, prefix, and range reads
// over a local MVCC store, with snapshot visibility, quota-based flow
// control, optimistic locks, and deterministic behavior across schema
// changes, splits, and client disconnects.

mod chunks;
mod iterator;
mod locks;
mod service;
mod shard;
mod store;

pub use chunks::{build_arrow, build_cellvec, decode_arrow};
pub use iterator::{IterState, Quota, ReadIteratorState};
pub use locks::LockTable;
pub use service::{ShardHandle, ShardService};
pub use shard::{ClientId, Outgoing, Shard, ShardConfig};
pub use store::{MemStore, ScanItem, ScanPage, TableStore, Version};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Arrow(arrow::error::ArrowError),
    #[error("cell of type {actual:?} in a column of type {expected:?}")]
    CellTypeMismatch { expected: cells::CellType, actual: Option<cells::CellType> },
}
