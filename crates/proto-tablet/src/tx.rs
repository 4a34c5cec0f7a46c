use super::read::{Lock, ReadRange, Snapshot, TableId};

/// Outcome of a shard proposal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProposeStatus {
    Unspecified = 0,
    Prepared = 1,
    Complete = 2,
    Overloaded = 3,
    Aborted = 4,
    TryLater = 5,
    ResultUnavailable = 6,
    Cancelled = 7,
    BadRequest = 8,
    ExecError = 9,
    Error = 10,
    LocksBroken = 11,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ShardErrorKind {
    Unspecified = 0,
    ProgramError = 1,
    SchemeError = 2,
    SchemeChanged = 3,
    WrongShardState = 4,
    ReadSizeExceeded = 5,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShardError {
    #[prost(enumeration = "ShardErrorKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub reason: ::prost::alloc::string::String,
}

/// What a transaction does with the locks it carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum LocksOp {
    Unspecified = 0,
    Commit = 1,
    Validate = 2,
    Rollback = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TxLocks {
    #[prost(enumeration = "LocksOp", tag = "1")]
    pub op: i32,
    #[prost(message, repeated, tag = "2")]
    pub locks: ::prost::alloc::vec::Vec<Lock>,
    #[prost(uint64, repeated, tag = "3")]
    pub sending_shards: ::prost::alloc::vec::Vec<u64>,
    #[prost(uint64, repeated, tag = "4")]
    pub receiving_shards: ::prost::alloc::vec::Vec<u64>,
}

/// Reads a shard-bound task performs, pruned to the shard's key space.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadTaskMeta {
    #[prost(message, repeated, tag = "1")]
    pub ranges: ::prost::alloc::vec::Vec<ReadRange>,
    #[prost(uint32, repeated, tag = "2")]
    pub columns: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint64, tag = "3")]
    pub items_limit: u64,
    #[prost(bool, tag = "4")]
    pub reverse: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ColumnWriteMeta {
    #[prost(uint32, tag = "1")]
    pub column_id: u32,
    #[prost(uint64, tag = "2")]
    pub max_value_size_bytes: u64,
}

/// Writes a shard-bound task performs. Point writes are degenerate ranges.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteTaskMeta {
    #[prost(message, repeated, tag = "1")]
    pub ranges: ::prost::alloc::vec::Vec<ReadRange>,
    #[prost(bool, tag = "2")]
    pub is_pure_erase: bool,
    #[prost(message, repeated, tag = "3")]
    pub columns: ::prost::alloc::vec::Vec<ColumnWriteMeta>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelDesc {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub src_task: u64,
    /// Zero addresses the executer's result collector.
    #[prost(uint64, tag = "3")]
    pub dst_task: u64,
    #[prost(bool, tag = "4")]
    pub in_memory: bool,
    #[prost(bool, tag = "5")]
    pub persistent: bool,
    #[prost(uint32, tag = "6")]
    pub dst_input_index: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskDesc {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint32, tag = "2")]
    pub stage_id: u32,
    #[prost(message, optional, tag = "3")]
    pub table: ::core::option::Option<TableId>,
    #[prost(message, repeated, tag = "4")]
    pub reads: ::prost::alloc::vec::Vec<ReadTaskMeta>,
    #[prost(message, optional, tag = "5")]
    pub writes: ::core::option::Option<WriteTaskMeta>,
    #[prost(bytes = "vec", tag = "6")]
    pub program: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, repeated, tag = "7")]
    pub inputs: ::prost::alloc::vec::Vec<ChannelDesc>,
    #[prost(message, repeated, tag = "8")]
    pub outputs: ::prost::alloc::vec::Vec<ChannelDesc>,
}

/// The per-shard transaction body carried by a proposal.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataTxBody {
    #[prost(message, repeated, tag = "1")]
    pub tasks: ::prost::alloc::vec::Vec<TaskDesc>,
    #[prost(message, optional, tag = "2")]
    pub locks: ::core::option::Option<TxLocks>,
    #[prost(bool, tag = "3")]
    pub read_only: bool,
    #[prost(bool, tag = "4")]
    pub immediate: bool,
    #[prost(uint64, optional, tag = "5")]
    pub lock_tx_id: ::core::option::Option<u64>,
    #[prost(uint32, tag = "6")]
    pub lock_node_id: u32,
    #[prost(uint64, tag = "7")]
    pub timeout_ms: u64,
    #[prost(uint64, tag = "8")]
    pub cancel_after_ms: u64,
    #[prost(uint64, tag = "9")]
    pub per_shard_keys_size_limit: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProposeDataTx {
    #[prost(uint64, tag = "1")]
    pub tx_id: u64,
    #[prost(message, optional, tag = "2")]
    pub body: ::core::option::Option<DataTxBody>,
    /// Set for read-only proposals against an acquired snapshot.
    #[prost(message, optional, tag = "3")]
    pub snapshot: ::core::option::Option<Snapshot>,
    #[prost(bool, tag = "4")]
    pub immediate: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProposeResult {
    /// The responding shard.
    #[prost(uint64, tag = "1")]
    pub origin: u64,
    #[prost(uint64, tag = "2")]
    pub tx_id: u64,
    #[prost(enumeration = "ProposeStatus", tag = "3")]
    pub status: i32,
    #[prost(message, repeated, tag = "4")]
    pub errors: ::prost::alloc::vec::Vec<ShardError>,
    #[prost(uint64, tag = "5")]
    pub min_step: u64,
    #[prost(uint64, tag = "6")]
    pub max_step: u64,
    #[prost(uint64, tag = "7")]
    pub read_size: u64,
    /// Coordinators of the shard's domain; all shards of one domain agree.
    #[prost(uint64, repeated, tag = "8")]
    pub domain_coordinators: ::prost::alloc::vec::Vec<u64>,
    #[prost(message, repeated, tag = "9")]
    pub tx_locks: ::prost::alloc::vec::Vec<Lock>,
    #[prost(bytes = "vec", tag = "10")]
    pub tx_result: ::prost::alloc::vec::Vec<u8>,
}

/// Re-binds the executer to a prepared transaction after a pipe loss.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ProposeAttach {
    #[prost(uint64, tag = "1")]
    pub tx_id: u64,
    #[prost(uint64, tag = "2")]
    pub shard_id: u64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ProposeAttachResult {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
    #[prost(uint64, tag = "2")]
    pub tx_id: u64,
    /// True when the transaction still exists at the shard.
    #[prost(bool, tag = "3")]
    pub ok: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct CancelProposal {
    #[prost(uint64, tag = "1")]
    pub tx_id: u64,
}

/// Notification that the shard restarted while holding the transaction.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ProposeRestart {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
    #[prost(uint64, tag = "2")]
    pub tx_id: u64,
}

pub const AFFECTED_READ: u32 = 1;
pub const AFFECTED_WRITE: u32 = 2;

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct AffectedShard {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
    #[prost(uint32, tag = "2")]
    pub flags: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CoordinatorPropose {
    #[prost(uint64, tag = "1")]
    pub coordinator_id: u64,
    #[prost(uint64, tag = "2")]
    pub tx_id: u64,
    #[prost(uint64, tag = "3")]
    pub min_step: u64,
    #[prost(uint64, tag = "4")]
    pub max_step: u64,
    #[prost(message, repeated, tag = "5")]
    pub affected: ::prost::alloc::vec::Vec<AffectedShard>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum CoordinatorStatusCode {
    Unspecified = 0,
    Accepted = 1,
    Processed = 2,
    Confirmed = 3,
    Planned = 4,
    Outdated = 5,
    Declined = 6,
    DeclinedNoSpace = 7,
    Restarting = 8,
    Unknown = 9,
    Aborted = 10,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct CoordinatorStatus {
    #[prost(enumeration = "CoordinatorStatusCode", tag = "1")]
    pub status: i32,
    #[prost(uint64, tag = "2")]
    pub tx_id: u64,
    #[prost(uint64, tag = "3")]
    pub step: u64,
}

