use super::status::Status;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ResultFormat {
    Unspecified = 0,
    CellVec = 1,
    Arrow = 2,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct TableId {
    #[prost(uint64, tag = "1")]
    pub owner_id: u64,
    #[prost(uint64, tag = "2")]
    pub table_id: u64,
    #[prost(uint64, tag = "3")]
    pub schema_version: u64,
}

/// A consistent point-in-time view. (0, 0) is the unset sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Message)]
pub struct Snapshot {
    #[prost(uint64, tag = "1")]
    pub step: u64,
    #[prost(uint64, tag = "2")]
    pub tx_id: u64,
}

impl Snapshot {
    pub fn new(step: u64, tx_id: u64) -> Self {
        Self { step, tx_id }
    }

    pub fn is_valid(&self) -> bool {
        self.step != 0 || self.tx_id != 0
    }
}

/// An optimistic lock as reported by a shard. Two locks with the same
/// (lock_id, path) but different (generation, counter) are broken relative
/// to one another.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct Lock {
    #[prost(uint64, tag = "1")]
    pub lock_id: u64,
    #[prost(uint64, tag = "2")]
    pub data_shard: u64,
    #[prost(uint32, tag = "3")]
    pub generation: u32,
    #[prost(uint64, tag = "4")]
    pub counter: u64,
    #[prost(uint64, tag = "5")]
    pub scheme_shard: u64,
    #[prost(uint64, tag = "6")]
    pub path_id: u64,
}

/// One key range of a read, with cellvec-encoded bounds.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadRange {
    #[prost(bytes = "vec", tag = "1")]
    pub from: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub to: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "3")]
    pub from_inclusive: bool,
    #[prost(bool, tag = "4")]
    pub to_inclusive: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadRequest {
    #[prost(uint64, tag = "1")]
    pub read_id: u64,
    #[prost(message, optional, tag = "2")]
    pub table: ::core::option::Option<TableId>,
    #[prost(uint32, repeated, tag = "3")]
    pub columns: ::prost::alloc::vec::Vec<u32>,
    #[prost(message, optional, tag = "4")]
    pub snapshot: ::core::option::Option<Snapshot>,
    #[prost(enumeration = "ResultFormat", tag = "5")]
    pub result_format: i32,
    #[prost(bool, tag = "6")]
    pub reverse: bool,
    #[prost(uint64, tag = "7")]
    pub max_rows: u64,
    #[prost(uint64, tag = "8")]
    pub max_bytes: u64,
    #[prost(uint64, tag = "9")]
    pub max_rows_in_result: u64,
    #[prost(uint64, optional, tag = "10")]
    pub lock_tx_id: ::core::option::Option<u64>,
    /// Cellvec-encoded point keys, full or prefix arity.
    #[prost(bytes = "vec", repeated, tag = "11")]
    pub keys: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(message, repeated, tag = "12")]
    pub ranges: ::prost::alloc::vec::Vec<ReadRange>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadResult {
    #[prost(uint64, tag = "1")]
    pub read_id: u64,
    /// Strictly increasing, gapless per read_id.
    #[prost(uint64, tag = "2")]
    pub seq_no: u64,
    #[prost(bool, tag = "3")]
    pub finished: bool,
    /// Set when this chunk exhausted the read quota.
    #[prost(bool, tag = "4")]
    pub limit_reached: bool,
    #[prost(uint32, tag = "5")]
    pub rows_count: u32,
    #[prost(enumeration = "ResultFormat", tag = "6")]
    pub result_format: i32,
    /// One cellvec-encoded row per entry, CellVec format only.
    #[prost(bytes = "vec", repeated, tag = "7")]
    pub cells: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    /// An IPC-encoded record batch, Arrow format only.
    #[prost(bytes = "vec", tag = "8")]
    pub arrow_batch: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, repeated, tag = "9")]
    pub tx_locks: ::prost::alloc::vec::Vec<Lock>,
    #[prost(message, repeated, tag = "10")]
    pub broken_tx_locks: ::prost::alloc::vec::Vec<Lock>,
    #[prost(message, optional, tag = "11")]
    pub status: ::core::option::Option<Status>,
    /// Cellvec-encoded last processed key, for diagnostics and resumption.
    #[prost(bytes = "vec", tag = "12")]
    pub continuation_token: ::prost::alloc::vec::Vec<u8>,
}

impl ReadResult {
    pub fn status_code(&self) -> super::StatusCode {
        self.status.as_ref().map(|s| s.code()).unwrap_or(super::StatusCode::Unspecified)
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ReadAck {
    #[prost(uint64, tag = "1")]
    pub read_id: u64,
    #[prost(uint64, tag = "2")]
    pub seq_no: u64,
    #[prost(uint64, tag = "3")]
    pub max_rows: u64,
    #[prost(uint64, tag = "4")]
    pub max_bytes: u64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ReadCancel {
    #[prost(uint64, tag = "1")]
    pub read_id: u64,
}
