use cells::{KeyRange, OwnedKey, TableSchema};
use proto_tablet::{Lock, Snapshot};
use std::time::Duration;

/// How a stage consumes the output of an upstream stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionKind {
    UnionAll,
    Map,
    HashShuffle,
    Broadcast,
    Merge,
    /// Reuse the upstream stage's shard assignment (effects after reads).
    MapShard,
}

#[derive(Clone, Debug)]
pub struct Connection {
    pub kind: ConnectionKind,
    pub stage_index: usize,
}

#[derive(Clone, Debug)]
pub struct WriteRow {
    pub key: OwnedKey,
    /// (column id, cell) pairs for non-key columns.
    pub columns: Vec<(u32, cells::Cell)>,
}

/// A table operation of a stage, already bound to concrete keys or ranges.
#[derive(Clone, Debug)]
pub enum TableOp {
    ReadRange { range: KeyRange, columns: Vec<u32>, items_limit: u64, reverse: bool },
    ReadRanges { ranges: Vec<KeyRange>, columns: Vec<u32>, items_limit: u64, reverse: bool },
    Lookup { keys: Vec<OwnedKey>, columns: Vec<u32> },
    UpsertRows { rows: Vec<WriteRow> },
    DeleteRows { keys: Vec<OwnedKey> },
}

impl TableOp {
    pub fn is_write(&self) -> bool {
        matches!(self, TableOp::UpsertRows { .. } | TableOp::DeleteRows { .. })
    }
}

/// One stage of a physical transaction: a program plus its inputs and
/// optional table operations, all against a single table.
#[derive(Clone, Debug)]
pub struct Stage {
    pub program: Vec<u8>,
    pub inputs: Vec<Connection>,
    /// Table path the ops below apply to; empty for pure compute stages.
    pub table: String,
    pub table_ops: Vec<TableOp>,
    pub is_effects: bool,
}

impl Stage {
    pub fn compute(program: &[u8], inputs: Vec<Connection>) -> Self {
        Stage {
            program: program.to_vec(),
            inputs,
            table: String::new(),
            table_ops: Vec::new(),
            is_effects: false,
        }
    }
}

/// A physical transaction: a DAG of stages plus the stages whose outputs
/// form the transaction's result sets.
#[derive(Clone, Debug, Default)]
pub struct PhysicalTx {
    pub stages: Vec<Stage>,
    pub results: Vec<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct PhysicalQuery {
    pub transactions: Vec<PhysicalTx>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationLevel {
    Serializable,
    OnlineRo,
    /// OnlineRo with inconsistent reads allowed: forces immediate execution.
    ReadUncommitted,
    StaleRo,
    SnapshotRo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatsMode {
    None,
    Basic,
    Full,
}

/// Whether a table is a user table or a virtual system view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    User,
    SysView,
}

/// One partition of a sharded table: the owning shard and the exclusive
/// upper bound of its key range (None for the last partition).
#[derive(Clone, Debug)]
pub struct Partition {
    pub shard_id: u64,
    pub end_key: Option<OwnedKey>,
}

/// Resolved metadata of one table referenced by the plan.
#[derive(Clone, Debug)]
pub struct TableMeta {
    pub path: String,
    pub table: proto_tablet::TableId,
    pub schema: TableSchema,
    pub kind: TableKind,
    pub partitions: Vec<Partition>,
}

/// Per-request limits, from the request itself.
#[derive(Clone, Debug)]
pub struct RequestLimits {
    pub max_compute_actors: u32,
    pub max_affected_shards: u32,
    pub per_shard_keys_size_limit: u64,
    pub total_read_size_limit: u64,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_compute_actors: 10_000,
            max_affected_shards: 0,
            per_shard_keys_size_limit: 0,
            total_read_size_limit: 0,
        }
    }
}

/// Cluster-operator knobs, merged with request limits at validation time.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestControls {
    pub per_request_data_size_limit: u64,
    pub max_shard_count: u32,
    pub enable_mvcc_snapshot_reads: bool,
    #[serde(with = "humantime_serde")]
    pub default_operation_timeout: Duration,
}

impl Default for RequestControls {
    fn default() -> Self {
        Self {
            per_request_data_size_limit: 256 << 20,
            max_shard_count: 0,
            enable_mvcc_snapshot_reads: true,
            default_operation_timeout: Duration::from_secs(300),
        }
    }
}

/// A request to execute a physical query.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub database: String,
    pub query: PhysicalQuery,
    pub isolation: IsolationLevel,
    pub snapshot: Snapshot,
    /// Some(0) allocates a fresh lock from this transaction's id.
    pub acquire_locks_tx_id: Option<u64>,
    pub validate_locks: bool,
    pub erase_locks: bool,
    /// Locks taken by prior reads of the same transaction, per shard.
    pub locks: Vec<Lock>,
    pub operation_timeout: Duration,
    pub cancel_after: Option<Duration>,
    pub limits: RequestLimits,
    pub stats_mode: StatsMode,
}

impl ExecutionRequest {
    pub fn read_query(database: &str, query: PhysicalQuery) -> Self {
        Self {
            database: database.to_string(),
            query,
            isolation: IsolationLevel::Serializable,
            snapshot: Snapshot { step: 0, tx_id: 0 },
            acquire_locks_tx_id: None,
            validate_locks: false,
            erase_locks: false,
            locks: Vec::new(),
            operation_timeout: Duration::from_secs(300),
            cancel_after: None,
            limits: RequestLimits::default(),
            stats_mode: StatsMode::None,
        }
    }

    /// Checks cross-field invariants the planner must uphold.
    pub fn validate(&self) -> Result<(), crate::Error> {
        let wants_locks =
            self.acquire_locks_tx_id.is_some() || self.validate_locks || self.erase_locks;
        if wants_locks && self.isolation != IsolationLevel::Serializable {
            return Err(crate::Error::InvalidRequest(
                "lock operations require serializable isolation".into(),
            ));
        }
        if self.snapshot.is_valid() && self.isolation != IsolationLevel::Serializable {
            return Err(crate::Error::InvalidRequest(
                "an explicit snapshot requires serializable isolation".into(),
            ));
        }
        Ok(())
    }
}

/// Execution statistics spliced into the response when requested.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct ExecStats {
    pub affected_shards: u32,
    pub result_rows: u64,
    pub result_bytes: u64,
    pub resolve_ms: u64,
    pub prepare_ms: u64,
    pub execute_ms: u64,
}
