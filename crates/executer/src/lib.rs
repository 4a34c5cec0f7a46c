// The distributed data-query executer: turns a physical plan into per-shard
// transactions and compute tasks, drives every shard through the two-phase
// propose/plan protocol, survives pipe loss via bounded reattach, and folds
// the outcome into one response with a closed error taxonomy.

mod driver;
mod executer;
mod graph;
mod partition;
mod physical;
mod shards;

pub use driver::{run_data_executer, ShardMsg, Transport};
pub use executer::{
    select_coordinator, ComputeSettings, DataExecuter, Effect, Event, LockHandle, QueryResponse,
    TxResult, CHANNEL_BUFFER_SIZE, HEAVY_PROGRAM_MEMORY_LIMIT, LIGHT_PROGRAM_MEMORY_LIMIT,
    REPLY_SIZE_LIMIT, SHARD_TX_SIZE_LIMIT,
};
pub use graph::{BuildError, Channel, Task, TaskReads, TaskWrites, TasksGraph};
pub use partition::{prune_keys, prune_range, prune_ranges, shard_for_key};
pub use physical::{
    Connection, ConnectionKind, ExecStats, ExecutionRequest, IsolationLevel, Partition,
    PhysicalQuery, PhysicalTx, RequestControls, RequestLimits, Stage, StatsMode, TableKind,
    TableMeta, TableOp, WriteRow,
};
pub use shards::{
    ReattachState, ShardPhase, ShardState, MAX_REATTACH_DELAY, MAX_REATTACH_DURATION,
    MIN_REATTACH_DELAY,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid execution request: {0}")]
    InvalidRequest(String),
}
