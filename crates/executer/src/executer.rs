use crate::graph::TasksGraph;
use crate::physical::{
    ExecStats, ExecutionRequest, IsolationLevel, RequestControls, StatsMode, TableMeta,
};
use crate::shards::{ShardPhase, ShardState};
use crate::Error;
use proto_tablet::dq::{ChannelData, ChannelDataAck, ComputeState, ComputeTaskState};
use proto_tablet::tx::{
    AffectedShard, CancelProposal, CoordinatorPropose, CoordinatorStatus, CoordinatorStatusCode,
    DataTxBody, LocksOp, ProposeAttach, ProposeDataTx, ProposeResult, ProposeStatus,
    ShardErrorKind, TaskDesc, TxLocks,
};
use proto_tablet::{Issue, IssueCode, Lock, Snapshot, StatusCode};
use prost::Message;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Hard cap on the serialized response.
pub const REPLY_SIZE_LIMIT: usize = 48 * 1024 * 1024;
/// Per-shard serialization budget of one transaction body.
pub const SHARD_TX_SIZE_LIMIT: usize = 50 * 1024 * 1024;
/// Free space granted to compute channels with each ack.
pub const CHANNEL_BUFFER_SIZE: u64 = 50 * 1024 * 1024;
/// Memory budget of a light compute program.
pub const LIGHT_PROGRAM_MEMORY_LIMIT: u64 = 500 * 1024 * 1024;
/// Memory budget of a heavy compute program.
pub const HEAVY_PROGRAM_MEMORY_LIMIT: u64 = 2 * 1024 * 1024 * 1024;

/// Runtime budget handed to a compute task at start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComputeSettings {
    pub timeout: Duration,
    pub light_program_memory_limit: u64,
    pub heavy_program_memory_limit: u64,
    pub channel_buffer_size: u64,
}

/// Everything the executer can ask of the outside world. The driver turns
/// effects into messages and timers; tests inspect them directly.
#[derive(Debug)]
pub enum Effect {
    ResolveTables { paths: Vec<String> },
    AcquireSnapshot { database: String },
    StartComputeTask { task: TaskDesc, settings: ComputeSettings },
    SendPropose { shard: u64, follower: bool, propose: ProposeDataTx },
    SendCancel { shard: u64, cancel: CancelProposal },
    SendAttach { shard: u64, attach: ProposeAttach, cookie: u64 },
    ScheduleReattach { shard: u64, delay: Duration },
    SendToCoordinator { propose: CoordinatorPropose },
    ChannelAck { task: u64, ack: ChannelDataAck },
    Reply { response: QueryResponse },
}

/// Everything that can happen to the executer.
#[derive(Debug)]
pub enum Event {
    TablesResolved { result: Result<Vec<TableMeta>, (StatusCode, String)> },
    SnapshotAcquired { result: Result<Snapshot, (StatusCode, Vec<Issue>)> },
    ProposeResult { result: ProposeResult },
    ProposeRestart { shard: u64 },
    AttachResult { shard: u64, cookie: u64, ok: bool },
    DeliveryProblem { shard: u64, not_delivered: bool },
    ReattachTimer { shard: u64 },
    CoordinatorStatus { status: CoordinatorStatus },
    ChannelData { data: ChannelData },
    ComputeState { state: ComputeTaskState },
    OperationTimeout,
    CancelRequested,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TxResult {
    pub rows: u64,
    pub data: Vec<Vec<u8>>,
}

/// Handle to a lock acquired on behalf of the caller; dropping it without
/// committing rolls the lock back at the session layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockHandle(pub u64);

#[derive(Clone, Debug, PartialEq)]
pub struct QueryResponse {
    pub status: StatusCode,
    pub issues: Vec<Issue>,
    pub results: Vec<TxResult>,
    pub locks: Vec<Lock>,
    pub lock_handle: Option<LockHandle>,
    pub stats: Option<ExecStats>,
}

impl Default for QueryResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::Unspecified,
            issues: Vec::new(),
            results: Vec::new(),
            locks: Vec::new(),
            lock_handle: None,
            stats: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    WaitResolve,
    WaitSnapshot,
    Prepare,
    Execute,
    Finished,
}

/// The data-query executer: drives one physical query through resolution,
/// per-shard proposal, coordinator planning, and result collection. State is
/// owned exclusively; all interaction flows through events and effects.
pub struct DataExecuter {
    tx_id: u64,
    request: ExecutionRequest,
    controls: RequestControls,
    phase: Phase,
    started_at: Instant,

    tables: HashMap<String, TableMeta>,
    graph: TasksGraph,
    shard_states: HashMap<u64, ShardState>,
    datashard_bodies: BTreeMap<u64, DataTxBody>,
    pending_compute: HashSet<u64>,
    stashed_compute: Vec<TaskDesc>,

    read_only: bool,
    immediate: bool,
    use_followers: bool,
    snapshot: Snapshot,
    lock_tx_id: Option<u64>,
    lock_handle: Option<LockHandle>,

    tx_coordinator: u64,
    tx_planned: bool,
    shards_with_effects: HashSet<u64>,

    locks: Vec<Lock>,
    results: Vec<TxResult>,
    last_shard: u64,

    effects: Vec<Effect>,
    replied: bool,
}

impl DataExecuter {
    pub fn new(
        tx_id: u64,
        request: ExecutionRequest,
        controls: RequestControls,
    ) -> Result<Self, Error> {
        request.validate()?;
        Ok(Self {
            tx_id,
            request,
            controls,
            phase: Phase::WaitResolve,
            started_at: Instant::now(),
            tables: HashMap::new(),
            graph: TasksGraph::default(),
            shard_states: HashMap::new(),
            datashard_bodies: BTreeMap::new(),
            pending_compute: HashSet::new(),
            stashed_compute: Vec::new(),
            read_only: true,
            immediate: false,
            use_followers: false,
            snapshot: Snapshot { step: 0, tx_id: 0 },
            lock_tx_id: None,
            lock_handle: None,
            tx_coordinator: 0,
            tx_planned: false,
            shards_with_effects: HashSet::new(),
            locks: Vec::new(),
            results: Vec::new(),
            last_shard: 0,
            effects: Vec::new(),
            replied: false,
        })
    }

    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }

    pub fn operation_timeout(&self) -> Duration {
        self.request.operation_timeout
    }

    pub fn cancel_after(&self) -> Option<Duration> {
        self.request.cancel_after
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn is_finished(&self) -> bool {
        self.replied
    }

    /// Kicks off execution by asking the driver to resolve table metadata.
    pub fn start(&mut self) {
        let mut paths: Vec<String> = self
            .request
            .query
            .transactions
            .iter()
            .flat_map(|tx| tx.stages.iter())
            .filter(|stage| !stage.table.is_empty())
            .map(|stage| stage.table.clone())
            .collect();
        paths.sort();
        paths.dedup();
        if paths.is_empty() {
            // A pure compute query resolves nothing.
            self.on_tables_resolved(Ok(Vec::new()));
            return;
        }
        self.effects.push(Effect::ResolveTables { paths });
    }

    pub fn handle(&mut self, event: Event, now: Instant) {
        if self.replied {
            return;
        }
        match event {
            Event::TablesResolved { result } => self.on_tables_resolved(result),
            Event::SnapshotAcquired { result } => self.on_snapshot_acquired(result),
            Event::ProposeResult { result } => self.on_propose_result(result),
            Event::ProposeRestart { shard } => self.on_propose_restart(shard),
            Event::AttachResult { shard, cookie, ok } => self.on_attach_result(shard, cookie, ok),
            Event::DeliveryProblem { shard, not_delivered } => {
                self.on_delivery_problem(shard, not_delivered, now)
            }
            Event::ReattachTimer { shard } => self.on_reattach_timer(shard),
            Event::CoordinatorStatus { status } => self.on_coordinator_status(status),
            Event::ChannelData { data } => self.on_channel_data(data),
            Event::ComputeState { state } => self.on_compute_state(state),
            Event::OperationTimeout => self.on_timeout(),
            Event::CancelRequested => self.on_cancel_requested(),
        }
    }

    // ---- resolution and task building ----

    fn on_tables_resolved(&mut self, result: Result<Vec<TableMeta>, (StatusCode, String)>) {
        if self.phase != Phase::WaitResolve {
            return self.internal_error("unexpected resolve result");
        }
        let tables = match result {
            Ok(tables) => tables,
            Err((status, message)) => {
                return self.reply_error(status, Issue::new(IssueCode::SchemeMismatch, message))
            }
        };
        for meta in tables {
            self.tables.insert(meta.path.clone(), meta);
        }
        self.build_and_execute();
    }

    fn build_and_execute(&mut self) {
        self.read_only = self
            .request
            .query
            .transactions
            .iter()
            .flat_map(|tx| tx.stages.iter())
            .all(|stage| !stage.is_effects && !stage.table_ops.iter().any(|op| op.is_write()));

        let graph = match TasksGraph::build(&self.request, &self.tables) {
            Ok(graph) => graph,
            Err(error) => {
                return self.reply_error(
                    StatusCode::InternalError,
                    Issue::new(IssueCode::Default, error.to_string()),
                )
            }
        };
        self.graph = graph;
        self.results = (0..self.graph.result_count).map(|_| TxResult::default()).collect();

        // Validation before any shard is contacted.
        let compute_count = self.graph.compute_task_count();
        if compute_count as u32 > self.request.limits.max_compute_actors {
            return self.reply_error(
                StatusCode::PreconditionFailed,
                Issue::new(
                    IssueCode::PreconditionFailed,
                    format!("Requested too many execution units: {compute_count}"),
                ),
            );
        }

        let affected = self.graph.affected_shards();
        let mut shards_limit = self.request.limits.max_affected_shards;
        if self.controls.max_shard_count > 0 {
            shards_limit = if shards_limit > 0 {
                shards_limit.min(self.controls.max_shard_count)
            } else {
                self.controls.max_shard_count
            };
        }
        if shards_limit > 0 && affected.len() as u32 > shards_limit {
            tracing::warn!(shards = affected.len(), limit = shards_limit, "too many affected shards");
            return self.reply_error(
                StatusCode::PreconditionFailed,
                Issue::new(
                    IssueCode::PreconditionFailed,
                    format!("Affected too many shards: {}", affected.len()),
                ),
            );
        }

        for task in self.graph.tasks() {
            if let Some(shard) = task.shard_id {
                if task.writes.is_some() {
                    self.shards_with_effects.insert(shard);
                }
            }
        }

        let mut bodies = self.graph.build_datashard_bodies(&self.request.query);
        for body in bodies.values_mut() {
            body.read_only = self.read_only;
            if self.request.limits.per_shard_keys_size_limit > 0 {
                body.per_shard_keys_size_limit = self.request.limits.per_shard_keys_size_limit;
            }
        }
        for (shard, body) in &bodies {
            let size = body.encoded_len();
            if size > SHARD_TX_SIZE_LIMIT {
                tracing::warn!(shard, size, "shard transaction is over the serialization budget");
                return self.reply_error(
                    StatusCode::PreconditionFailed,
                    Issue::new(
                        IssueCode::PreconditionFailed,
                        format!("Transaction for shard {shard} is too large: {size}"),
                    ),
                );
            }
        }
        self.datashard_bodies = bodies;

        // Immediate unless the transaction spans shards.
        self.immediate = self.datashard_bodies.len() <= 1;
        match self.request.isolation {
            IsolationLevel::ReadUncommitted | IsolationLevel::StaleRo => {
                if !self.read_only {
                    return self.internal_error("inconsistent isolation for a write transaction");
                }
                self.immediate = true;
            }
            _ => (),
        }
        if self.read_only && self.request.snapshot.is_valid() {
            // Snapshot reads are always immediate.
            self.snapshot = self.request.snapshot;
            self.immediate = true;
        }

        let force_snapshot = self.read_only
            && !self.immediate
            && !self.graph.has_persistent_channels
            && !self.request.database.is_empty()
            && self.controls.enable_mvcc_snapshot_reads;

        if force_snapshot {
            tracing::debug!(tx_id = self.tx_id, "acquiring a temporary mvcc snapshot");
            self.phase = Phase::WaitSnapshot;
            self.effects
                .push(Effect::AcquireSnapshot { database: self.request.database.clone() });
            return;
        }
        self.continue_execute();
    }

    fn on_snapshot_acquired(&mut self, result: Result<Snapshot, (StatusCode, Vec<Issue>)>) {
        if self.phase != Phase::WaitSnapshot {
            return self.internal_error("unexpected snapshot result");
        }
        match result {
            Ok(snapshot) => {
                self.snapshot = snapshot;
                self.immediate = true;
                self.continue_execute();
            }
            Err((status, issues)) => {
                // Acquisition failures surface unchanged.
                self.reply(QueryResponse { status, issues, ..Default::default() });
            }
        }
    }

    fn continue_execute(&mut self) {
        self.use_followers = self.request.isolation == IsolationLevel::StaleRo;
        if self.datashard_bodies.len() > 1 {
            // Followers are only allowed for single-shard transactions.
            self.use_followers = false;
        }
        if self.snapshot.is_valid() {
            self.use_followers = false;
        }
        if self.use_followers && !self.read_only {
            return self.internal_error("followers require a read-only transaction");
        }

        self.execute();

        self.phase = if self.immediate { Phase::Execute } else { Phase::Prepare };
        tracing::debug!(
            tx_id = self.tx_id,
            total_tasks = self.graph.tasks().len(),
            read_only = self.read_only,
            shards = self.datashard_bodies.len(),
            immediate = self.immediate,
            use_followers = self.use_followers,
            "dispatched transaction"
        );
        self.check_execution_complete();
    }

    fn execute(&mut self) {
        // A zero lock id asks for a fresh lock owned by this transaction.
        self.lock_tx_id = match self.request.acquire_locks_tx_id {
            Some(0) => {
                self.lock_handle = Some(LockHandle(self.tx_id));
                Some(self.tx_id)
            }
            other => other,
        };

        self.attach_lock_ops();

        // Compute tasks start first so shard channels know their peers.
        for task in self.graph.tasks() {
            if task.shard_id.is_none() {
                let program = &self.request.query.transactions[task.tx_index].stages[task.stage_index].program;
                let desc = self.graph.task_desc(task.id, program);
                self.pending_compute.insert(task.id);
                self.stashed_compute.push(desc);
            }
        }
        let settings = ComputeSettings {
            timeout: self.request.operation_timeout,
            light_program_memory_limit: LIGHT_PROGRAM_MEMORY_LIMIT,
            heavy_program_memory_limit: HEAVY_PROGRAM_MEMORY_LIMIT,
            channel_buffer_size: CHANNEL_BUFFER_SIZE,
        };
        for task in std::mem::take(&mut self.stashed_compute) {
            self.effects.push(Effect::StartComputeTask { task, settings });
        }

        let timeout_ms = self.request.operation_timeout.as_millis() as u64;
        let cancel_after_ms = self.request.cancel_after.map(|d| d.as_millis() as u64).unwrap_or(0);
        let bodies = std::mem::take(&mut self.datashard_bodies);
        for (shard, mut body) in bodies {
            body.immediate = self.immediate;
            body.timeout_ms = timeout_ms;
            body.cancel_after_ms = cancel_after_ms;
            body.lock_tx_id = self.lock_tx_id;

            let mut state = ShardState::new(
                if self.immediate { ShardPhase::Executing } else { ShardPhase::Preparing },
                self.use_followers,
            );
            state.task_ids = body.tasks.iter().map(|t| t.id).collect();
            state.read_locks = body
                .locks
                .as_ref()
                .map(|locks| !locks.locks.is_empty())
                .unwrap_or(false);

            let snapshot = (self.snapshot.is_valid() && self.read_only).then_some(self.snapshot);
            let propose = ProposeDataTx {
                tx_id: self.tx_id,
                body: Some(body.clone()),
                snapshot,
                immediate: self.immediate,
            };
            tracing::debug!(
                tx_id = self.tx_id,
                shard,
                tasks = ?state.task_ids,
                lock_tx_id = ?self.lock_tx_id,
                "proposing transaction to shard"
            );
            self.effects.push(Effect::SendPropose { shard, follower: self.use_followers, propose });
            self.shard_states.insert(shard, state);
            self.datashard_bodies.insert(shard, body);
        }
    }

    // Distributes prior locks plus the validate/erase decision to shards.
    fn attach_lock_ops(&mut self) {
        if self.request.locks.is_empty() {
            return;
        }
        if !self.request.validate_locks && !self.request.erase_locks {
            return self.internal_error("carried locks without a validate or erase request");
        }
        let op = match (self.request.validate_locks, self.request.erase_locks) {
            (true, true) => LocksOp::Commit,
            (true, false) => LocksOp::Validate,
            (false, _) => LocksOp::Rollback,
        };

        let mut by_shard: BTreeMap<u64, Vec<Lock>> = BTreeMap::new();
        for lock in &self.request.locks {
            by_shard.entry(lock.data_shard).or_default().push(*lock);
        }

        let mut sending: Vec<u64> = Vec::new();
        let mut receiving: Vec<u64> = Vec::new();
        if self.request.validate_locks {
            sending = by_shard.keys().copied().collect();
            receiving = self
                .datashard_bodies
                .keys()
                .filter(|shard| self.shards_with_effects.contains(shard))
                .copied()
                .collect();
        }

        for (shard, body) in self.datashard_bodies.iter_mut() {
            let locks = body.locks.get_or_insert_with(TxLocks::default);
            locks.op = op as i32;
            if let Some(shard_locks) = by_shard.get(shard) {
                locks.locks = shard_locks.clone();
            }
            if self.request.validate_locks {
                locks.sending_shards = sending.clone();
                locks.receiving_shards = receiving.clone();
            }
        }
    }

    // ---- prepare phase ----

    fn on_propose_result(&mut self, result: ProposeResult) {
        let shard = result.origin;
        self.last_shard = shard;
        if !self.shard_states.contains_key(&shard) {
            return self.internal_error(&format!("propose result from unknown shard {shard}"));
        }
        tracing::debug!(
            tx_id = self.tx_id,
            shard,
            status = ?result.status(),
            "got propose result"
        );

        match (self.phase, result.status()) {
            (Phase::Prepare, ProposeStatus::Prepared) => {
                if !self.shard_prepared(shard, &result) {
                    self.cancel_proposal(shard);
                    return;
                }
                self.check_prepare_completed();
            }
            (Phase::Prepare, ProposeStatus::Complete) => {
                self.internal_error("COMPLETE response while preparing")
            }
            (Phase::Prepare, _) => {
                self.cancel_proposal(shard);
                self.shard_error(&result);
            }
            (Phase::Execute, ProposeStatus::Complete) => {
                let state = self.shard_states.get_mut(&shard).expect("checked above");
                if state.phase != ShardPhase::Executing {
                    return self.internal_error("COMPLETE from a shard that is not executing");
                }
                state.phase = ShardPhase::Finished;
                for lock in &result.tx_locks {
                    tracing::debug!(shard, lock_id = lock.lock_id, "shard completed, storing lock");
                    self.locks.push(*lock);
                }
                metrics::counter!("executer_shard_results_total").increment(1);
                self.check_execution_complete();
            }
            (Phase::Execute, ProposeStatus::LocksBroken) => {
                tracing::debug!(shard, "broken locks reported by shard");
                let mut message = "Transaction locks invalidated.".to_string();
                if let Some(table) = result
                    .tx_locks
                    .first()
                    .and_then(|lock| self.table_path(lock.scheme_shard, lock.path_id))
                {
                    message = format!("{message} Table: {table}");
                }
                self.reply_error(StatusCode::Aborted, Issue::new(IssueCode::LocksInvalidated, message));
            }
            (Phase::Execute, ProposeStatus::Prepared) => {
                self.internal_error("PREPARED response while executing")
            }
            (Phase::Execute, _) => self.shard_error(&result),
            (phase, status) => {
                self.internal_error(&format!("propose result in phase {phase:?}: {status:?}"))
            }
        }
    }

    fn shard_prepared(&mut self, shard: u64, result: &ProposeResult) -> bool {
        let state = self.shard_states.get_mut(&shard).expect("known shard");
        if state.phase != ShardPhase::Preparing {
            self.internal_error("PREPARED from a shard that is not preparing");
            return false;
        }
        state.phase = ShardPhase::Prepared;
        state.min_step = result.min_step;
        state.max_step = result.max_step;
        state.read_size += result.read_size;

        let coordinator = select_coordinator(&result.domain_coordinators, self.tx_id);
        if coordinator != 0 && self.tx_coordinator == 0 {
            self.tx_coordinator = coordinator;
        }
        if self.tx_coordinator == 0 || self.tx_coordinator != coordinator {
            tracing::error!(
                tx_id = self.tx_id,
                previous = self.tx_coordinator,
                selected = coordinator,
                "unable to select a single coordinator"
            );
            self.reply_error(
                StatusCode::Cancelled,
                Issue::new(IssueCode::TxDeclinedImplicitCoordinator, "Unable to choose coordinator."),
            );
            return false;
        }
        true
    }

    fn check_prepare_completed(&mut self) {
        if self
            .shard_states
            .values()
            .any(|state| state.phase != ShardPhase::Prepared)
        {
            tracing::debug!(tx_id = self.tx_id, "not all shards are prepared, waiting");
            return;
        }
        tracing::debug!(tx_id = self.tx_id, "all shards prepared, planning");
        self.phase = Phase::Execute;
        self.execute_planned();
    }

    fn execute_planned(&mut self) {
        if self.tx_coordinator == 0 {
            return self.internal_error("planning without a coordinator");
        }

        let mut aggr_min_step = 0u64;
        let mut aggr_max_step = u64::MAX;
        let mut total_read_size = 0u64;
        let mut affected = Vec::with_capacity(self.shard_states.len());

        let shards: Vec<u64> = self.shard_states.keys().copied().collect();
        for shard in shards {
            let (min_step, max_step, read_size, read_locks, task_ids) = {
                let state = self.shard_states.get_mut(&shard).expect("known shard");
                if state.phase != ShardPhase::Prepared {
                    // Unreachable by construction; kept as a hard stop.
                    (0, 0, 0, false, Vec::new())
                } else {
                    state.phase = ShardPhase::Executing;
                    (
                        state.min_step,
                        state.max_step,
                        state.read_size,
                        state.read_locks,
                        state.task_ids.iter().copied().collect::<Vec<u64>>(),
                    )
                }
            };
            aggr_min_step = aggr_min_step.max(min_step);
            aggr_max_step = aggr_max_step.min(max_step);
            total_read_size += read_size;

            let mut flags = 0u32;
            if read_locks {
                flags |= proto_tablet::tx::AFFECTED_READ;
            }
            for task_id in task_ids {
                let task = self.graph.task(task_id);
                if !task.reads.is_empty() {
                    flags |= proto_tablet::tx::AFFECTED_READ;
                }
                if task.writes.is_some() {
                    flags |= proto_tablet::tx::AFFECTED_WRITE;
                }
            }
            affected.push(AffectedShard { shard_id: shard, flags });
        }

        let mut size_limit = self.controls.per_request_data_size_limit;
        if self.request.limits.total_read_size_limit > 0 {
            size_limit = if size_limit > 0 {
                size_limit.min(self.request.limits.total_read_size_limit)
            } else {
                self.request.limits.total_read_size_limit
            };
        }
        if size_limit > 0 && total_read_size > size_limit {
            let message =
                format!("Transaction total read size {total_read_size} exceeded limit {size_limit}");
            tracing::warn!(tx_id = self.tx_id, "{message}");
            return self.reply_error(
                StatusCode::PreconditionFailed,
                Issue::new(IssueCode::PreconditionFailed, message),
            );
        }

        tracing::debug!(tx_id = self.tx_id, coordinator = self.tx_coordinator, "executing planned transaction");
        self.effects.push(Effect::SendToCoordinator {
            propose: CoordinatorPropose {
                coordinator_id: self.tx_coordinator,
                tx_id: self.tx_id,
                min_step: aggr_min_step,
                max_step: aggr_max_step,
                affected,
            },
        });
    }

    fn on_coordinator_status(&mut self, status: CoordinatorStatus) {
        tracing::debug!(tx_id = self.tx_id, status = ?status.status(), "got coordinator status");
        match status.status() {
            CoordinatorStatusCode::Accepted
            | CoordinatorStatusCode::Processed
            | CoordinatorStatusCode::Confirmed => (),
            CoordinatorStatusCode::Planned => self.tx_planned = true,
            CoordinatorStatusCode::Outdated
            | CoordinatorStatusCode::Declined
            | CoordinatorStatusCode::DeclinedNoSpace
            | CoordinatorStatusCode::Restarting => {
                self.cancel_proposal(0);
                self.reply_unavailable(format!(
                    "Failed to plan transaction, status: {:?}",
                    status.status()
                ));
            }
            CoordinatorStatusCode::Unknown
            | CoordinatorStatusCode::Aborted
            | CoordinatorStatusCode::Unspecified => {
                self.internal_error(&format!("unexpected coordinator status: {:?}", status.status()))
            }
        }
    }

    // ---- restarts, disconnects, reattach ----

    fn on_propose_restart(&mut self, shard: u64) {
        let Some(state) = self.shard_states.get_mut(&shard) else {
            return self.internal_error(&format!("restart event from unknown shard {shard}"));
        };
        tracing::debug!(shard, phase = state.phase.as_str(), "shard is restarting");
        match state.phase {
            ShardPhase::Preparing | ShardPhase::Prepared | ShardPhase::Executing => {
                state.restarting = true;
            }
            ShardPhase::Finished => (),
            ShardPhase::Initial => self.internal_error("restart before any proposal"),
        }
    }

    fn on_attach_result(&mut self, shard: u64, cookie: u64, ok: bool) {
        let Some(state) = self.shard_states.get_mut(&shard) else {
            return self.internal_error(&format!("attach result from unknown shard {shard}"));
        };
        if cookie != state.reattach.cookie {
            return;
        }
        match self.phase {
            Phase::Prepare => {
                match state.phase {
                    ShardPhase::Preparing | ShardPhase::Prepared => (),
                    _ => return self.internal_error("attach result in an unexpected shard phase"),
                }
                if ok {
                    tracing::debug!(shard, "reattached to shard");
                    state.phase = ShardPhase::Prepared;
                    state.reattach.reattached();
                    self.check_prepare_completed();
                } else {
                    tracing::error!(shard, "transaction lost during reconnect");
                    self.cancel_proposal(shard);
                    self.reply_tx_state_unknown(shard);
                }
            }
            Phase::Execute => {
                if state.phase != ShardPhase::Executing {
                    return;
                }
                if ok {
                    tracing::debug!(shard, "reattached to shard");
                    state.reattach.reattached();
                    self.check_execution_complete();
                } else {
                    tracing::error!(shard, "transaction lost during reconnect");
                    self.reply_tx_state_unknown(shard);
                }
            }
            _ => (),
        }
    }

    fn on_delivery_problem(&mut self, tablet: u64, not_delivered: bool, now: Instant) {
        if tablet == self.tx_coordinator && self.tx_coordinator != 0 {
            if not_delivered {
                tracing::error!(coordinator = tablet, "coordinator proposal not delivered");
                self.cancel_proposal(0);
                return self.reply_unavailable("Delivery problem: could not plan transaction.".into());
            }
            if self.tx_planned {
                // The plan is out; losing the pipe no longer matters.
                return;
            }
            tracing::error!(coordinator = tablet, "lost pipe to coordinator before the plan");
            return self.reply_tx_state_unknown(tablet);
        }

        let Some(state) = self.shard_states.get_mut(&tablet) else {
            return self.internal_error(&format!("delivery problem from unknown shard {tablet}"));
        };
        let was_restarting = std::mem::take(&mut state.restarting);
        // Only an undelivered initial proposal proves the tx was never prepared.
        let not_prepared = not_delivered && state.restart_count == 0;

        match state.phase {
            ShardPhase::Preparing => {
                tracing::info!(
                    shard = tablet,
                    not_delivered,
                    not_prepared,
                    was_restarting,
                    "shard propose delivery problem"
                );
                if not_prepared {
                    self.cancel_proposal(tablet);
                    self.reply_unavailable(format!("Could not deliver program to shard {tablet}"));
                } else {
                    self.cancel_proposal(0);
                    if was_restarting {
                        // The shard was persisting our proposal: the outcome is
                        // unknown, but no side effects could have applied.
                        self.reply_unavailable(format!("Could not prepare program on shard {tablet}"));
                    } else {
                        self.reply_tx_state_unknown(tablet);
                    }
                }
            }
            ShardPhase::Prepared | ShardPhase::Executing => {
                let reattaching = state.reattach.reattaching;
                if (was_restarting || reattaching) && state.reattach.should_reattach(now) {
                    let delay = state.reattach.delay;
                    state.restart_count += 1;
                    tracing::warn!(shard = tablet, ?delay, "lost pipe, reattaching");
                    self.effects.push(Effect::ScheduleReattach { shard: tablet, delay });
                    return;
                }
                tracing::warn!(shard = tablet, not_delivered, "lost pipe without a restart");
                if self.phase == Phase::Prepare {
                    self.cancel_proposal(0);
                }
                self.reply_tx_state_unknown(tablet);
            }
            ShardPhase::Finished => (),
            ShardPhase::Initial => {
                self.internal_error(&format!("delivery problem in shard phase Initial: {tablet}"))
            }
        }
    }

    fn on_reattach_timer(&mut self, shard: u64) {
        let Some(state) = self.shard_states.get_mut(&shard) else {
            return;
        };
        if !state.reattach.reattaching {
            return;
        }
        state.reattach.cookie += 1;
        tracing::info!(shard, cookie = state.reattach.cookie, "reattaching to shard");
        self.effects.push(Effect::SendAttach {
            shard,
            attach: ProposeAttach { tx_id: self.tx_id, shard_id: shard },
            cookie: state.reattach.cookie,
        });
    }

    // ---- results and completion ----

    fn on_channel_data(&mut self, data: ChannelData) {
        let Some(channel) = self.graph.channel_opt(data.channel_id).cloned() else {
            return self.internal_error(&format!("data for unknown channel {}", data.channel_id));
        };
        if channel.dst_task != 0 {
            return self.internal_error("channel data for a non-result channel");
        }
        let index = channel.dst_input_index as usize;
        if index >= self.results.len() {
            return self.internal_error("result channel index out of range");
        }
        tracing::trace!(
            channel = channel.id,
            rows = data.rows,
            finished = data.finished,
            "got result chunk"
        );
        if data.rows > 0 || !data.data.is_empty() {
            self.results[index].rows += data.rows as u64;
            self.results[index].data.push(data.data);
        }
        self.effects.push(Effect::ChannelAck {
            task: channel.src_task,
            ack: ChannelDataAck {
                channel_id: channel.id,
                seq_no: data.seq_no,
                free_space: CHANNEL_BUFFER_SIZE,
            },
        });
    }

    fn on_compute_state(&mut self, state: ComputeTaskState) {
        tracing::debug!(task = state.task_id, state = ?state.state(), "got compute state");
        match state.state() {
            ComputeState::Failure => {
                if self.phase == Phase::Prepare {
                    self.cancel_proposal(0);
                }
                let status = match state.status() {
                    StatusCode::Unspecified => StatusCode::InternalError,
                    status => status,
                };
                self.reply(QueryResponse { status, issues: state.issues, ..Default::default() });
            }
            ComputeState::Executing => {
                if !self.pending_compute.contains(&state.task_id) {
                    self.internal_error(&format!("state from unknown compute task {}", state.task_id));
                }
            }
            ComputeState::Finished => {
                if !self.pending_compute.remove(&state.task_id) {
                    tracing::warn!(task = state.task_id, "state from unknown compute task");
                }
                self.check_execution_complete();
            }
            ComputeState::Unspecified => {
                self.internal_error(&format!("unexpected compute state from task {}", state.task_id))
            }
        }
    }

    fn check_execution_complete(&mut self) {
        if self.phase != Phase::Execute {
            return;
        }
        let unfinished = self
            .shard_states
            .iter()
            .filter(|(_, s)| s.phase != ShardPhase::Finished)
            .count();
        if unfinished == 0 && self.pending_compute.is_empty() {
            return self.finalize();
        }
        tracing::debug!(
            tx_id = self.tx_id,
            waiting_compute = self.pending_compute.len(),
            waiting_shards = unfinished,
            "waiting for completion"
        );
    }

    fn finalize(&mut self) {
        let response_size: usize = self
            .results
            .iter()
            .map(|r| r.data.iter().map(Vec::len).sum::<usize>())
            .sum::<usize>()
            + self.locks.iter().map(Message::encoded_len).sum::<usize>();
        if response_size > REPLY_SIZE_LIMIT {
            let message =
                format!("Query result size limit exceeded. ({response_size} > {REPLY_SIZE_LIMIT})");
            return self.reply_error(
                StatusCode::PreconditionFailed,
                Issue::new(IssueCode::ResultUnavailable, message),
            );
        }

        let stats = match self.request.stats_mode {
            StatsMode::None => None,
            _ => Some(ExecStats {
                affected_shards: self.shard_states.len() as u32,
                result_rows: self.results.iter().map(|r| r.rows).sum(),
                result_bytes: response_size as u64,
                resolve_ms: 0,
                prepare_ms: 0,
                execute_ms: self.started_at.elapsed().as_millis() as u64,
            }),
        };

        let results = std::mem::take(&mut self.results);
        let locks = std::mem::take(&mut self.locks);
        // The handle is returned only when the transaction acquired locks.
        let lock_handle = if locks.is_empty() { None } else { self.lock_handle.take() };
        self.reply(QueryResponse {
            status: StatusCode::Success,
            issues: Vec::new(),
            results,
            locks,
            lock_handle,
            stats,
        });
    }

    // ---- timeouts and cancellation ----

    fn on_timeout(&mut self) {
        tracing::warn!(tx_id = self.tx_id, "operation timed out");
        if self.phase == Phase::Prepare {
            self.cancel_proposal(0);
        }
        self.reply_error(
            StatusCode::Timeout,
            Issue::new(IssueCode::Default, "Request timeout exceeded."),
        );
    }

    fn on_cancel_requested(&mut self) {
        tracing::warn!(tx_id = self.tx_id, "cancelling at the user's request");
        if self.phase == Phase::Prepare {
            self.cancel_proposal(0);
        }
        self.reply_error(
            StatusCode::Cancelled,
            Issue::new(IssueCode::OperationCancelled, "Request was cancelled."),
        );
    }

    /// Sends a cancel to every shard still in Preparing or Prepared, except
    /// `except_shard`. Followers are never cancelled.
    fn cancel_proposal(&mut self, except_shard: u64) {
        let tx_id = self.tx_id;
        let mut cancels = Vec::new();
        for (shard, state) in self.shard_states.iter_mut() {
            if *shard != except_shard
                && matches!(state.phase, ShardPhase::Preparing | ShardPhase::Prepared)
            {
                state.phase = ShardPhase::Finished;
                debug_assert!(!state.follower);
                cancels.push(*shard);
            }
        }
        cancels.sort_unstable();
        for shard in cancels {
            self.effects.push(Effect::SendCancel { shard, cancel: CancelProposal { tx_id } });
        }
    }

    // ---- error taxonomy ----

    fn shard_error(&mut self, result: &ProposeResult) {
        for error in &result.errors {
            tracing::error!(
                shard = result.origin,
                kind = ?error.kind(),
                reason = %error.reason,
                "shard error"
            );
        }
        let sub_issues = |result: &ProposeResult| -> Vec<Issue> {
            result
                .errors
                .iter()
                .map(|e| Issue::new(IssueCode::Default, format!("[{:?}] {}", e.kind(), e.reason)))
                .collect()
        };
        let with_subs = |mut issue: Issue, result: &ProposeResult| {
            issue.sub_issues = sub_issues(result);
            issue
        };

        match result.status() {
            ProposeStatus::Overloaded => self.reply_error(
                StatusCode::Overloaded,
                with_subs(Issue::new(IssueCode::Overloaded, "The cluster or one of its subsystems is overloaded."), result),
            ),
            ProposeStatus::Aborted => self.reply_error(
                StatusCode::Aborted,
                with_subs(Issue::new(IssueCode::OperationAborted, "Operation aborted."), result),
            ),
            ProposeStatus::TryLater => self.reply_error(
                StatusCode::Unavailable,
                with_subs(
                    Issue::new(IssueCode::TemporarilyUnavailable, "The cluster or one of its subsystems was unavailable."),
                    result,
                ),
            ),
            ProposeStatus::ResultUnavailable => self.reply_error(
                StatusCode::Undetermined,
                with_subs(Issue::new(IssueCode::ResultUnavailable, "Query result is unavailable."), result),
            ),
            ProposeStatus::Cancelled => self.reply_error(
                StatusCode::Cancelled,
                with_subs(Issue::new(IssueCode::OperationCancelled, "Operation cancelled."), result),
            ),
            ProposeStatus::BadRequest => self.reply_error(
                StatusCode::BadRequest,
                with_subs(Issue::new(IssueCode::BadRequest, "Bad request."), result),
            ),
            ProposeStatus::ExecError => {
                for error in &result.errors {
                    if error.kind() == ShardErrorKind::ProgramError {
                        let issue = Issue::new(IssueCode::PreconditionFailed, "Precondition failed.")
                            .with_sub(Issue::new(
                                IssueCode::Default,
                                format!("Data shard error: [PROGRAM_ERROR] {}", error.reason),
                            ));
                        return self.reply_error(StatusCode::PreconditionFailed, issue);
                    }
                }
                self.reply_error(
                    StatusCode::GenericError,
                    with_subs(
                        Issue::new(IssueCode::Default, "Error executing transaction (ExecError): Execution failed"),
                        result,
                    ),
                )
            }
            ProposeStatus::Error => {
                for error in &result.errors {
                    match error.kind() {
                        ShardErrorKind::SchemeChanged | ShardErrorKind::SchemeError => {
                            return self.reply_error(
                                StatusCode::SchemeError,
                                Issue::new(IssueCode::SchemeMismatch, error.reason.clone()),
                            )
                        }
                        _ => (),
                    }
                }
                self.reply_error(
                    StatusCode::Unavailable,
                    with_subs(
                        Issue::new(IssueCode::TemporarilyUnavailable, "The cluster or one of its subsystems was unavailable."),
                        result,
                    ),
                )
            }
            _ => self.reply_error(
                StatusCode::GenericError,
                with_subs(
                    Issue::new(IssueCode::Default, "Error executing transaction: transaction failed."),
                    result,
                ),
            ),
        }
    }

    fn reply_tx_state_unknown(&mut self, shard: u64) {
        let message = format!("Tx state unknown for shard {shard}, txid {}", self.tx_id);
        if self.read_only {
            let issue = Issue::new(IssueCode::TemporarilyUnavailable, "Temporarily unavailable.")
                .with_sub(Issue::new(IssueCode::TxStateUnknown, message));
            self.reply_error(StatusCode::Unavailable, issue);
        } else {
            let issue = Issue::new(IssueCode::OperationStateUnknown, "Operation state unknown.")
                .with_sub(Issue::new(IssueCode::TxStateUnknown, message));
            self.reply_error(StatusCode::Undetermined, issue);
        }
    }

    fn reply_unavailable(&mut self, message: String) {
        let issue =
            Issue::new(IssueCode::TemporarilyUnavailable, message);
        self.reply_error(StatusCode::Unavailable, issue);
    }

    fn internal_error(&mut self, message: &str) {
        tracing::error!(tx_id = self.tx_id, message, "internal error");
        self.reply_error(
            StatusCode::InternalError,
            Issue::new(IssueCode::Default, format!("Internal error while executing transaction: {message}")),
        );
    }

    fn reply_error(&mut self, status: StatusCode, issue: Issue) {
        self.reply(QueryResponse { status, issues: vec![issue], ..Default::default() });
    }

    fn reply(&mut self, response: QueryResponse) {
        if self.replied {
            return;
        }
        self.replied = true;
        self.phase = Phase::Finished;
        metrics::counter!(
            "executer_tx_results_total",
            "status" => format!("{:?}", response.status),
        )
        .increment(1);
        tracing::debug!(tx_id = self.tx_id, status = ?response.status, "sending response");
        self.effects.push(Effect::Reply { response });
    }

    fn table_path(&self, owner_id: u64, table_id: u64) -> Option<String> {
        self.tables
            .values()
            .find(|meta| meta.table.owner_id == owner_id && meta.table.table_id == table_id)
            .map(|meta| meta.path.clone())
    }
}

/// Deterministically selects the coordinator for a transaction from the
/// domain's coordinator list.
pub fn select_coordinator(coordinators: &[u64], tx_id: u64) -> u64 {
    if coordinators.is_empty() {
        return 0;
    }
    coordinators[(tx_id % coordinators.len() as u64) as usize]
}
