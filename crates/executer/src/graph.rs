use crate::partition::{prune_keys, prune_range, prune_ranges};
use crate::physical::{
    Connection, ConnectionKind, ExecutionRequest, PhysicalTx, Stage, TableKind, TableMeta, TableOp,
};
use cells::{encode_cells, KeyRange, OwnedKey};
use proto_tablet::tx::{
    ChannelDesc, ColumnWriteMeta, DataTxBody, ReadTaskMeta, TaskDesc, WriteTaskMeta,
};
use proto_tablet::{ReadRange, TableId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

const MAX_HASH_SHUFFLE_TASKS: u32 = 24;

#[derive(Clone, Debug, Default)]
pub struct TaskReads {
    pub ranges: Vec<KeyRange>,
    pub columns: Vec<u32>,
    pub items_limit: u64,
    pub reverse: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TaskWrites {
    pub ranges: Vec<KeyRange>,
    pub has_updates: bool,
    pub has_erases: bool,
    pub column_writes: BTreeMap<u32, u64>,
}

impl TaskWrites {
    pub fn is_pure_erase(&self) -> bool {
        self.has_erases && !self.has_updates
    }
}

/// A compute- or shard-bound unit of the transaction.
#[derive(Clone, Debug)]
pub struct Task {
    pub id: u64,
    pub tx_index: usize,
    pub stage_index: usize,
    pub shard_id: Option<u64>,
    pub table: Option<TableId>,
    pub reads: Vec<TaskReads>,
    pub writes: Option<TaskWrites>,
    pub inputs: Vec<u64>,
    pub outputs: Vec<u64>,
}

/// A point-to-point pipe between tasks; `dst_task == 0` addresses the
/// executer's result collector.
#[derive(Clone, Debug)]
pub struct Channel {
    pub id: u64,
    pub src_task: u64,
    pub dst_task: u64,
    pub in_memory: bool,
    pub dst_input_index: u32,
}

/// The executer's exclusively-owned task graph, alive for one request.
#[derive(Default)]
pub struct TasksGraph {
    tasks: Vec<Task>,
    channels: Vec<Channel>,
    stage_tasks: HashMap<(usize, usize), Vec<u64>>,
    pub has_persistent_channels: bool,
    pub result_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("table '{0}' was not resolved")]
    UnresolvedTable(String),
    #[error("effect stage with more than one input")]
    EffectStageInputs,
    #[error("map-shard input of a stage without an upstream shard assignment")]
    MapShardWithoutReads,
    #[error("inconsistent items limit across shard reads of one stage")]
    InconsistentReadSettings,
}

impl TasksGraph {
    pub fn task(&self, id: u64) -> &Task {
        &self.tasks[(id - 1) as usize]
    }

    fn task_mut(&mut self, id: u64) -> &mut Task {
        &mut self.tasks[(id - 1) as usize]
    }

    pub fn channel(&self, id: u64) -> &Channel {
        &self.channels[(id - 1) as usize]
    }

    pub fn channel_opt(&self, id: u64) -> Option<&Channel> {
        id.checked_sub(1).and_then(|index| self.channels.get(index as usize))
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn stage_tasks(&self, tx_index: usize, stage_index: usize) -> &[u64] {
        self.stage_tasks
            .get(&(tx_index, stage_index))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn add_task(&mut self, tx_index: usize, stage_index: usize, shard_id: Option<u64>, table: Option<TableId>) -> u64 {
        let id = self.tasks.len() as u64 + 1;
        self.tasks.push(Task {
            id,
            tx_index,
            stage_index,
            shard_id,
            table,
            reads: Vec::new(),
            writes: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        });
        self.stage_tasks.entry((tx_index, stage_index)).or_default().push(id);
        id
    }

    fn add_channel(&mut self, src_task: u64, dst_task: u64, dst_input_index: u32) -> u64 {
        let id = self.channels.len() as u64 + 1;
        let cross_shard = dst_task != 0
            && matches!(
                (self.task(src_task).shard_id, self.task(dst_task).shard_id),
                (Some(src), Some(dst)) if src != dst
            );
        self.channels.push(Channel {
            id,
            src_task,
            dst_task,
            in_memory: !cross_shard,
            dst_input_index,
        });
        if cross_shard {
            self.has_persistent_channels = true;
        }
        self.task_mut(src_task).outputs.push(id);
        if dst_task != 0 {
            self.task_mut(dst_task).inputs.push(id);
        }
        id
    }

    /// Builds tasks and channels for the whole query.
    pub fn build(
        request: &ExecutionRequest,
        tables: &HashMap<String, TableMeta>,
    ) -> Result<TasksGraph, BuildError> {
        let mut graph = TasksGraph::default();
        for (tx_index, tx) in request.query.transactions.iter().enumerate() {
            graph.build_tx(tx_index, tx, tables)?;
        }
        Ok(graph)
    }

    fn build_tx(
        &mut self,
        tx_index: usize,
        tx: &PhysicalTx,
        tables: &HashMap<String, TableMeta>,
    ) -> Result<(), BuildError> {
        for (stage_index, stage) in tx.stages.iter().enumerate() {
            if stage.table_ops.is_empty() {
                self.build_compute_tasks(tx_index, stage_index, stage);
            } else {
                let meta = tables
                    .get(&stage.table)
                    .ok_or_else(|| BuildError::UnresolvedTable(stage.table.clone()))?;
                match meta.kind {
                    TableKind::SysView => self.build_sysview_tasks(tx_index, stage_index, stage, meta),
                    TableKind::User => self.build_datashard_tasks(tx_index, stage_index, stage, meta)?,
                }
            }
            self.build_stage_channels(tx_index, stage_index, stage);
        }

        // Result channels: every task of a result stage streams into the
        // executer under the result's input index.
        for stage_index in &tx.results {
            let result_index = self.result_count;
            self.result_count += 1;
            for task in self.stage_tasks(tx_index, *stage_index).to_vec() {
                self.add_channel(task, 0, result_index);
            }
        }
        Ok(())
    }

    fn build_compute_tasks(&mut self, tx_index: usize, stage_index: usize, stage: &Stage) {
        let mut partitions = 1u32;
        for input in &stage.inputs {
            let origin_tasks = self.stage_tasks(tx_index, input.stage_index).len() as u32;
            match input.kind {
                ConnectionKind::HashShuffle => {
                    partitions = partitions.max(origin_tasks / 2).clamp(1, MAX_HASH_SHUFFLE_TASKS);
                }
                ConnectionKind::Map => partitions = origin_tasks.max(1),
                _ => (),
            }
        }
        for _ in 0..partitions {
            let id = self.add_task(tx_index, stage_index, None, None);
            tracing::debug!(tx_index, stage_index, task = id, "created compute task");
        }
    }

    // One scan task per partition of the system view.
    fn build_sysview_tasks(&mut self, tx_index: usize, stage_index: usize, stage: &Stage, meta: &TableMeta) {
        for _partition in &meta.partitions {
            let id = self.add_task(tx_index, stage_index, None, Some(meta.table));
            let task = self.task_mut(id);
            for op in &stage.table_ops {
                if let Some(reads) = reads_of(op) {
                    task.reads.push(reads);
                }
            }
        }
    }

    fn build_datashard_tasks(
        &mut self,
        tx_index: usize,
        stage_index: usize,
        stage: &Stage,
        meta: &TableMeta,
    ) -> Result<(), BuildError> {
        let mut shard_tasks: HashMap<u64, u64> = HashMap::new();

        for op in &stage.table_ops {
            match op {
                TableOp::ReadRange { range, columns, items_limit, reverse } => {
                    let pruned = prune_range(meta, range);
                    self.fill_shard_reads(
                        tx_index, stage_index, meta, &mut shard_tasks, pruned, columns, *items_limit, *reverse,
                    )?;
                }
                TableOp::ReadRanges { ranges, columns, items_limit, reverse } => {
                    let pruned = prune_ranges(meta, ranges);
                    self.fill_shard_reads(
                        tx_index, stage_index, meta, &mut shard_tasks, pruned, columns, *items_limit, *reverse,
                    )?;
                }
                TableOp::Lookup { keys, columns } => {
                    let pruned: BTreeMap<u64, Vec<KeyRange>> = prune_keys(meta, keys)
                        .into_iter()
                        .map(|(shard, keys)| {
                            (shard, keys.into_iter().map(KeyRange::from_point).collect())
                        })
                        .collect();
                    self.fill_shard_reads(
                        tx_index, stage_index, meta, &mut shard_tasks, pruned, columns, 0, false,
                    )?;
                }
                TableOp::UpsertRows { .. } | TableOp::DeleteRows { .. } => {
                    if stage.inputs.len() > 1 {
                        return Err(BuildError::EffectStageInputs);
                    }
                    if let Some(input) = stage
                        .inputs
                        .first()
                        .filter(|i| i.kind == ConnectionKind::MapShard)
                    {
                        self.fill_effects_over_input(tx_index, stage_index, input, meta, &mut shard_tasks, op)?;
                    } else {
                        self.fill_pruned_effects(tx_index, stage_index, meta, &mut shard_tasks, op);
                    }
                }
            }
        }

        tracing::debug!(
            tx_index,
            stage_index,
            shards = shard_tasks.len(),
            "stage mapped onto shards"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_shard_reads(
        &mut self,
        tx_index: usize,
        stage_index: usize,
        meta: &TableMeta,
        shard_tasks: &mut HashMap<u64, u64>,
        pruned: BTreeMap<u64, Vec<KeyRange>>,
        columns: &[u32],
        items_limit: u64,
        reverse: bool,
    ) -> Result<(), BuildError> {
        for (shard, ranges) in pruned {
            let task_id = self.shard_task(tx_index, stage_index, meta, shard_tasks, shard);
            let task = self.task_mut(task_id);
            // The limit and direction must agree across every read of the
            // stage; shards cannot merge conflicting scans.
            if let Some(existing) = task.reads.first() {
                if existing.items_limit != items_limit || existing.reverse != reverse {
                    return Err(BuildError::InconsistentReadSettings);
                }
            }
            task.reads.push(TaskReads { ranges, columns: columns.to_vec(), items_limit, reverse });
        }
        Ok(())
    }

    fn fill_effects_over_input(
        &mut self,
        tx_index: usize,
        stage_index: usize,
        input: &Connection,
        meta: &TableMeta,
        shard_tasks: &mut HashMap<u64, u64>,
        op: &TableOp,
    ) -> Result<(), BuildError> {
        let origin_tasks = self.stage_tasks(tx_index, input.stage_index).to_vec();
        for origin_id in origin_tasks {
            let origin = self.task(origin_id);
            let Some(shard) = origin.shard_id else {
                return Err(BuildError::MapShardWithoutReads);
            };
            if origin.reads.is_empty() {
                return Err(BuildError::MapShardWithoutReads);
            }
            let origin_ranges: Vec<KeyRange> =
                origin.reads.iter().flat_map(|r| r.ranges.clone()).collect();

            let task_id = self.shard_task(tx_index, stage_index, meta, shard_tasks, shard);
            let task = self.task_mut(task_id);
            let writes = task.writes.get_or_insert_with(TaskWrites::default);
            writes.ranges.extend(origin_ranges);
            match op {
                TableOp::DeleteRows { .. } => writes.has_erases = true,
                _ => writes.has_updates = true,
            }
        }
        Ok(())
    }

    fn fill_pruned_effects(
        &mut self,
        tx_index: usize,
        stage_index: usize,
        meta: &TableMeta,
        shard_tasks: &mut HashMap<u64, u64>,
        op: &TableOp,
    ) {
        let (keys, columns, erase): (Vec<OwnedKey>, Vec<(u32, u64)>, bool) = match op {
            TableOp::UpsertRows { rows } => {
                let mut column_sizes: HashMap<u32, u64> = HashMap::new();
                for row in rows {
                    for (id, cell) in &row.columns {
                        let size = column_sizes.entry(*id).or_default();
                        *size = (*size).max(cell.payload_len() as u64);
                    }
                }
                (
                    rows.iter().map(|r| r.key.clone()).collect(),
                    column_sizes.into_iter().collect(),
                    false,
                )
            }
            TableOp::DeleteRows { keys } => (keys.clone(), Vec::new(), true),
            _ => unreachable!("only effects reach here"),
        };

        for (shard, shard_keys) in prune_keys(meta, &keys) {
            let task_id = self.shard_task(tx_index, stage_index, meta, shard_tasks, shard);
            let task = self.task_mut(task_id);
            let writes = task.writes.get_or_insert_with(TaskWrites::default);
            for key in shard_keys {
                writes.ranges.push(KeyRange::from_point(key));
            }
            if erase {
                writes.has_erases = true;
            } else {
                writes.has_updates = true;
                for (id, size) in &columns {
                    let max = writes.column_writes.entry(*id).or_default();
                    *max = (*max).max(*size);
                }
            }
        }
    }

    fn shard_task(
        &mut self,
        tx_index: usize,
        stage_index: usize,
        meta: &TableMeta,
        shard_tasks: &mut HashMap<u64, u64>,
        shard: u64,
    ) -> u64 {
        if let Some(&task) = shard_tasks.get(&shard) {
            return task;
        }
        let id = self.add_task(tx_index, stage_index, Some(shard), Some(meta.table));
        shard_tasks.insert(shard, id);
        id
    }

    fn build_stage_channels(&mut self, tx_index: usize, stage_index: usize, stage: &Stage) {
        for (input_index, input) in stage.inputs.iter().enumerate() {
            let origins = self.stage_tasks(tx_index, input.stage_index).to_vec();
            let targets = self.stage_tasks(tx_index, stage_index).to_vec();

            match input.kind {
                ConnectionKind::Map => {
                    // One-to-one by position; counts match by construction.
                    for (src, dst) in origins.iter().zip(targets.iter()) {
                        self.add_channel(*src, *dst, input_index as u32);
                    }
                }
                ConnectionKind::MapShard => {
                    // Same-shard pairing for effects over upstream reads.
                    for src in &origins {
                        let src_shard = self.task(*src).shard_id;
                        for dst in &targets {
                            if self.task(*dst).shard_id == src_shard {
                                self.add_channel(*src, *dst, input_index as u32);
                            }
                        }
                    }
                }
                _ => {
                    for src in &origins {
                        for dst in &targets {
                            self.add_channel(*src, *dst, input_index as u32);
                        }
                    }
                }
            }
        }
    }

    /// Shards with at least one task.
    pub fn affected_shards(&self) -> BTreeSet<u64> {
        self.tasks.iter().filter_map(|t| t.shard_id).collect()
    }

    pub fn compute_task_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.shard_id.is_none()).count()
    }

    /// Renders a task into its wire form for a shard transaction body.
    pub fn task_desc(&self, id: u64, program: &[u8]) -> TaskDesc {
        let task = self.task(id);
        TaskDesc {
            id: task.id,
            stage_id: task.stage_index as u32,
            table: task.table,
            reads: task
                .reads
                .iter()
                .map(|r| ReadTaskMeta {
                    ranges: r.ranges.iter().map(wire_range).collect(),
                    columns: r.columns.clone(),
                    items_limit: r.items_limit,
                    reverse: r.reverse,
                })
                .collect(),
            writes: task.writes.as_ref().map(|w| WriteTaskMeta {
                ranges: w.ranges.iter().map(wire_range).collect(),
                is_pure_erase: w.is_pure_erase(),
                columns: w
                    .column_writes
                    .iter()
                    .map(|(id, size)| ColumnWriteMeta { column_id: *id, max_value_size_bytes: *size })
                    .collect(),
            }),
            program: program.to_vec(),
            inputs: task.inputs.iter().map(|c| self.channel_desc(*c)).collect(),
            outputs: task.outputs.iter().map(|c| self.channel_desc(*c)).collect(),
        }
    }

    pub fn channel_desc(&self, id: u64) -> ChannelDesc {
        let channel = self.channel(id);
        ChannelDesc {
            id: channel.id,
            src_task: channel.src_task,
            dst_task: channel.dst_task,
            in_memory: channel.in_memory,
            persistent: !channel.in_memory,
            dst_input_index: channel.dst_input_index,
        }
    }

    /// Groups the shard-bound tasks into per-shard transaction bodies.
    pub fn build_datashard_bodies(&self, query: &crate::physical::PhysicalQuery) -> BTreeMap<u64, DataTxBody> {
        let mut bodies: BTreeMap<u64, DataTxBody> = BTreeMap::new();
        for task in &self.tasks {
            let Some(shard) = task.shard_id else { continue };
            let program = &query.transactions[task.tx_index].stages[task.stage_index].program;
            bodies
                .entry(shard)
                .or_default()
                .tasks
                .push(self.task_desc(task.id, program));
        }
        bodies
    }
}

fn reads_of(op: &TableOp) -> Option<TaskReads> {
    match op {
        TableOp::ReadRange { range, columns, items_limit, reverse } => Some(TaskReads {
            ranges: vec![range.clone()],
            columns: columns.clone(),
            items_limit: *items_limit,
            reverse: *reverse,
        }),
        TableOp::ReadRanges { ranges, columns, items_limit, reverse } => Some(TaskReads {
            ranges: ranges.clone(),
            columns: columns.clone(),
            items_limit: *items_limit,
            reverse: *reverse,
        }),
        TableOp::Lookup { keys, columns } => Some(TaskReads {
            ranges: keys.iter().cloned().map(KeyRange::from_point).collect(),
            columns: columns.clone(),
            items_limit: 0,
            reverse: false,
        }),
        _ => None,
    }
}

pub fn wire_range(range: &KeyRange) -> ReadRange {
    ReadRange {
        from: encode_cells(&range.from.cells),
        to: encode_cells(&range.to.cells),
        from_inclusive: range.from.inclusive,
        to_inclusive: range.to.inclusive,
    }
}
