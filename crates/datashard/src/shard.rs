use crate::chunks::{build_arrow, build_cellvec};
use crate::iterator::{IterState, ReadIteratorState};
use crate::locks::LockTable;
use crate::store::{MemStore, TableStore, Version};
use cells::{decode_cells, encode_cells, encoded_cells_len, Cell, KeyBound, KeyRange, OwnedKey, TableSchema};
use proto_tablet::{
    Issue, IssueCode, ReadAck, ReadRequest, ReadResult, ResultFormat, Status, StatusCode, TableId,
};
use std::collections::{HashMap, HashSet};

pub type ClientId = u64;

/// Messages leaving the shard: result chunks for clients, plus the internal
/// continue loopback that resumes an iterator on the next event-loop round.
#[derive(Debug)]
pub enum Outgoing {
    Result { client: ClientId, result: ReadResult },
    Continue { client: ClientId, read_id: u64 },
}

pub struct ShardConfig {
    pub shard_id: u64,
    pub owner_id: u64,
    pub table_id: u64,
    pub schema: TableSchema,
    pub follower: bool,
    pub generation: u32,
}

/// A data shard serving the streaming read protocol over a local MVCC store.
pub struct Shard<S: TableStore = MemStore> {
    shard_id: u64,
    owner_id: u64,
    table_id: u64,
    schema: TableSchema,
    store: S,
    locks: LockTable,
    follower: bool,
    split: bool,
    mediator_step: u64,
    write_seq: u64,
    registered_snapshots: HashSet<Version>,
    iterators: HashMap<(ClientId, u64), ReadIteratorState>,
    // (snapshot step, client, read id) of reads waiting for the time-cast.
    waiting: Vec<(u64, ClientId, u64)>,
    outbox: Vec<Outgoing>,
    sys_schema: TableSchema,
    sys_rows: Vec<Vec<Cell>>,
}

impl Shard<MemStore> {
    pub fn new(config: ShardConfig) -> Self {
        Self::with_store(config, MemStore::new())
    }
}

impl<S: TableStore> Shard<S> {
    pub fn with_store(config: ShardConfig, store: S) -> Self {
        let table = TableId {
            owner_id: config.owner_id,
            table_id: config.table_id,
            schema_version: config.schema.version,
        };
        let sys_schema = TableSchema::new(
            vec![
                cells::ColumnDef {
                    id: 1,
                    name: "table_id".into(),
                    column_type: cells::CellType::Uint64,
                    key_order: Some(0),
                },
                cells::ColumnDef {
                    id: 2,
                    name: "name".into(),
                    column_type: cells::CellType::Utf8,
                    key_order: None,
                },
                cells::ColumnDef {
                    id: 3,
                    name: "schema_version".into(),
                    column_type: cells::CellType::Uint64,
                    key_order: None,
                },
            ],
            0,
        );
        let sys_rows = vec![vec![
            Cell::Uint64(config.table_id),
            Cell::Utf8("user-table".into()),
            Cell::Uint64(config.schema.version),
        ]];
        Self {
            shard_id: config.shard_id,
            owner_id: config.owner_id,
            table_id: config.table_id,
            locks: LockTable::new(config.shard_id, table, config.generation),
            schema: config.schema,
            store,
            follower: config.follower,
            split: false,
            mediator_step: 0,
            write_seq: 0,
            registered_snapshots: HashSet::new(),
            iterators: HashMap::new(),
            waiting: Vec::new(),
            outbox: Vec::new(),
            sys_schema,
            sys_rows,
        }
    }

    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn mediator_step(&self) -> u64 {
        self.mediator_step
    }

    // ---- local writes and shard-level events ----

    /// Registers a point-in-time snapshot that followers may serve.
    pub fn register_snapshot(&mut self, version: Version) {
        self.registered_snapshots.insert(version);
    }

    pub fn advance_mediator_time(&mut self, step: u64) {
        self.mediator_step = self.mediator_step.max(step);
        let ready: Vec<(ClientId, u64)> = {
            let mediator_step = self.mediator_step;
            let (ready, waiting): (Vec<_>, Vec<_>) =
                std::mem::take(&mut self.waiting).into_iter().partition(|(step, _, _)| *step <= mediator_step);
            self.waiting = waiting;
            ready.into_iter().map(|(_, client, read_id)| (client, read_id)).collect()
        };
        for (client, read_id) in ready {
            self.drive(client, read_id);
        }
    }

    fn next_write_version(&mut self) -> Version {
        self.write_seq += 1;
        Version::new(self.mediator_step, self.write_seq)
    }
}

impl Shard<MemStore> {
    /// Commits a row at the current mediator time, breaking covered locks.
    pub fn upsert(&mut self, key: OwnedKey, row: Vec<Cell>) {
        let version = self.next_write_version();
        self.upsert_at(key, row, version);
    }

    /// Commits a row at an explicit version, breaking covered locks.
    pub fn upsert_at(&mut self, key: OwnedKey, row: Vec<Cell>, version: Version) {
        self.locks.break_by_write(&key);
        self.store.upsert(key, row, version);
    }

    pub fn erase_at(&mut self, key: OwnedKey, version: Version) {
        self.locks.break_by_write(&key);
        self.store.erase(key, version);
    }

    /// Opens a planned writer; HEAD reads over its keys fall back to the
    /// latest committed version until it resolves.
    pub fn plan_write(&mut self, tx_id: u64, keys: Vec<OwnedKey>) {
        self.store.plan_write(tx_id, keys);
    }

    pub fn commit_planned(&mut self, tx_id: u64, version: Version, rows: Vec<(OwnedKey, Option<Vec<Cell>>)>) {
        for (key, _) in &rows {
            self.locks.break_by_write(key);
        }
        self.store.commit_planned(tx_id, version, rows);
    }

    pub fn abort_planned(&mut self, tx_id: u64) {
        self.store.abort_planned(tx_id);
    }
}

impl<S: TableStore> Shard<S> {
    /// A DDL arrived: the schema version advances and live iterators fail
    /// with SCHEME_ERROR on their next step.
    pub fn change_schema(&mut self, schema: TableSchema) {
        self.schema = schema;
        // Exhausted iterators learn about the change on their next ACK; the
        // executing ones on their next continue.
    }

    /// The shard is being split: every live iterator fails with OVERLOADED
    /// and the shard stops serving reads.
    pub fn split(&mut self) {
        self.split = true;
        self.waiting.clear();
        let live: Vec<(ClientId, u64)> = self.iterators.keys().copied().collect();
        for (client, read_id) in live {
            let seq_no = self
                .iterators
                .get_mut(&(client, read_id))
                .map(|iter| iter.consume_seq_no(0, 0))
                .unwrap_or(0);
            self.iterators.remove(&(client, read_id));
            self.push_error(client, read_id, seq_no, StatusCode::Overloaded, "shard is splitting");
        }
    }

    /// The client's pipe is gone: its iterators are dropped without replies.
    pub fn disconnect_client(&mut self, client: ClientId) {
        self.iterators.retain(|(c, _), _| *c != client);
        self.waiting.retain(|(_, c, _)| *c != client);
    }

    /// The client went quiet past the inactivity deadline: every live
    /// iterator of that client fails with TIMEOUT.
    pub fn expire_client(&mut self, client: ClientId) {
        let live: Vec<u64> = self
            .iterators
            .keys()
            .filter(|(c, _)| *c == client)
            .map(|(_, read_id)| *read_id)
            .collect();
        for read_id in live {
            let seq_no = self
                .iterators
                .remove(&(client, read_id))
                .map(|mut iter| iter.consume_seq_no(0, 0))
                .unwrap_or(0);
            self.push_error(client, read_id, seq_no, StatusCode::Timeout, "client inactivity timeout");
        }
        self.waiting.retain(|(_, c, _)| *c != client);
    }

    // ---- the read protocol ----

    pub fn handle_read(&mut self, client: ClientId, request: ReadRequest) {
        let read_id = request.read_id;

        if self.iterators.contains_key(&(client, read_id)) {
            self.push_error(client, read_id, 0, StatusCode::AlreadyExists, "read id is already in use");
            return;
        }
        if self.split {
            self.push_error(client, read_id, 0, StatusCode::Overloaded, "shard is splitting");
            return;
        }

        match self.build_iterator(client, &request) {
            Ok(Some(iterator)) => {
                self.iterators.insert((client, read_id), iterator);
                self.drive(client, read_id);
            }
            Ok(None) => (), // Parked until the mediator time-cast catches up.
            Err((code, message)) => self.push_error(client, read_id, 0, code, &message),
        }
    }

    pub fn handle_ack(&mut self, client: ClientId, ack: ReadAck) {
        let Some(iterator) = self.iterators.get_mut(&(client, ack.read_id)) else {
            // Finished, cancelled, or never existed: silently dropped.
            return;
        };
        if ack.seq_no < iterator.last_ack_seq_no || ack.seq_no > iterator.seq_no {
            tracing::debug!(
                client,
                read_id = ack.read_id,
                seq_no = ack.seq_no,
                last_ack = iterator.last_ack_seq_no,
                "ignoring out-of-window ack"
            );
            return;
        }
        iterator.up_quota(ack.seq_no, ack.max_rows, ack.max_bytes);
        if iterator.state == IterState::Executing {
            self.outbox.push(Outgoing::Continue { client, read_id: ack.read_id });
        }
    }

    pub fn handle_cancel(&mut self, client: ClientId, read_id: u64) {
        self.iterators.remove(&(client, read_id));
        self.waiting.retain(|(_, c, r)| !(*c == client && *r == read_id));
    }

    /// The internal loopback resuming a paused iterator.
    pub fn handle_continue(&mut self, client: ClientId, read_id: u64) {
        let executing = self
            .iterators
            .get(&(client, read_id))
            .map(|iter| iter.state == IterState::Executing)
            .unwrap_or(false);
        if executing {
            self.drive(client, read_id);
        }
    }

    // ---- request validation and iterator construction ----

    fn build_iterator(
        &mut self,
        client: ClientId,
        request: &ReadRequest,
    ) -> Result<Option<ReadIteratorState>, (StatusCode, String)> {
        let table = request
            .table
            .ok_or((StatusCode::BadRequest, "missing table id".to_string()))?;
        let sys = table.owner_id == self.shard_id;

        let format = match request.result_format() {
            ResultFormat::Unspecified => {
                return Err((StatusCode::BadRequest, "result format is not set".into()))
            }
            format => format,
        };

        let schema = if sys {
            if format == ResultFormat::Arrow {
                return Err((StatusCode::BadRequest, "system tables do not support arrow results".into()));
            }
            if table.schema_version != 0 {
                return Err((
                    StatusCode::SchemeError,
                    "system tables are not versioned".into(),
                ));
            }
            &self.sys_schema
        } else {
            if table.owner_id != self.owner_id || table.table_id != self.table_id {
                return Err((
                    StatusCode::SchemeError,
                    format!("unknown table {}:{}", table.owner_id, table.table_id),
                ));
            }
            if table.schema_version != 0 && table.schema_version != self.schema.version {
                return Err((
                    StatusCode::SchemeError,
                    format!(
                        "schema version mismatch: requested {}, current {}",
                        table.schema_version, self.schema.version
                    ),
                ));
            }
            &self.schema
        };

        if request.columns.is_empty() {
            return Err((StatusCode::BadRequest, "empty column list".into()));
        }
        for column in &request.columns {
            if schema.column(*column).is_none() {
                return Err((StatusCode::SchemeError, format!("unknown column {column}")));
            }
        }

        // Follower rules: no HEAD reads, and only registered snapshots.
        let snapshot = request.snapshot.filter(|s| s.is_valid());
        let version = match snapshot {
            Some(snapshot) => Some(Version::new(snapshot.step, snapshot.tx_id)),
            None => None,
        };
        if self.follower && !sys {
            match version {
                None => {
                    return Err((
                        StatusCode::Unsupported,
                        "followers do not serve head reads".into(),
                    ))
                }
                Some(v) if !self.registered_snapshots.contains(&v) => {
                    return Err((
                        StatusCode::NotFound,
                        "followers do not carry the version log".into(),
                    ))
                }
                Some(_) => (),
            }
        }

        let key_types = schema.key_types();
        let mut queries = Vec::with_capacity(request.keys.len() + request.ranges.len());
        for raw in &request.keys {
            let key = decode_cells(raw)
                .map_err(|e| (StatusCode::BadRequest, format!("bad key: {e}")))?;
            if key.len() > key_types.len() {
                return Err((StatusCode::BadRequest, "key is wider than the primary key".into()));
            }
            for (cell, expected) in key.iter().zip(&key_types) {
                if !cell.matches(*expected) {
                    return Err((StatusCode::BadRequest, "key cell type mismatch".into()));
                }
            }
            // A full-arity key is a point; a shorter one covers the prefix.
            queries.push(KeyRange::from_prefix(key));
        }
        for raw in &request.ranges {
            let from = decode_cells(&raw.from)
                .map_err(|e| (StatusCode::BadRequest, format!("bad range start: {e}")))?;
            let to = decode_cells(&raw.to)
                .map_err(|e| (StatusCode::BadRequest, format!("bad range end: {e}")))?;
            queries.push(KeyRange::new(
                KeyBound { cells: from, inclusive: raw.from_inclusive },
                KeyBound { cells: to, inclusive: raw.to_inclusive },
            ));
        }
        if queries.is_empty() {
            return Err((StatusCode::BadRequest, "neither keys nor ranges given".into()));
        }

        let mut iterator = ReadIteratorState::new(request.read_id, request.max_rows, request.max_bytes);
        iterator.schema_version = schema.version;
        iterator.sys = sys;
        iterator.format = format;
        iterator.columns = request.columns.clone();
        iterator.reverse = request.reverse;
        iterator.max_rows_in_result = request.max_rows_in_result;
        iterator.lock_tx_id = request.lock_tx_id.filter(|_| !sys);
        // System tables are unversioned; their snapshot field is ignored.
        iterator.version = if sys { Some(Version::HEAD) } else { version };
        iterator.queries = queries;

        // Locks cover the full requested key space, resumption included.
        if let Some(lock_tx_id) = iterator.lock_tx_id {
            let at = iterator.version.unwrap_or(Version::HEAD);
            for range in &iterator.queries {
                self.locks.attach(lock_tx_id, range.clone(), at);
            }
        }

        // A snapshot from the future parks the read until the time-cast
        // crosses its step.
        if let Some(v) = version {
            if !sys && v.step > self.mediator_step && !self.registered_snapshots.contains(&v) {
                self.waiting.push((v.step, client, request.read_id));
                self.iterators.insert((client, request.read_id), iterator);
                tracing::debug!(
                    client,
                    read_id = request.read_id,
                    step = v.step,
                    mediator = self.mediator_step,
                    "read parked until mediator time"
                );
                return Ok(None);
            }
        }

        Ok(Some(iterator))
    }

    // ---- chunk production ----

    // Produces one result chunk for the iterator, then either loops back via
    // Continue, goes exhausted, or finishes.
    fn drive(&mut self, client: ClientId, read_id: u64) {
        // Reads parked on a future snapshot wait for the time-cast alone.
        if self.waiting.iter().any(|(_, c, r)| *c == client && *r == read_id) {
            return;
        }
        let Some(mut iterator) = self.iterators.remove(&(client, read_id)) else {
            return;
        };

        // A schema change invalidates the iterator at its next step.
        if !iterator.sys && iterator.schema_version != self.schema.version {
            let seq_no = iterator.consume_seq_no(0, 0);
            self.push_error(client, read_id, seq_no, StatusCode::SchemeError, "schema changed");
            return;
        }

        // HEAD resolution: fall back to the latest committed version while a
        // planned writer conflicts with the requested key space.
        if iterator.version.is_none() {
            let conflict = iterator.queries.iter().any(|range| self.store.has_open_writer(range));
            iterator.version = Some(if conflict {
                let at = self.store.head_version();
                tracing::debug!(client, read_id, ?at, "head read restarted at committed version");
                at
            } else {
                Version::HEAD
            });
        }
        let at = iterator.version.expect("resolved above");

        let chunk_cap = iterator.chunk_row_cap();
        let mut rows: Vec<Vec<Cell>> = Vec::new();
        let mut bytes: u64 = 0;
        let mut saw_newer = false;

        let (schema, sys_rows) = if iterator.sys {
            (&self.sys_schema, Some(&self.sys_rows))
        } else {
            (&self.schema, None)
        };
        let projection: Vec<&cells::ColumnDef> = iterator
            .columns
            .iter()
            .map(|id| schema.column(*id).expect("columns validated on entry"))
            .collect();
        let key_columns = schema.key_columns();
        // Stored rows carry value columns in schema order.
        let value_columns: Vec<u32> = schema
            .columns
            .iter()
            .filter(|c| c.key_order.is_none())
            .map(|c| c.id)
            .collect();

        while !iterator.finished_all_queries() && (rows.len() as u64) < chunk_cap {
            let range = &iterator.queries[iterator.current_query];
            let budget = (chunk_cap - rows.len() as u64).min(u16::MAX as u64) as usize;

            let page = match sys_rows {
                Some(sys_rows) => {
                    scan_static(sys_rows, &key_columns, range, iterator.last_key.as_ref(), iterator.reverse, budget)
                }
                None => self.store.scan(range, iterator.last_key.as_ref(), iterator.reverse, at, budget),
            };
            saw_newer |= page.saw_newer_version;

            for item in page.items {
                let projected: Vec<Cell> = projection
                    .iter()
                    .map(|col| project_column(col, &value_columns, &item.key, &item.row))
                    .collect();
                bytes += encoded_cells_len(&projected) as u64;
                iterator.last_key = Some(item.key);
                rows.push(projected);
            }

            if page.exhausted {
                iterator.current_query += 1;
                iterator.last_key = None;
            }
            if bytes >= iterator.quota.bytes {
                break;
            }
        }

        // Reads that skipped rows invisible at their snapshot break their
        // own lock: the skipped write committed above the read version.
        if saw_newer && !at.is_head() {
            if let Some(lock_tx_id) = iterator.lock_tx_id {
                self.locks.break_lock(lock_tx_id);
            }
        }

        let finished = iterator.finished_all_queries();
        let seq_no = iterator.consume_seq_no(rows.len() as u64, bytes);
        let limit_reached = iterator.state == IterState::Exhausted && !finished;

        let mut result = ReadResult {
            read_id,
            seq_no,
            finished,
            limit_reached,
            rows_count: rows.len() as u32,
            result_format: iterator.format as i32,
            cells: Vec::new(),
            arrow_batch: Vec::new(),
            tx_locks: Vec::new(),
            broken_tx_locks: Vec::new(),
            status: Some(Status::success()),
            continuation_token: iterator
                .last_key
                .as_ref()
                .map(|key| encode_cells(key.cells()))
                .unwrap_or_default(),
        };
        match iterator.format {
            ResultFormat::Arrow => match build_arrow(&projection, &rows) {
                Ok(batch) => result.arrow_batch = batch,
                Err(error) => {
                    tracing::error!(client, read_id, %error, "failed to encode arrow batch");
                    self.push_error(client, read_id, seq_no, StatusCode::InternalError, "arrow encoding failed");
                    return;
                }
            },
            _ => result.cells = build_cellvec(&rows),
        }
        if let Some(lock_tx_id) = iterator.lock_tx_id {
            if let Some((lock, broken)) = self.locks.get(lock_tx_id) {
                if broken {
                    result.broken_tx_locks.push(lock);
                } else {
                    result.tx_locks.push(lock);
                }
            }
        }

        metrics::counter!("datashard_read_rows_total").increment(rows.len() as u64);
        metrics::counter!("datashard_read_bytes_total").increment(bytes);
        tracing::trace!(
            client,
            read_id,
            seq_no,
            rows = rows.len(),
            bytes,
            finished,
            limit_reached,
            "read chunk"
        );

        self.outbox.push(Outgoing::Result { client, result });

        if finished {
            // The iterator is done; later ACKs for it are silently dropped.
            return;
        }
        let executing = iterator.state == IterState::Executing;
        self.iterators.insert((client, read_id), iterator);
        if executing {
            self.outbox.push(Outgoing::Continue { client, read_id });
        }
    }

    fn push_error(&mut self, client: ClientId, read_id: u64, seq_no: u64, code: StatusCode, message: &str) {
        let issue_code = match code {
            StatusCode::SchemeError => IssueCode::SchemeMismatch,
            StatusCode::Overloaded => IssueCode::Overloaded,
            StatusCode::BadRequest => IssueCode::BadRequest,
            _ => IssueCode::Default,
        };
        tracing::debug!(client, read_id, ?code, message, "read failed");
        self.outbox.push(Outgoing::Result {
            client,
            result: ReadResult {
                read_id,
                seq_no,
                finished: true,
                status: Some(Status::error(code, Issue::new(issue_code, message))),
                ..Default::default()
            },
        });
    }
}

fn project_column(
    column: &cells::ColumnDef,
    value_columns: &[u32],
    key: &OwnedKey,
    row: &[Cell],
) -> Cell {
    if let Some(order) = column.key_order {
        return key.cells().get(order as usize).cloned().unwrap_or(Cell::Null);
    }
    match value_columns.iter().position(|id| *id == column.id) {
        Some(index) => row.get(index).cloned().unwrap_or(Cell::Null),
        None => Cell::Null,
    }
}

// Serves the static system rows with plain range semantics.
fn scan_static(
    rows: &[Vec<Cell>],
    key_columns: &[&cells::ColumnDef],
    range: &KeyRange,
    after: Option<&OwnedKey>,
    reverse: bool,
    limit: usize,
) -> crate::store::ScanPage {
    let mut page = crate::store::ScanPage::default();
    let key_arity = key_columns.len();

    let mut ordered: Vec<&Vec<Cell>> = rows.iter().collect();
    ordered.sort_by(|a, b| OwnedKey::new(a[..key_arity].to_vec()).cmp(&OwnedKey::new(b[..key_arity].to_vec())));
    if reverse {
        ordered.reverse();
    }

    for row in ordered {
        let key = OwnedKey::new(row[..key_arity].to_vec());
        if !range.contains(key.cells()) {
            continue;
        }
        let past = match after {
            None => true,
            Some(cursor) => {
                if reverse {
                    key < *cursor
                } else {
                    key > *cursor
                }
            }
        };
        if !past {
            continue;
        }
        if page.items.len() >= limit {
            // Another row exists past the budget: not exhausted yet.
            return page;
        }
        page.items.push(crate::store::ScanItem { key, row: row[key_arity..].to_vec() });
    }
    page.exhausted = true;
    page
}
