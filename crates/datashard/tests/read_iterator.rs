use cells::{encode_cells, test_schema, Cell, ColumnDef, OwnedKey, TableSchema};
use datashard::{decode_arrow, MemStore, Outgoing, Shard, ShardConfig, Version};
use proto_tablet::{ReadAck, ReadRequest, ReadResult, ResultFormat, Snapshot, StatusCode, TableId};
use std::collections::VecDeque;

const SHARD_ID: u64 = 100;
const OWNER_ID: u64 = 800;
const TABLE_ID: u64 = 5;
const SNAPSHOT: Snapshot = Snapshot { step: 50, tx_id: u64::MAX };

struct Harness {
    shard: Shard<MemStore>,
    schema: TableSchema,
    results: VecDeque<ReadResult>,
    continues: VecDeque<(u64, u64)>,
    continue_count: u32,
}

fn u32_cells(values: &[u32]) -> Vec<Cell> {
    values.iter().map(|v| Cell::Uint32(*v)).collect()
}

fn u32_key(values: &[u32]) -> OwnedKey {
    OwnedKey::new(u32_cells(values))
}

impl Harness {
    fn new() -> Self {
        Self::with_follower(false)
    }

    fn with_follower(follower: bool) -> Self {
        let schema = test_schema(1);
        let mut shard = Shard::new(ShardConfig {
            shard_id: SHARD_ID,
            owner_id: OWNER_ID,
            table_id: TABLE_ID,
            schema: schema.clone(),
            follower,
            generation: 1,
        });
        shard.advance_mediator_time(100);
        for (i, (key, value)) in [
            ([1u32, 1, 1], 100u32),
            ([3, 3, 3], 300),
            ([5, 5, 5], 500),
            ([8, 0, 0], 800),
            ([8, 0, 1], 801),
            ([8, 1, 0], 802),
            ([8, 1, 1], 803),
            ([11, 11, 11], 1111),
        ]
        .iter()
        .enumerate()
        {
            shard.upsert_at(u32_key(key), vec![Cell::Uint32(*value)], Version::new(10, i as u64 + 1));
        }
        shard.register_snapshot(Version::new(SNAPSHOT.step, SNAPSHOT.tx_id));
        Self {
            shard,
            schema,
            results: VecDeque::new(),
            continues: VecDeque::new(),
            continue_count: 0,
        }
    }

    fn base_read(&self, read_id: u64, format: ResultFormat) -> ReadRequest {
        ReadRequest {
            read_id,
            table: Some(TableId { owner_id: OWNER_ID, table_id: TABLE_ID, schema_version: 1 }),
            columns: vec![1, 2, 3, 4],
            snapshot: Some(SNAPSHOT),
            result_format: format as i32,
            ..Default::default()
        }
    }

    fn drain(&mut self) {
        for outgoing in self.shard.take_outbox() {
            match outgoing {
                Outgoing::Result { result, .. } => self.results.push_back(result),
                Outgoing::Continue { client, read_id } => {
                    self.continue_count += 1;
                    self.continues.push_back((client, read_id));
                }
            }
        }
    }

    /// Sends a read and returns its first chunk. Internal continues stay
    /// queued until `next_result` processes them.
    fn send_read(&mut self, client: u64, request: ReadRequest) -> ReadResult {
        self.shard.handle_read(client, request);
        self.drain();
        self.results.pop_front().expect("read must produce a first chunk")
    }

    fn send_read_no_result(&mut self, client: u64, request: ReadRequest) {
        self.shard.handle_read(client, request);
        self.drain();
        assert!(self.results.is_empty(), "expected no immediate result");
    }

    /// Delivers the next chunk, driving queued internal continues as needed.
    fn next_result(&mut self) -> Option<ReadResult> {
        loop {
            if let Some(result) = self.results.pop_front() {
                return Some(result);
            }
            let (client, read_id) = self.continues.pop_front()?;
            self.shard.handle_continue(client, read_id);
            self.drain();
        }
    }

    fn send_ack(&mut self, client: u64, result: &ReadResult, max_rows: u64, max_bytes: u64) {
        self.shard.handle_ack(
            client,
            ReadAck { read_id: result.read_id, seq_no: result.seq_no, max_rows, max_bytes },
        );
        self.drain();
    }

    fn projected(&self, columns: &[u32]) -> Vec<ColumnDef> {
        columns
            .iter()
            .map(|id| self.schema.column(*id).expect("known column").clone())
            .collect()
    }

    fn rows_of(&self, result: &ReadResult) -> Vec<Vec<Cell>> {
        rows_of_with(result, &self.projected(&[1, 2, 3, 4]))
    }
}

fn rows_of_with(result: &ReadResult, columns: &[ColumnDef]) -> Vec<Vec<Cell>> {
    assert_eq!(result.status_code(), StatusCode::Success, "issues: {:?}", result.status);
    match result.result_format() {
        ResultFormat::Arrow => {
            let refs: Vec<&ColumnDef> = columns.iter().collect();
            if result.arrow_batch.is_empty() {
                Vec::new()
            } else {
                decode_arrow(&result.arrow_batch, &refs).expect("valid arrow batch")
            }
        }
        _ => result
            .cells
            .iter()
            .map(|row| cells::decode_cells(row).expect("valid cellvec row"))
            .collect(),
    }
}

fn check_rows(result: &ReadResult, harness: &Harness, expected: &[[u32; 4]]) {
    let rows = harness.rows_of(result);
    let expected: Vec<Vec<Cell>> = expected.iter().map(|row| u32_cells(row)).collect();
    assert_eq!(rows, expected);
    assert_eq!(result.rows_count as usize, expected.len());
}

fn add_key_query(request: &mut ReadRequest, key: &[u32]) {
    request.keys.push(encode_cells(&u32_cells(key)));
}

fn add_range_query(request: &mut ReadRequest, from: &[u32], from_inclusive: bool, to: &[u32], to_inclusive: bool) {
    request.ranges.push(proto_tablet::ReadRange {
        from: encode_cells(&u32_cells(from)),
        to: encode_cells(&u32_cells(to)),
        from_inclusive,
        to_inclusive,
    });
}

fn read_key_test(format: ResultFormat) {
    let mut harness = Harness::new();
    for k in [1u32, 3, 5] {
        let mut request = harness.base_read(1, format);
        add_key_query(&mut request, &[k, k, k]);
        let result = harness.send_read(1, request);
        check_rows(&result, &harness, &[[k, k, k, k * 100]]);
        assert!(result.finished);
        assert_eq!(result.seq_no, 1);
        // The finished iterator is gone; the same read id is free again.
    }
}

#[test]
fn should_read_key_cellvec() {
    read_key_test(ResultFormat::CellVec);
}

#[test]
fn should_read_key_arrow() {
    read_key_test(ResultFormat::Arrow);
}

#[test]
fn should_read_non_existing_key() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_key_query(&mut request, &[2, 2, 2]);
    let result = harness.send_read(1, request);
    assert!(result.finished);
    assert_eq!(result.rows_count, 0);
}

#[test]
fn should_read_multiple_keys_in_request_order() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_key_query(&mut request, &[3, 3, 3]);
    add_key_query(&mut request, &[1, 1, 1]);
    add_key_query(&mut request, &[5, 5, 5]);
    let result = harness.send_read(1, request);
    check_rows(&result, &harness, &[[3, 3, 3, 300], [1, 1, 1, 100], [5, 5, 5, 500]]);
    assert!(result.finished);
    assert_eq!(result.seq_no, 1);
}

#[test]
fn should_read_multiple_keys_one_by_one() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_key_query(&mut request, &[3, 3, 3]);
    add_key_query(&mut request, &[1, 1, 1]);
    add_key_query(&mut request, &[5, 5, 5]);
    request.max_rows_in_result = 1;

    let first = harness.send_read(1, request);
    check_rows(&first, &harness, &[[3, 3, 3, 300]]);
    assert!(!first.limit_reached);
    assert!(!first.finished);
    assert_eq!(first.seq_no, 1);

    let second = harness.next_result().expect("second chunk");
    check_rows(&second, &harness, &[[1, 1, 1, 100]]);
    assert!(!second.finished);
    assert_eq!(second.seq_no, 2);

    let third = harness.next_result().expect("third chunk");
    check_rows(&third, &harness, &[[5, 5, 5, 500]]);
    assert!(third.finished);
    assert_eq!(third.seq_no, 3);

    assert_eq!(harness.continue_count, 2);
    assert!(harness.next_result().is_none());
}

#[test]
fn should_handle_read_ack() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    for _ in 0..8 {
        add_key_query(&mut request, &[1, 1, 1]);
    }
    request.max_rows = 1;

    let first = harness.send_read(1, request);
    check_rows(&first, &harness, &[[1, 1, 1, 100]]);
    assert_eq!(harness.continue_count, 0);

    harness.send_ack(1, &first, 3, 10_000);
    let second = harness.next_result().expect("chunk after ack");
    check_rows(&second, &harness, &[[1, 1, 1, 100], [1, 1, 1, 100], [1, 1, 1, 100]]);
    assert_eq!(harness.continue_count, 1);

    harness.send_ack(1, &second, 100, 10_000);
    let third = harness.next_result().expect("final chunk");
    check_rows(
        &third,
        &harness,
        &[[1, 1, 1, 100], [1, 1, 1, 100], [1, 1, 1, 100], [1, 1, 1, 100]],
    );
    assert!(third.finished);
    assert_eq!(third.seq_no, 3);
    assert_eq!(harness.continue_count, 2);
}

#[test]
fn should_handle_out_of_order_read_ack() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    for _ in 0..8 {
        add_key_query(&mut request, &[1, 1, 1]);
    }
    request.max_rows = 3;
    request.max_rows_in_result = 1;

    let first = harness.send_read(1, request);
    assert!(!first.limit_reached);
    let second = harness.next_result().expect("second chunk");
    assert!(!second.limit_reached);
    let third = harness.next_result().expect("third chunk");
    assert!(third.limit_reached); // quota is empty now
    assert_eq!(harness.continue_count, 2);

    harness.send_ack(1, &third, 1, 10_000);
    // Delivered late and referring to an older chunk: ignored.
    harness.send_ack(1, &second, 10, 10_000);

    let fourth = harness.next_result().expect("chunk after ack");
    assert!(fourth.limit_reached);
    assert_eq!(harness.continue_count, 3);
    assert!(harness.next_result().is_none());

    harness.send_ack(1, &fourth, 1, 10_000);
    let fifth = harness.next_result().expect("chunk after second ack");
    assert!(fifth.limit_reached);
    assert_eq!(harness.continue_count, 4);
}

#[test]
fn should_not_read_after_cancel() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    for _ in 0..8 {
        add_key_query(&mut request, &[1, 1, 1]);
    }
    request.max_rows = 1;

    let first = harness.send_read(1, request);
    check_rows(&first, &harness, &[[1, 1, 1, 100]]);

    harness.shard.handle_cancel(1, 1);
    harness.send_ack(1, &first, 3, 10_000);
    assert!(harness.next_result().is_none());
    assert_eq!(harness.continue_count, 0);
}

#[test]
fn should_forbid_duplicated_read_id() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_key_query(&mut request, &[3, 3, 3]);
    add_key_query(&mut request, &[1, 1, 1]);
    add_key_query(&mut request, &[5, 5, 5]);
    request.max_rows = 1;
    let _first = harness.send_read(1, request);

    let mut duplicate = harness.base_read(1, ResultFormat::CellVec);
    add_key_query(&mut duplicate, &[3, 3, 3]);
    let result = harness.send_read(1, duplicate);
    assert_eq!(result.status_code(), StatusCode::AlreadyExists);
}

fn read_range_inclusive_test(format: ResultFormat) {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, format);
    add_range_query(&mut request, &[1, 1, 1], true, &[5, 5, 5], true);
    let result = harness.send_read(1, request);
    check_rows(&result, &harness, &[[1, 1, 1, 100], [3, 3, 3, 300], [5, 5, 5, 500]]);
}

#[test]
fn should_read_range_inclusive_ends_cellvec() {
    read_range_inclusive_test(ResultFormat::CellVec);
}

#[test]
fn should_read_range_inclusive_ends_arrow() {
    read_range_inclusive_test(ResultFormat::Arrow);
}

#[test]
fn should_read_range_reverse() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    request.reverse = true;
    add_range_query(&mut request, &[1, 1, 1], true, &[5, 5, 5], true);
    let result = harness.send_read(1, request);
    check_rows(&result, &harness, &[[5, 5, 5, 500], [3, 3, 3, 300], [1, 1, 1, 100]]);
}

#[test]
fn should_read_range_with_missing_border_rows() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_range_query(&mut request, &[2, 2, 2], true, &[7, 7, 7], true);
    let result = harness.send_read(1, request);
    check_rows(&result, &harness, &[[3, 3, 3, 300], [5, 5, 5, 500]]);
}

#[test]
fn should_read_range_non_inclusive_ends() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_range_query(&mut request, &[1, 1, 1], false, &[5, 5, 5], false);
    let result = harness.send_read(1, request);
    check_rows(&result, &harness, &[[3, 3, 3, 300]]);
}

#[test]
fn should_read_not_existing_range() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_range_query(&mut request, &[20, 0, 0], true, &[30, 0, 0], true);
    let result = harness.send_read(1, request);
    assert!(result.finished);
    assert_eq!(result.rows_count, 0);
}

#[test]
fn should_read_range_one_by_one_with_acks() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_range_query(&mut request, &[1, 1, 1], true, &[5, 5, 5], true);
    request.max_rows_in_result = 1;
    request.max_rows = 1;

    let mut chunks = vec![harness.send_read(1, request)];
    for _ in 0..2 {
        let last = chunks.last().expect("at least one chunk").clone();
        harness.send_ack(1, &last, 1, 10_000);
        chunks.push(harness.next_result().expect("next chunk"));
    }

    let all: Vec<Vec<Cell>> = chunks.iter().flat_map(|c| harness.rows_of(c)).collect();
    assert_eq!(
        all,
        vec![u32_cells(&[1, 1, 1, 100]), u32_cells(&[3, 3, 3, 300]), u32_cells(&[5, 5, 5, 500])]
    );
    // seq_no is gapless and the final chunk carries finished.
    assert_eq!(chunks.iter().map(|c| c.seq_no).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(chunks.last().expect("chunks").finished);
}

#[test]
fn should_read_key_prefixes() {
    let mut harness = Harness::new();

    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_key_query(&mut request, &[8]);
    let result = harness.send_read(1, request);
    check_rows(
        &result,
        &harness,
        &[[8, 0, 0, 800], [8, 0, 1, 801], [8, 1, 0, 802], [8, 1, 1, 803]],
    );

    let mut request = harness.base_read(2, ResultFormat::CellVec);
    add_key_query(&mut request, &[8, 1]);
    let result = harness.send_read(1, request);
    check_rows(&result, &harness, &[[8, 1, 0, 802], [8, 1, 1, 803]]);
}

#[test]
fn should_read_range_with_short_borders() {
    // A range [(8), (8)] with inclusive short borders covers every key
    // beginning with 8.
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_range_query(&mut request, &[8], true, &[8], true);
    let result = harness.send_read(1, request);
    check_rows(
        &result,
        &harness,
        &[[8, 0, 0, 800], [8, 0, 1, 801], [8, 1, 0, 802], [8, 1, 1, 803]],
    );
}

#[test]
fn should_fail_unknown_columns() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    request.columns = vec![1, 38];
    add_key_query(&mut request, &[1, 1, 1]);
    let result = harness.send_read(1, request);
    assert_eq!(result.status_code(), StatusCode::SchemeError);
}

#[test]
fn should_fail_wrong_schema_version() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    request.table = Some(TableId { owner_id: OWNER_ID, table_id: TABLE_ID, schema_version: 999 });
    add_key_query(&mut request, &[1, 1, 1]);
    let result = harness.send_read(1, request);
    assert_eq!(result.status_code(), StatusCode::SchemeError);
}

#[test]
fn should_fail_empty_request() {
    let mut harness = Harness::new();
    let request = harness.base_read(1, ResultFormat::CellVec);
    let result = harness.send_read(1, request);
    assert_eq!(result.status_code(), StatusCode::BadRequest);

    let mut request = harness.base_read(2, ResultFormat::CellVec);
    request.columns = vec![];
    add_key_query(&mut request, &[1, 1, 1]);
    let result = harness.send_read(1, request);
    assert_eq!(result.status_code(), StatusCode::BadRequest);
}

#[test]
fn should_fail_read_next_after_schema_change() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_key_query(&mut request, &[3, 3, 3]);
    add_key_query(&mut request, &[1, 1, 1]);
    add_key_query(&mut request, &[5, 5, 5]);
    request.max_rows_in_result = 1;

    let first = harness.send_read(1, request);
    assert_eq!(first.seq_no, 1);

    // The DDL lands while the continue is still queued.
    harness.shard.change_schema(test_schema(2));

    let second = harness.next_result().expect("error chunk");
    assert_eq!(second.status_code(), StatusCode::SchemeError);
    assert_eq!(second.seq_no, first.seq_no + 1);
    assert!(harness.next_result().is_none());
}

#[test]
fn should_fail_read_after_schema_change_when_exhausted() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_key_query(&mut request, &[3, 3, 3]);
    add_key_query(&mut request, &[1, 1, 1]);
    request.max_rows = 1; // hangs waiting for an ack

    let first = harness.send_read(1, request);
    harness.shard.change_schema(test_schema(2));

    harness.send_ack(1, &first, 3, 10_000);
    let second = harness.next_result().expect("error chunk");
    assert_eq!(second.status_code(), StatusCode::SchemeError);
    assert_eq!(second.read_id, first.read_id);

    // The iterator is gone; further ACKs are dropped.
    harness.send_ack(1, &first, 3, 10_000);
    assert!(harness.next_result().is_none());
}

#[test]
fn should_receive_error_after_split() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_key_query(&mut request, &[3, 3, 3]);
    add_key_query(&mut request, &[1, 1, 1]);
    add_key_query(&mut request, &[5, 5, 5]);
    request.max_rows_in_result = 1;

    let first = harness.send_read(1, request);

    harness.shard.split();
    harness.drain();
    let second = harness.results.pop_front().expect("split error chunk");
    assert_eq!(second.status_code(), StatusCode::Overloaded);
    assert_eq!(second.seq_no, first.seq_no + 1);

    // The queued continue must not produce anything further.
    assert!(harness.next_result().is_none());
}

#[test]
fn should_receive_error_after_split_when_exhausted() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_key_query(&mut request, &[3, 3, 3]);
    add_key_query(&mut request, &[1, 1, 1]);
    request.max_rows = 1;

    let first = harness.send_read(1, request);

    harness.shard.split();
    harness.drain();
    let second = harness.results.pop_front().expect("split error chunk");
    assert_eq!(second.status_code(), StatusCode::Overloaded);
    assert_eq!(second.seq_no, first.seq_no + 1);
}

#[test]
fn no_error_on_final_ack() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_key_query(&mut request, &[3, 3, 3]);

    let first = harness.send_read(1, request);
    assert!(first.finished);

    harness.send_ack(1, &first, 300, 10_000);
    assert!(harness.next_result().is_none());
}

#[test]
fn should_read_registered_snapshot_from_follower() {
    let mut harness = Harness::with_follower(true);
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_key_query(&mut request, &[3, 3, 3]);
    let result = harness.send_read(1, request);
    check_rows(&result, &harness, &[[3, 3, 3, 300]]);
}

#[test]
fn should_not_read_mvcc_from_follower() {
    let mut harness = Harness::with_follower(true);
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    request.snapshot = Some(Snapshot { step: 10_000, tx_id: u64::MAX });
    add_key_query(&mut request, &[3, 3, 3]);
    let result = harness.send_read(1, request);
    assert_eq!(result.status_code(), StatusCode::NotFound);
}

#[test]
fn should_not_read_head_from_follower() {
    let mut harness = Harness::with_follower(true);
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    request.snapshot = None;
    add_key_query(&mut request, &[3, 3, 3]);
    let result = harness.send_read(1, request);
    assert_eq!(result.status_code(), StatusCode::Unsupported);
}

#[test]
fn should_stop_when_disconnected() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    add_key_query(&mut request, &[3, 3, 3]);
    add_key_query(&mut request, &[1, 1, 1]);
    request.max_rows = 1;

    let first = harness.send_read(13, request);

    harness.shard.disconnect_client(13);

    // An ACK from a different pipe must be ignored.
    harness.shard.handle_ack(
        7,
        ReadAck { read_id: first.read_id, seq_no: first.seq_no, max_rows: 3, max_bytes: 10_000 },
    );
    harness.drain();
    assert!(harness.next_result().is_none());
    assert_eq!(harness.continue_count, 0);
}

#[test]
fn should_read_from_head() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    request.snapshot = None;
    add_key_query(&mut request, &[3, 3, 3]);
    let result = harness.send_read(1, request);
    check_rows(&result, &harness, &[[3, 3, 3, 300]]);
}

#[test]
fn should_read_from_head_with_conflict() {
    // A planned-but-uncommitted writer over the key space: the HEAD read
    // restarts at the latest committed version and still succeeds.
    let mut harness = Harness::new();
    harness.shard.plan_write(999, vec![u32_key(&[3, 3, 3])]);

    let mut request = harness.base_read(1, ResultFormat::CellVec);
    request.snapshot = None;
    add_key_query(&mut request, &[3, 3, 3]);
    let result = harness.send_read(1, request);
    check_rows(&result, &harness, &[[3, 3, 3, 300]]);

    // Once the writer commits, HEAD sees its data.
    harness
        .shard
        .commit_planned(999, Version::new(200, 999), vec![(u32_key(&[3, 3, 3]), Some(vec![Cell::Uint32(301)]))]);
    let mut request = harness.base_read(2, ResultFormat::CellVec);
    request.snapshot = None;
    add_key_query(&mut request, &[3, 3, 3]);
    let result = harness.send_read(1, request);
    check_rows(&result, &harness, &[[3, 3, 3, 301]]);
}

#[test]
fn should_return_mvcc_snapshot_from_future() {
    let mut harness = Harness::new();
    let future_step = harness.shard.mediator_step() + 1000;

    let mut request = harness.base_read(1, ResultFormat::CellVec);
    request.snapshot = Some(Snapshot { step: future_step, tx_id: u64::MAX });
    add_key_query(&mut request, &[3, 3, 3]);
    add_key_query(&mut request, &[1, 1, 1]);
    add_key_query(&mut request, &[5, 5, 5]);
    request.max_rows_in_result = 1;

    // No reply until the mediator time-cast crosses the snapshot step.
    harness.send_read_no_result(1, request);
    harness.shard.advance_mediator_time(future_step - 1);
    harness.drain();
    assert!(harness.results.is_empty());

    harness.shard.advance_mediator_time(future_step);
    harness.drain();

    let first = harness.next_result().expect("first chunk");
    check_rows(&first, &harness, &[[3, 3, 3, 300]]);
    assert_eq!(first.seq_no, 1);
    assert!(!first.finished);

    let second = harness.next_result().expect("second chunk");
    check_rows(&second, &harness, &[[1, 1, 1, 100]]);
    assert_eq!(second.seq_no, 2);

    let third = harness.next_result().expect("third chunk");
    check_rows(&third, &harness, &[[5, 5, 5, 500]]);
    assert_eq!(third.seq_no, 3);
    assert!(third.finished);
}

#[test]
fn should_return_broken_lock_when_read_key() {
    let mut harness = Harness::new();
    let lock_tx_id = 1_011_121_314;

    let mut request = harness.base_read(1, ResultFormat::CellVec);
    request.lock_tx_id = Some(lock_tx_id);
    add_key_query(&mut request, &[1, 1, 1]);
    let first = harness.send_read(1, request);
    assert_eq!(first.tx_locks.len(), 1);
    assert_eq!(first.broken_tx_locks.len(), 0);

    harness.shard.upsert(u32_key(&[1, 1, 1]), vec![Cell::Uint32(101)]);

    let mut request = harness.base_read(2, ResultFormat::CellVec);
    request.lock_tx_id = Some(lock_tx_id);
    add_key_query(&mut request, &[1, 1, 1]);
    let second = harness.send_read(1, request);
    assert_eq!(second.tx_locks.len(), 0);
    assert_eq!(second.broken_tx_locks.len(), 1);

    let before = &first.tx_locks[0];
    let after = &second.broken_tx_locks[0];
    assert_eq!(before.lock_id, after.lock_id);
    assert!(after.counter > before.counter);
}

#[test]
fn should_return_broken_lock_when_read_range() {
    let mut harness = Harness::new();
    let lock_tx_id = 1_011_121_314;

    let mut request = harness.base_read(1, ResultFormat::CellVec);
    request.lock_tx_id = Some(lock_tx_id);
    add_range_query(&mut request, &[3, 3, 3], true, &[8, 0, 1], true);
    let first = harness.send_read(1, request);
    assert_eq!(first.tx_locks.len(), 1);

    // Writes outside both borders leave the lock valid.
    harness.shard.upsert(u32_key(&[1, 1, 1]), vec![Cell::Uint32(101)]);
    harness.shard.upsert(u32_key(&[8, 1, 0]), vec![Cell::Uint32(802)]);
    let mut check = harness.base_read(2, ResultFormat::CellVec);
    check.lock_tx_id = Some(lock_tx_id);
    add_key_query(&mut check, &[11, 11, 11]);
    let result = harness.send_read(1, check);
    assert_eq!(result.tx_locks.len(), 1);
    assert_eq!(result.broken_tx_locks.len(), 0);

    // A write inside the range (a fresh key, even) breaks it.
    harness.shard.upsert(u32_key(&[4, 4, 4]), vec![Cell::Uint32(400)]);
    let mut check = harness.base_read(3, ResultFormat::CellVec);
    check.lock_tx_id = Some(lock_tx_id);
    add_key_query(&mut check, &[11, 11, 11]);
    let result = harness.send_read(1, check);
    assert_eq!(result.broken_tx_locks.len(), 1);
    assert!(result.broken_tx_locks[0].counter > first.tx_locks[0].counter);
}

#[test]
fn should_return_broken_lock_on_range_borders() {
    for border in [[3u32, 3, 3], [8, 0, 1]] {
        let mut harness = Harness::new();
        let lock_tx_id = 1_011_121_314;

        let mut request = harness.base_read(1, ResultFormat::CellVec);
        request.lock_tx_id = Some(lock_tx_id);
        add_range_query(&mut request, &[3, 3, 3], true, &[8, 0, 1], true);
        let first = harness.send_read(1, request);
        assert_eq!(first.tx_locks.len(), 1);

        harness.shard.upsert(u32_key(&border), vec![Cell::Uint32(0xdead)]);

        let mut check = harness.base_read(2, ResultFormat::CellVec);
        check.lock_tx_id = Some(lock_tx_id);
        add_key_query(&mut check, &[11, 11, 11]);
        let result = harness.send_read(1, check);
        assert_eq!(result.broken_tx_locks.len(), 1, "border {border:?}");
        assert!(result.broken_tx_locks[0].counter > first.tx_locks[0].counter);
    }
}

#[test]
fn should_return_broken_lock_when_read_key_prefix() {
    let mut harness = Harness::new();
    let lock_tx_id = 1_011_121_314;

    let mut request = harness.base_read(1, ResultFormat::CellVec);
    request.lock_tx_id = Some(lock_tx_id);
    add_key_query(&mut request, &[8]);
    let first = harness.send_read(1, request);
    assert_eq!(first.tx_locks.len(), 1);

    // Outside the prefix: lock stays valid.
    harness.shard.upsert(u32_key(&[7, 9, 9]), vec![Cell::Uint32(1)]);
    harness.shard.upsert(u32_key(&[9, 0, 0]), vec![Cell::Uint32(2)]);
    let mut check = harness.base_read(2, ResultFormat::CellVec);
    check.lock_tx_id = Some(lock_tx_id);
    add_key_query(&mut check, &[11, 11, 11]);
    let result = harness.send_read(1, check);
    assert_eq!(result.broken_tx_locks.len(), 0);

    // A new key under the prefix breaks it.
    harness.shard.upsert(u32_key(&[8, 2, 2]), vec![Cell::Uint32(3)]);
    let mut check = harness.base_read(3, ResultFormat::CellVec);
    check.lock_tx_id = Some(lock_tx_id);
    add_key_query(&mut check, &[11, 11, 11]);
    let result = harness.send_read(1, check);
    assert_eq!(result.broken_tx_locks.len(), 1);
}

#[test]
fn should_return_broken_lock_on_invisible_row_skips() {
    // A write committed above the read snapshot inside the locked range is
    // invisible to the read, and must break the lock on the first chunk.
    let mut harness = Harness::new();
    harness.shard.upsert_at(u32_key(&[4, 4, 4]), vec![Cell::Uint32(4444)], Version::new(60, 1));

    let lock_tx_id = 1_011_121_314;
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    request.lock_tx_id = Some(lock_tx_id);
    add_range_query(&mut request, &[1, 1, 1], true, &[5, 5, 5], true);
    let result = harness.send_read(1, request);

    // The snapshot still sees the old data.
    check_rows(&result, &harness, &[[1, 1, 1, 100], [3, 3, 3, 300], [5, 5, 5, 500]]);
    assert_eq!(result.tx_locks.len(), 0);
    assert_eq!(result.broken_tx_locks.len(), 1);
}

#[test]
fn sys_table_reads() {
    let mut harness = Harness::new();

    let sys_table = TableId { owner_id: SHARD_ID, table_id: 1, schema_version: 0 };
    let mut request = ReadRequest {
        read_id: 1,
        table: Some(sys_table),
        columns: vec![1, 2],
        result_format: ResultFormat::CellVec as i32,
        ..Default::default()
    };
    request.keys.push(encode_cells(&[Cell::Uint64(TABLE_ID)]));
    let result = harness.send_read(1, request);
    assert_eq!(result.status_code(), StatusCode::Success);
    let rows: Vec<Vec<Cell>> = result.cells.iter().map(|r| cells::decode_cells(r).unwrap()).collect();
    assert_eq!(rows, vec![vec![Cell::Uint64(TABLE_ID), Cell::Utf8("user-table".into())]]);

    // Arrow results are refused for system tables.
    let mut request = ReadRequest {
        read_id: 2,
        table: Some(sys_table),
        columns: vec![1, 2],
        result_format: ResultFormat::Arrow as i32,
        ..Default::default()
    };
    request.keys.push(encode_cells(&[Cell::Uint64(TABLE_ID)]));
    let result = harness.send_read(1, request);
    assert_eq!(result.status_code(), StatusCode::BadRequest);

    // As are schema-version pins.
    let mut request = ReadRequest {
        read_id: 3,
        table: Some(TableId { owner_id: SHARD_ID, table_id: 1, schema_version: 1 }),
        columns: vec![1, 2],
        result_format: ResultFormat::CellVec as i32,
        ..Default::default()
    };
    request.keys.push(encode_cells(&[Cell::Uint64(TABLE_ID)]));
    let result = harness.send_read(1, request);
    assert_eq!(result.status_code(), StatusCode::SchemeError);
}

#[test]
fn value_column_projection() {
    let mut harness = Harness::new();
    let mut request = harness.base_read(1, ResultFormat::CellVec);
    request.columns = vec![4, 1];
    add_key_query(&mut request, &[3, 3, 3]);
    let result = harness.send_read(1, request);
    let rows = rows_of_with(&result, &harness.projected(&[4, 1]));
    assert_eq!(rows, vec![vec![Cell::Uint32(300), Cell::Uint32(3)]]);
}

#[tokio::test(start_paused = true)]
async fn inactive_clients_receive_timeout() {
    let schema = test_schema(1);
    let mut shard = Shard::new(ShardConfig {
        shard_id: SHARD_ID,
        owner_id: OWNER_ID,
        table_id: TABLE_ID,
        schema,
        follower: false,
        generation: 1,
    });
    shard.advance_mediator_time(100);
    shard.upsert_at(u32_key(&[1, 1, 1]), vec![Cell::Uint32(100)], Version::new(10, 1));
    shard.upsert_at(u32_key(&[3, 3, 3]), vec![Cell::Uint32(300)], Version::new(10, 2));

    let handle = datashard::ShardService::spawn_with_inactivity_timeout(
        shard,
        std::time::Duration::from_secs(5),
    );

    let mut request = ReadRequest {
        read_id: 1,
        table: Some(TableId { owner_id: OWNER_ID, table_id: TABLE_ID, schema_version: 1 }),
        columns: vec![1, 2, 3, 4],
        snapshot: Some(Snapshot { step: 50, tx_id: u64::MAX }),
        result_format: ResultFormat::CellVec as i32,
        max_rows: 1, // exhausts after the first chunk, then no ACK arrives
        ..Default::default()
    };
    add_range_query(&mut request, &[1, 1, 1], true, &[5, 5, 5], true);

    let mut stream = handle.read(7, request);
    let first = stream.recv().await.expect("first chunk");
    assert_eq!(first.status_code(), StatusCode::Success);
    assert!(!first.finished);

    let second = stream.recv().await.expect("timeout chunk");
    assert_eq!(second.status_code(), StatusCode::Timeout);
    assert_eq!(second.seq_no, first.seq_no + 1);
}

#[tokio::test]
async fn service_pages_through_the_async_loop() -> anyhow::Result<()> {
    use tracing_subscriber::{filter::LevelFilter, EnvFilter};
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();

    let schema = test_schema(1);
    let mut shard = Shard::new(ShardConfig {
        shard_id: SHARD_ID,
        owner_id: OWNER_ID,
        table_id: TABLE_ID,
        schema,
        follower: false,
        generation: 1,
    });
    shard.advance_mediator_time(100);
    for (i, k) in [1u32, 3, 5].iter().enumerate() {
        shard.upsert_at(
            u32_key(&[*k, *k, *k]),
            vec![Cell::Uint32(k * 100)],
            Version::new(10, i as u64 + 1),
        );
    }
    let handle = datashard::ShardService::spawn(shard);

    let mut request = ReadRequest {
        read_id: 1,
        table: Some(TableId { owner_id: OWNER_ID, table_id: TABLE_ID, schema_version: 1 }),
        columns: vec![1, 2, 3, 4],
        snapshot: Some(Snapshot { step: 50, tx_id: u64::MAX }),
        result_format: ResultFormat::CellVec as i32,
        max_rows: 1,
        ..Default::default()
    };
    add_range_query(&mut request, &[1, 1, 1], true, &[5, 5, 5], true);

    let mut stream = handle.read(7, request);
    let mut rows = Vec::new();
    loop {
        let chunk = stream.recv().await.expect("stream open");
        assert_eq!(chunk.status_code(), StatusCode::Success);
        for raw in &chunk.cells {
            rows.push(cells::decode_cells(raw).expect("valid row"));
        }
        if chunk.finished {
            break;
        }
        handle.ack(
            7,
            ReadAck { read_id: chunk.read_id, seq_no: chunk.seq_no, max_rows: 1, max_bytes: 10_000 },
        );
    }
    assert_eq!(
        rows,
        vec![u32_cells(&[1, 1, 1, 100]), u32_cells(&[3, 3, 3, 300]), u32_cells(&[5, 5, 5, 500])]
    );
    Ok(())
}
