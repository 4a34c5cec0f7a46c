use crate::store::Version;
use cells::{KeyRange, OwnedKey};
use proto_tablet::ResultFormat;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterState {
    Executing,
    Exhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quota {
    pub rows: u64,
    pub bytes: u64,
}

/// Per-read iterator state: request parameters, progress cursor, and the
/// seq-no / quota bookkeeping of the flow-control protocol.
pub struct ReadIteratorState {
    pub read_id: u64,
    pub schema_version: u64,
    pub sys: bool,
    pub format: ResultFormat,
    pub columns: Vec<u32>,
    pub reverse: bool,
    pub max_rows_in_result: u64,
    pub lock_tx_id: Option<u64>,
    /// Requested snapshot; None until a HEAD read resolves its version.
    pub version: Option<Version>,
    /// Every query normalized into a range, in request order.
    pub queries: Vec<KeyRange>,
    pub current_query: usize,
    pub last_key: Option<OwnedKey>,

    pub seq_no: u64,
    pub last_ack_seq_no: u64,
    pub quota: Quota,
    pub state: IterState,
    // (seq_no, rows, bytes) of chunks not yet covered by an ACK.
    consumed: VecDeque<(u64, u64, u64)>,
}

impl ReadIteratorState {
    pub fn new(read_id: u64, max_rows: u64, max_bytes: u64) -> Self {
        let unlimited = |v: u64| if v == 0 { u64::MAX } else { v };
        Self {
            read_id,
            schema_version: 0,
            sys: false,
            format: ResultFormat::CellVec,
            columns: Vec::new(),
            reverse: false,
            max_rows_in_result: 0,
            lock_tx_id: None,
            version: None,
            queries: Vec::new(),
            current_query: 0,
            last_key: None,
            seq_no: 0,
            last_ack_seq_no: 0,
            quota: Quota { rows: unlimited(max_rows), bytes: unlimited(max_bytes) },
            state: IterState::Executing,
            consumed: VecDeque::new(),
        }
    }

    /// Stamps the next outgoing chunk and charges it against the quota.
    /// Returns the chunk's seq_no.
    pub fn consume_seq_no(&mut self, rows: u64, bytes: u64) -> u64 {
        self.seq_no += 1;
        self.consumed.push_back((self.seq_no, rows, bytes));
        self.quota.rows = self.quota.rows.saturating_sub(rows);
        self.quota.bytes = self.quota.bytes.saturating_sub(bytes);
        if self.quota.rows == 0 || self.quota.bytes == 0 {
            self.state = IterState::Exhausted;
        }
        self.seq_no
    }

    /// Applies an ACK: the new quota is the ACK's bounds minus everything
    /// sent after the acknowledged chunk.
    pub fn up_quota(&mut self, ack_seq_no: u64, max_rows: u64, max_bytes: u64) {
        self.last_ack_seq_no = ack_seq_no;
        while self.consumed.front().is_some_and(|(seq, _, _)| *seq <= ack_seq_no) {
            self.consumed.pop_front();
        }
        let (in_flight_rows, in_flight_bytes) = self
            .consumed
            .iter()
            .fold((0u64, 0u64), |(r, b), (_, rows, bytes)| (r + rows, b + bytes));
        self.quota.rows = max_rows.saturating_sub(in_flight_rows);
        self.quota.bytes = max_bytes.saturating_sub(in_flight_bytes);
        self.state = if self.quota.rows > 0 && self.quota.bytes > 0 {
            IterState::Executing
        } else {
            IterState::Exhausted
        };
    }

    /// Row budget of the next chunk.
    pub fn chunk_row_cap(&self) -> u64 {
        if self.max_rows_in_result > 0 {
            self.quota.rows.min(self.max_rows_in_result)
        } else {
            self.quota.rows
        }
    }

    pub fn finished_all_queries(&self) -> bool {
        self.current_query >= self.queries.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quota_follows_acks_and_in_flight_chunks() {
        let mut state = ReadIteratorState::new(1, 100, 1000);
        state.consume_seq_no(10, 100); // seq 1
        state.consume_seq_no(30, 200); // seq 2
        state.consume_seq_no(40, 300); // seq 3

        assert_eq!(state.last_ack_seq_no, 0);
        assert_eq!(state.seq_no, 3);
        assert_eq!(state.quota, Quota { rows: 20, bytes: 400 });

        state.up_quota(2, 200, 1000);
        assert_eq!(state.last_ack_seq_no, 2);
        assert_eq!(state.quota, Quota { rows: 160, bytes: 700 });

        state.consume_seq_no(10, 100); // seq 4
        state.consume_seq_no(20, 200); // seq 5
        state.consume_seq_no(10, 50); // seq 6
        state.consume_seq_no(2000, 2000); // seq 7

        state.up_quota(4, 5000, 5000);
        assert_eq!(state.seq_no, 7);
        assert_eq!(state.last_ack_seq_no, 4);
        assert_eq!(state.quota, Quota { rows: 2970, bytes: 2750 });
        assert_eq!(state.state, IterState::Executing);

        state.up_quota(5, 100, 100);
        assert_eq!(state.last_ack_seq_no, 5);
        assert_eq!(state.quota, Quota { rows: 0, bytes: 0 });
        assert_eq!(state.state, IterState::Exhausted);

        state.up_quota(6, 10, 10);
        assert_eq!(state.last_ack_seq_no, 6);
        assert_eq!(state.quota, Quota { rows: 0, bytes: 0 });
        assert_eq!(state.state, IterState::Exhausted);

        state.up_quota(7, 11, 131_729);
        assert_eq!(state.last_ack_seq_no, 7);
        assert_eq!(state.quota, Quota { rows: 11, bytes: 131_729 });
        assert_eq!(state.state, IterState::Executing);
    }

    #[test]
    fn zero_limits_mean_unlimited() {
        let state = ReadIteratorState::new(1, 0, 0);
        assert_eq!(state.quota, Quota { rows: u64::MAX, bytes: u64::MAX });
        assert_eq!(state.chunk_row_cap(), u64::MAX);

        let mut limited = ReadIteratorState::new(1, 10, 0);
        limited.max_rows_in_result = 3;
        assert_eq!(limited.chunk_row_cap(), 3);
        limited.quota.rows = 2;
        assert_eq!(limited.chunk_row_cap(), 2);
    }
}
