// Wire messages of the shard read protocol, the shard transaction protocol,
// and the coordinator protocol. Hand-maintained in generated prost style:
// field names and tags are stable, messages carry no behavior beyond small
// constructors and accessors.

pub mod dq;
pub mod read;
pub mod status;
pub mod tx;

pub use read::{Lock, ReadAck, ReadCancel, ReadRange, ReadRequest, ReadResult, ResultFormat, Snapshot, TableId};
pub use status::{Issue, IssueCode, Status, StatusCode};

#[cfg(test)]
mod test {
    use super::*;
    use prost::Message;

    #[test]
    fn read_request_round_trip() {
        let req = ReadRequest {
            read_id: 7,
            table: Some(TableId { owner_id: 1, table_id: 2, schema_version: 3 }),
            columns: vec![1, 2, 3, 4],
            snapshot: Some(Snapshot { step: 100, tx_id: 200 }),
            result_format: ResultFormat::CellVec as i32,
            reverse: true,
            max_rows: 10,
            max_bytes: 1 << 20,
            max_rows_in_result: 1,
            lock_tx_id: Some(999),
            keys: vec![b"k1".to_vec(), b"k2".to_vec()],
            ranges: vec![ReadRange {
                from: b"a".to_vec(),
                to: b"b".to_vec(),
                from_inclusive: true,
                to_inclusive: false,
            }],
        };
        let buf = req.encode_to_vec();
        assert_eq!(ReadRequest::decode(&buf[..]).unwrap(), req);
        assert_eq!(req.encoded_len(), buf.len());
    }

    #[test]
    fn status_helpers() {
        let status = Status::error(
            StatusCode::Aborted,
            Issue::new(IssueCode::LocksInvalidated, "transaction locks invalidated"),
        );
        assert_eq!(status.code(), StatusCode::Aborted);
        assert_eq!(status.issues[0].code(), IssueCode::LocksInvalidated);

        let ok = Status::success();
        assert_eq!(ok.code(), StatusCode::Success);
        assert!(ok.issues.is_empty());
    }
}
