// Compute-task streaming: channel data with ack-based flow control, and
// compute state transitions reported back to the executer.

use super::status::Issue;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelData {
    #[prost(uint64, tag = "1")]
    pub channel_id: u64,
    #[prost(uint64, tag = "2")]
    pub seq_no: u64,
    #[prost(uint32, tag = "3")]
    pub rows: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "5")]
    pub finished: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ChannelDataAck {
    #[prost(uint64, tag = "1")]
    pub channel_id: u64,
    #[prost(uint64, tag = "2")]
    pub seq_no: u64,
    #[prost(uint64, tag = "3")]
    pub free_space: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ComputeState {
    Unspecified = 0,
    Executing = 1,
    Finished = 2,
    Failure = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ComputeTaskState {
    #[prost(uint64, tag = "1")]
    pub task_id: u64,
    #[prost(enumeration = "ComputeState", tag = "2")]
    pub state: i32,
    #[prost(enumeration = "super::status::StatusCode", tag = "3")]
    pub status: i32,
    #[prost(message, repeated, tag = "4")]
    pub issues: ::prost::alloc::vec::Vec<Issue>,
}

