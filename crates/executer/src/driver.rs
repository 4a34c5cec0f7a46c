use crate::executer::{ComputeSettings, DataExecuter, Effect, Event, QueryResponse};
use proto_tablet::dq::ChannelDataAck;
use proto_tablet::tx::{CancelProposal, CoordinatorPropose, ProposeAttach, ProposeDataTx, TaskDesc};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::time::DelayQueue;

/// A message bound for one data shard.
#[derive(Debug)]
pub enum ShardMsg {
    Propose { follower: bool, propose: ProposeDataTx },
    Cancel(CancelProposal),
    Attach { attach: ProposeAttach, cookie: u64 },
}

/// How the executer reaches its collaborators. Production wires this to the
/// pipe cache; tests substitute scripted endpoints.
pub trait Transport: Send {
    fn resolve_tables(&mut self, paths: Vec<String>);
    fn acquire_snapshot(&mut self, database: String);
    fn start_compute_task(&mut self, task: TaskDesc, settings: ComputeSettings);
    fn send_to_shard(&mut self, shard: u64, msg: ShardMsg);
    fn send_to_coordinator(&mut self, propose: CoordinatorPropose);
    fn channel_ack(&mut self, task: u64, ack: ChannelDataAck);
}

/// Runs the executer to completion: pumps effects into the transport,
/// feeds external events back, and arms the reattach and deadline timers.
pub async fn run_data_executer(
    mut executer: DataExecuter,
    transport: &mut dyn Transport,
    mut events: mpsc::Receiver<Event>,
) -> QueryResponse {
    let mut reattach: DelayQueue<u64> = DelayQueue::new();

    let operation_timeout = tokio::time::sleep(executer.operation_timeout());
    tokio::pin!(operation_timeout);

    let cancel_after = executer.cancel_after();
    let cancel_after = async move {
        match cancel_after {
            Some(delay) => tokio::time::sleep(delay).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(cancel_after);

    executer.start();

    loop {
        for effect in executer.take_effects() {
            match effect {
                Effect::Reply { response } => return response,
                Effect::ResolveTables { paths } => transport.resolve_tables(paths),
                Effect::AcquireSnapshot { database } => transport.acquire_snapshot(database),
                Effect::StartComputeTask { task, settings } => {
                    transport.start_compute_task(task, settings)
                }
                Effect::SendPropose { shard, follower, propose } => {
                    transport.send_to_shard(shard, ShardMsg::Propose { follower, propose })
                }
                Effect::SendCancel { shard, cancel } => {
                    transport.send_to_shard(shard, ShardMsg::Cancel(cancel))
                }
                Effect::SendAttach { shard, attach, cookie } => {
                    transport.send_to_shard(shard, ShardMsg::Attach { attach, cookie })
                }
                Effect::ScheduleReattach { shard, delay } => {
                    reattach.insert(shard, delay);
                }
                Effect::SendToCoordinator { propose } => transport.send_to_coordinator(propose),
                Effect::ChannelAck { task, ack } => transport.channel_ack(task, ack),
            }
        }

        tokio::select! {
            event = events.recv() => match event {
                Some(event) => executer.handle(event, Instant::now()),
                // A dropped event source means the session is gone.
                None => executer.handle(Event::CancelRequested, Instant::now()),
            },
            expired = std::future::poll_fn(|cx| reattach.poll_expired(cx)), if !reattach.is_empty() => {
                if let Some(expired) = expired {
                    executer.handle(Event::ReattachTimer { shard: expired.into_inner() }, Instant::now());
                }
            }
            _ = &mut operation_timeout => executer.handle(Event::OperationTimeout, Instant::now()),
            _ = &mut cancel_after => executer.handle(Event::CancelRequested, Instant::now()),
        }
    }
}
