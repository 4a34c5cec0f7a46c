use crate::shard::{ClientId, Outgoing, Shard};
use crate::store::MemStore;
use proto_tablet::{ReadAck, ReadCancel, ReadRequest, ReadResult};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

enum Command {
    Read { client: ClientId, request: ReadRequest, results: mpsc::UnboundedSender<ReadResult> },
    Ack { client: ClientId, ack: ReadAck },
    Cancel { client: ClientId, cancel: ReadCancel },
    Continue { client: ClientId, read_id: u64 },
    Disconnect { client: ClientId },
    AdvanceMediatorTime { step: u64 },
}

/// The shard actor: owns a `Shard` and pumps its outbox, looping internal
/// continues back through its own inbox so a single long read cannot
/// monopolize the event loop.
pub struct ShardService {
    shard: Shard<MemStore>,
    rx: mpsc::UnboundedReceiver<Command>,
    loopback: mpsc::UnboundedSender<Command>,
    clients: HashMap<ClientId, mpsc::UnboundedSender<ReadResult>>,
    /// Zero disables the inactivity sweep.
    inactive_client_timeout: Duration,
    last_activity: HashMap<ClientId, Instant>,
}

#[derive(Clone)]
pub struct ShardHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ShardService {
    pub fn spawn(shard: Shard<MemStore>) -> ShardHandle {
        Self::spawn_with_inactivity_timeout(shard, Duration::ZERO)
    }

    /// Spawns the shard actor with a client-inactivity deadline: clients
    /// that neither ACK nor cancel within the window get TIMEOUT replies.
    pub fn spawn_with_inactivity_timeout(shard: Shard<MemStore>, timeout: Duration) -> ShardHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = ShardService {
            shard,
            rx,
            loopback: tx.clone(),
            clients: HashMap::new(),
            inactive_client_timeout: timeout,
            last_activity: HashMap::new(),
        };
        tokio::spawn(service.run());
        ShardHandle { tx }
    }

    async fn run(mut self) {
        let sweep_period = if self.inactive_client_timeout.is_zero() {
            Duration::from_secs(3600)
        } else {
            self.inactive_client_timeout / 2
        };
        let mut sweep = tokio::time::interval(sweep_period.max(Duration::from_millis(10)));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else { return };
                    self.handle(command);
                }
                _ = sweep.tick() => self.expire_inactive_clients(),
            }
            self.pump();
        }
    }

    fn handle(&mut self, command: Command) {
        match &command {
            Command::Read { client, .. }
            | Command::Ack { client, .. }
            | Command::Cancel { client, .. } => {
                self.last_activity.insert(*client, Instant::now());
            }
            _ => (),
        }
        match command {
            Command::Read { client, request, results } => {
                self.clients.insert(client, results);
                self.shard.handle_read(client, request);
            }
            Command::Ack { client, ack } => self.shard.handle_ack(client, ack),
            Command::Cancel { client, cancel } => self.shard.handle_cancel(client, cancel.read_id),
            Command::Continue { client, read_id } => self.shard.handle_continue(client, read_id),
            Command::Disconnect { client } => {
                self.clients.remove(&client);
                self.last_activity.remove(&client);
                self.shard.disconnect_client(client);
            }
            Command::AdvanceMediatorTime { step } => self.shard.advance_mediator_time(step),
        }
    }

    fn expire_inactive_clients(&mut self) {
        if self.inactive_client_timeout.is_zero() {
            return;
        }
        let Some(deadline) = Instant::now().checked_sub(self.inactive_client_timeout) else {
            return;
        };
        let expired: Vec<ClientId> = self
            .last_activity
            .iter()
            .filter(|(_, at)| **at <= deadline)
            .map(|(client, _)| *client)
            .collect();
        for client in expired {
            tracing::warn!(client, "client inactive past the deadline");
            self.last_activity.remove(&client);
            self.shard.expire_client(client);
        }
    }

    fn pump(&mut self) {
        for outgoing in self.shard.take_outbox() {
            match outgoing {
                Outgoing::Result { client, result } => {
                    if let Some(sink) = self.clients.get(&client) {
                        if sink.send(result).is_err() {
                            self.clients.remove(&client);
                            self.shard.disconnect_client(client);
                        }
                    }
                }
                Outgoing::Continue { client, read_id } => {
                    let _ = self.loopback.send(Command::Continue { client, read_id });
                }
            }
        }
    }
}

impl ShardHandle {
    /// Starts a read; chunks arrive on the returned stream.
    pub fn read(&self, client: ClientId, request: ReadRequest) -> mpsc::UnboundedReceiver<ReadResult> {
        let (results, stream) = mpsc::unbounded_channel();
        let _ = self.tx.send(Command::Read { client, request, results });
        stream
    }

    pub fn ack(&self, client: ClientId, ack: ReadAck) {
        let _ = self.tx.send(Command::Ack { client, ack });
    }

    pub fn cancel(&self, client: ClientId, cancel: ReadCancel) {
        let _ = self.tx.send(Command::Cancel { client, cancel });
    }

    pub fn disconnect(&self, client: ClientId) {
        let _ = self.tx.send(Command::Disconnect { client });
    }

    pub fn advance_mediator_time(&self, step: u64) {
        let _ = self.tx.send(Command::AdvanceMediatorTime { step });
    }
}
