use crate::accounting::BillSink;
use crate::config::ResourceConfig;
use crate::tree::{ClientId, QuoterTree, SessionEvent};
use crate::Error;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

enum Command {
    AddResource {
        path: String,
        props: ResourceConfig,
        reply: oneshot::Sender<Result<u64, Error>>,
    },
    UpdateResource {
        path: String,
        props: ResourceConfig,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    DeleteResource {
        path: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Subscribe {
        client: ClientId,
        path: String,
        events: mpsc::UnboundedSender<SessionEvent>,
        reply: oneshot::Sender<Result<(u64, ResourceConfig), Error>>,
    },
    UpdateConsumption {
        client: ClientId,
        resource_id: u64,
        consume: bool,
        amount: f64,
    },
    Report {
        client: ClientId,
        resource_id: u64,
        start_us: u64,
        interval_us: u64,
        values: Vec<f64>,
    },
    Disconnect {
        client: ClientId,
    },
}

/// The quoter actor: exclusively owns a `QuoterTree` and multiplexes
/// commands with the tick timer.
pub struct QuoterService {
    tree: QuoterTree,
    rx: mpsc::Receiver<Command>,
    clients: HashMap<ClientId, mpsc::UnboundedSender<SessionEvent>>,
    epoch: Instant,
}

#[derive(Clone)]
pub struct QuoterHandle {
    tx: mpsc::Sender<Command>,
}

/// A subscribed session: the resource id plus the event stream carrying
/// allocations and closure.
pub struct SessionHandle {
    pub resource_id: u64,
    pub effective: ResourceConfig,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl QuoterService {
    pub fn spawn(quoter_path: &str, bill_sink: Arc<dyn BillSink>) -> QuoterHandle {
        let (tx, rx) = mpsc::channel(64);
        let service = QuoterService {
            tree: QuoterTree::new(quoter_path, bill_sink),
            rx,
            clients: HashMap::new(),
            epoch: Instant::now(),
        };
        tokio::spawn(service.run());
        QuoterHandle { tx }
    }

    async fn run(mut self) {
        loop {
            let next_tick = self.tree.next_tick_at();
            let tick_deadline = next_tick.map(|us| self.epoch + std::time::Duration::from_micros(us));

            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("quoter service inbox closed, stopping");
                        return;
                    };
                    let now = self.now_us();
                    self.handle(command, now);
                }
                _ = async {
                    match tick_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    let now = self.now_us();
                    self.tree.run_until(now);
                }
            }

            self.dispatch_events();
        }
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn handle(&mut self, command: Command, now_us: u64) {
        match command {
            Command::AddResource { path, props, reply } => {
                let _ = reply.send(self.tree.add_resource(&path, props));
            }
            Command::UpdateResource { path, props, reply } => {
                let _ = reply.send(self.tree.update_resource(&path, props));
            }
            Command::DeleteResource { path, reply } => {
                let _ = reply.send(self.tree.delete_resource(&path));
            }
            Command::Subscribe { client, path, events, reply } => {
                let result = self.tree.subscribe(client, &path);
                if result.is_ok() {
                    self.clients.insert(client, events);
                }
                let _ = reply.send(result);
            }
            Command::UpdateConsumption { client, resource_id, consume, amount } => {
                if let Err(error) =
                    self.tree.update_consumption_state(client, resource_id, consume, amount, now_us)
                {
                    tracing::warn!(client, resource_id, %error, "consumption update rejected");
                }
            }
            Command::Report { client, resource_id, start_us, interval_us, values } => {
                if let Err(error) =
                    self.tree.report(client, resource_id, start_us, interval_us, &values, now_us)
                {
                    tracing::warn!(client, resource_id, %error, "usage report rejected");
                }
            }
            Command::Disconnect { client } => {
                self.tree.disconnect_client(client);
                self.clients.remove(&client);
            }
        }
    }

    fn dispatch_events(&mut self) {
        for event in self.tree.take_events() {
            let client = match &event {
                SessionEvent::Allocated { client, .. } => *client,
                SessionEvent::Closed { client, .. } => *client,
            };
            if let Some(sender) = self.clients.get(&client) {
                if sender.send(event).is_err() {
                    self.clients.remove(&client);
                    self.tree.disconnect_client(client);
                }
            }
        }
    }
}

impl QuoterHandle {
    pub async fn add_resource(&self, path: &str, props: ResourceConfig) -> Result<u64, Error> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command::AddResource { path: path.to_string(), props, reply })
            .await
            .map_err(|_| Error::ServiceStopped)?;
        response.await.map_err(|_| Error::ServiceStopped)?
    }

    pub async fn update_resource(&self, path: &str, props: ResourceConfig) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command::UpdateResource { path: path.to_string(), props, reply })
            .await
            .map_err(|_| Error::ServiceStopped)?;
        response.await.map_err(|_| Error::ServiceStopped)?
    }

    pub async fn delete_resource(&self, path: &str) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command::DeleteResource { path: path.to_string(), reply })
            .await
            .map_err(|_| Error::ServiceStopped)?;
        response.await.map_err(|_| Error::ServiceStopped)?
    }

    pub async fn subscribe(&self, client: ClientId, path: &str) -> Result<SessionHandle, Error> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command::Subscribe { client, path: path.to_string(), events: events_tx, reply })
            .await
            .map_err(|_| Error::ServiceStopped)?;
        let (resource_id, effective) = response.await.map_err(|_| Error::ServiceStopped)??;
        Ok(SessionHandle { resource_id, effective, events: events_rx })
    }

    /// Starts (consume = true) or stops token delivery for a session.
    pub async fn update_consumption(
        &self,
        client: ClientId,
        resource_id: u64,
        consume: bool,
        amount: f64,
    ) -> Result<(), Error> {
        self.tx
            .send(Command::UpdateConsumption { client, resource_id, consume, amount })
            .await
            .map_err(|_| Error::ServiceStopped)
    }

    pub async fn report(
        &self,
        client: ClientId,
        resource_id: u64,
        start_us: u64,
        interval_us: u64,
        values: Vec<f64>,
    ) -> Result<(), Error> {
        self.tx
            .send(Command::Report { client, resource_id, start_us, interval_us, values })
            .await
            .map_err(|_| Error::ServiceStopped)
    }

    pub async fn disconnect(&self, client: ClientId) -> Result<(), Error> {
        self.tx.send(Command::Disconnect { client }).await.map_err(|_| Error::ServiceStopped)
    }
}
