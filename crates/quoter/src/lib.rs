// Hierarchical rate quoter: a tree of rate-limited resources delivers
// tokens to client sessions under a hierarchical deficit-round-robin
// discipline, with optional usage accounting and billing.

mod accounting;
mod config;
mod queue;
mod service;
mod tree;

pub use accounting::{BillCategory, BillRecord, BillSink, NullBillSink, RateAccounting};
pub use config::{canonize_path, AccountingConfig, MeteringConfig, ResourceConfig};
pub use queue::{ProcessorId, TickProcessorQueue, TickTask};
pub use service::{QuoterHandle, QuoterService, SessionHandle};
pub use tree::{next_tick, ClientId, QuoterTree, SessionEvent, TICK, TICKS_PER_SECOND};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid resource configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid resource path: '{0}'")]
    InvalidPath(String),
    #[error("resource '{0}' already exists")]
    ResourceAlreadyExists(String),
    #[error("resource '{0}' doesn't exist")]
    ResourceNotFound(String),
    #[error("parent resource '{0}' doesn't exist")]
    ParentNotFound(String),
    #[error("resource '{0}' has children")]
    HasChildren(String),
    #[error("no session of client {client} on resource {resource_id}")]
    SessionNotFound { client: u64, resource_id: u64 },
    #[error("quoter service is shut down")]
    ServiceStopped,
}

pub type Result<T> = std::result::Result<T, Error>;
