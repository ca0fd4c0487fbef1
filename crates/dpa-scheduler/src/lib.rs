//! Dependency-aware configuration scheduler: plans and executes northbound
//! transactions against heterogeneous backends in dependency order, and
//! reconciles declared state with the state retrieved from the backends.

pub mod config;
pub mod descriptor;
pub mod error;
mod exec;
pub mod graph;
pub mod history;
pub mod mailbox;
pub mod metadata;
pub mod notify;
pub mod registry;
mod resync;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod test_support;
pub mod txn;

pub use config::SchedulerConfig;
pub use descriptor::{
    DepTarget, Dependency, KVDescriptor, KVWithMetadata, KeyPredicate, ValueOrigin,
};
pub use error::{DescriptorError, InvalidValueError, SchedulerError};
pub use graph::ValueState;
pub use history::{OpKind, RecordedOp, RecordedTxn};
pub use metadata::{MetadataBroker, MetadataMap};
pub use notify::SbNotification;
pub use registry::DescriptorRegistry;
pub use retry::RetryPolicy;
pub use scheduler::{KVScheduler, ValueStatus};
pub use service::{SchedulerClient, SchedulerHandle, SchedulerService};
pub use txn::{Intent, KeyOutcome, SkippedRetrieval, Transaction, TxnKind, TxnResult};
