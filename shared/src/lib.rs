//! Shared protocol types, transport substrate, and bootstrap for the
//! distributed work-queue runtime.
//!
//! This crate contains everything the controller and worker/broker sides
//! need in common: the message/task/result/stats data model, the
//! in-process message-passing substrate standing in for the spec's
//! external substrate, the name-resolver contract, runner configuration,
//! and the role-classification bootstrap record.

pub mod bootstrap;
pub mod config;
pub mod defaults;
pub mod error;
pub mod protocol;
pub mod resolver;
pub mod runner;
pub mod stats;
pub mod transport;

pub use bootstrap::{BootstrapInfo, Role};
pub use config::RunnerConfig;
pub use error::{DistwqError, Result};
pub use protocol::{
    CollectiveMode, KwArgs, Message, MessageTag, Rank, ResultRecord, ResultValue, StatsRecord,
    TaskDescriptor, TaskId, Value,
};
pub use resolver::{Invocable, NameResolver, StaticRegistry};
pub use runner::{RoleFuture, Runner};
pub use transport::{poll_or_backoff, CollectiveGroup, GatherItem, InProcessCollective, Mesh, MergedComm, RankChannel, Transport, POLL_BACKOFF};
