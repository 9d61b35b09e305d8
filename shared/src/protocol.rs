//! Message set and data model exchanged between controller, worker, and
//! collective broker/worker.
//!
//! The wire value type is `serde_json::Value`: the substrate serializes
//! whatever the positional/keyword arguments and results are, and JSON
//! gives one concrete encoding for arbitrary, heterogeneous payloads.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DistwqError, Result};

/// Rank of a participant in the mesh. Rank 0 is always the controller (or,
/// inside a spawned sub-group, the broker acting as root).
pub type Rank = usize;

/// Identifier of a submitted call. Narrowed from "any hashable value" to a
/// plain `u64`, generated sequentially unless the caller supplies one.
pub type TaskId = u64;

/// The JSON-like value used for positional args, keyword args, and results.
pub type Value = serde_json::Value;

/// Keyword arguments, in call order.
pub type KwArgs = serde_json::Map<String, Value>;

/// Collective mode for a broker/collective-worker pair. Only `Gather` is
/// defined today; any other wire value is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CollectiveMode {
    Gather = 1,
}

impl TryFrom<u8> for CollectiveMode {
    type Error = DistwqError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(CollectiveMode::Gather),
            other => Err(DistwqError::ProtocolViolation(format!(
                "unknown collective mode {other}"
            ))),
        }
    }
}

/// Tag distinguishing the four message kinds the substrate carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    Ready,
    Task,
    Done,
    Exit,
}

/// An immutable, once-sent description of a function invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub symbol_name: String,
    pub module_name: String,
    pub args: Vec<Value>,
    pub kwargs: KwArgs,
    pub time_est: f64,
    /// Set by a collective broker when scattering this descriptor to its
    /// sub-group; `None` for a plain point-to-point task. Every collective
    /// worker validates this on receipt and rejects anything but `Gather`.
    #[serde(default)]
    pub collective_mode: Option<CollectiveMode>,
}

impl TaskDescriptor {
    /// The sentinel scattered by a broker to its sub-group on shutdown.
    pub const EXIT_SENTINEL: &'static str = "exit";

    pub fn is_exit_sentinel(&self) -> bool {
        self.symbol_name == Self::EXIT_SENTINEL
    }

    pub fn exit_sentinel() -> Self {
        TaskDescriptor {
            task_id: 0,
            symbol_name: Self::EXIT_SENTINEL.to_string(),
            module_name: String::new(),
            args: Vec::new(),
            kwargs: KwArgs::new(),
            time_est: 0.0,
            collective_mode: None,
        }
    }
}

/// Per-call processing statistics, reported by whichever rank executed the
/// call (or, for a collective task, the straggler among the contributors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsRecord {
    pub task_id: TaskId,
    pub rank: Rank,
    pub this_time: f64,
    pub time_over_est: f64,
    pub n_processed: u64,
    pub total_time: f64,
}

/// The value half of a result record. A collective task's value is the
/// ordered list of non-empty per-rank contributions; everything else is a
/// single value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    Single(Value),
    Collective(Vec<Value>),
}

impl ResultValue {
    pub fn as_single(&self) -> Option<&Value> {
        match self {
            ResultValue::Single(v) => Some(v),
            ResultValue::Collective(_) => None,
        }
    }

    pub fn as_collective(&self) -> Option<&[Value]> {
        match self {
            ResultValue::Collective(v) => Some(v),
            ResultValue::Single(_) => None,
        }
    }
}

/// The outcome of a completed call, as delivered to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: TaskId,
    pub value: ResultValue,
    pub stats: StatsRecord,
}

/// The four message kinds the substrate carries between controller and
/// worker/broker. `Ready` and `Exit` have no payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Ready,
    Task(TaskDescriptor),
    Done(ResultRecord),
    Exit,
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::Ready => MessageTag::Ready,
            Message::Task(_) => MessageTag::Task,
            Message::Done(_) => MessageTag::Done,
            Message::Exit => MessageTag::Exit,
        }
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageTag::Ready => "READY",
            MessageTag::Task => "TASK",
            MessageTag::Done => "DONE",
            MessageTag::Exit => "EXIT",
        };
        f.write_str(name)
    }
}
