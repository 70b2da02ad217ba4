//! Task ids and payloads for the durable queue.
//!
//! Tasks fall into two partitions: **data** (document mutations, replayed
//! through `batch_tasks` after a crash) and **management** (control
//! operations, applied inline). The partition is visible in the string form
//! of the id — `d-<n>` vs `m-<n>` — so observers can tell them apart
//! without introspecting payloads.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ── TaskId ────────────────────────────────────────────────────────────────────

/// Queue partition of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskPartition {
    Data,
    Management,
}

impl TaskPartition {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPartition::Data => "d",
            TaskPartition::Management => "m",
        }
    }
}

/// Identifier of an enqueued task. The numeric part comes from a single
/// rowid sequence shared by both partitions, so numbers never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub partition: TaskPartition,
    pub number: i64,
}

impl TaskId {
    pub fn new(partition: TaskPartition, number: i64) -> Self {
        Self { partition, number }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.partition.as_str(), self.number)
    }
}

impl FromStr for TaskId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, number) = s
            .split_once('-')
            .ok_or_else(|| EngineError::Config(format!("malformed task id: '{s}'")))?;
        let partition = match prefix {
            "d" => TaskPartition::Data,
            "m" => TaskPartition::Management,
            _ => return Err(EngineError::Config(format!("unknown task id prefix: '{s}'"))),
        };
        let number: i64 = number
            .parse()
            .map_err(|_| EngineError::Config(format!("malformed task id: '{s}'")))?;
        Ok(TaskId::new(partition, number))
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// One document in a RESERVE request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveDocument {
    pub id: String,
    pub timestamp: i64,
}

/// JSON payload stored in `input_tasks`. Field names match the wire format
/// used by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskPayload {
    #[serde(rename = "ADD", rename_all = "camelCase")]
    Add {
        doc_id: String,
        timestamp: i64,
        body_text: String,
        locale: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attrs: Option<String>,
    },
    #[serde(rename = "REMOVE", rename_all = "camelCase")]
    Remove { doc_id: String, timestamp: i64 },
    #[serde(rename = "SYNC")]
    Sync {},
    #[serde(rename = "OPTIMIZE", rename_all = "camelCase")]
    Optimize { target_timestamp: i64 },
    #[serde(rename = "RECONSTRUCT", rename_all = "camelCase")]
    Reconstruct {
        target_timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_initial_id: Option<i64>,
        #[serde(default)]
        use_external_id: bool,
    },
    #[serde(rename = "RESERVE")]
    Reserve { documents: Vec<ReserveDocument> },
    #[serde(rename = "DROP_SHARD", rename_all = "camelCase")]
    DropShard { target_timestamp: i64 },
}

impl TaskPayload {
    /// Data tasks mutate documents and go through the batch table; everything
    /// else is a management task.
    pub fn partition(&self) -> TaskPartition {
        match self {
            TaskPayload::Add { .. } | TaskPayload::Remove { .. } => TaskPartition::Data,
            _ => TaskPartition::Management,
        }
    }

    /// Operations that mutate shard identity or allocation; only admitted
    /// while maintenance mode is on.
    pub fn requires_maintenance(&self) -> bool {
        matches!(
            self,
            TaskPayload::Reserve { .. }
                | TaskPayload::Reconstruct { .. }
                | TaskPayload::DropShard { .. }
        )
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::Add { .. } => "ADD",
            TaskPayload::Remove { .. } => "REMOVE",
            TaskPayload::Sync {} => "SYNC",
            TaskPayload::Optimize { .. } => "OPTIMIZE",
            TaskPayload::Reconstruct { .. } => "RECONSTRUCT",
            TaskPayload::Reserve { .. } => "RESERVE",
            TaskPayload::DropShard { .. } => "DROP_SHARD",
        }
    }
}

/// A task pulled out of the queue: id plus decoded payload.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub payload: TaskPayload,
}
