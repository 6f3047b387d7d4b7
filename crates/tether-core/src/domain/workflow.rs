//! Workflow instance snapshot as seen by the mirror.
//!
//! The engine owns execution; this is only the shape we replicate and adopt.
//! Field names go over the wire in camelCase and enums as their names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{Reference, WorkflowId};
use crate::typed::WorkflowData;

/// Lifecycle status of a workflow instance.
///
/// Reads accept the name in any case, the legacy `Runnable` name and the
/// legacy ordinal (0..=3) so older producers keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "EnumRepr")]
pub enum WorkflowStatus {
    Running,
    Suspended,
    Complete,
    Terminated,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Complete | WorkflowStatus::Terminated)
    }

    fn from_ordinal(n: u64) -> Option<Self> {
        match n {
            0 => Some(WorkflowStatus::Running),
            1 => Some(WorkflowStatus::Suspended),
            2 => Some(WorkflowStatus::Complete),
            3 => Some(WorkflowStatus::Terminated),
            _ => None,
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" | "runnable" => Ok(WorkflowStatus::Running),
            "suspended" => Ok(WorkflowStatus::Suspended),
            "complete" => Ok(WorkflowStatus::Complete),
            "terminated" => Ok(WorkflowStatus::Terminated),
            _ => Err(format!("unable to convert \"{s}\" to WorkflowStatus")),
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Status of one execution pointer (one step activation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "EnumRepr")]
pub enum PointerStatus {
    Legacy,
    Pending,
    Running,
    Complete,
    Sleeping,
    WaitingForEvent,
    Failed,
    Compensated,
    Cancelled,
    PendingPredecessor,
}

impl PointerStatus {
    const ALL: [PointerStatus; 10] = [
        PointerStatus::Legacy,
        PointerStatus::Pending,
        PointerStatus::Running,
        PointerStatus::Complete,
        PointerStatus::Sleeping,
        PointerStatus::WaitingForEvent,
        PointerStatus::Failed,
        PointerStatus::Compensated,
        PointerStatus::Cancelled,
        PointerStatus::PendingPredecessor,
    ];
}

impl FromStr for PointerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| format!("{status:?}").eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unable to convert \"{s}\" to PointerStatus"))
    }
}

/// Either spelling an enum may arrive in.
#[derive(Deserialize)]
#[serde(untagged)]
enum EnumRepr {
    Name(String),
    Ordinal(u64),
}

impl TryFrom<EnumRepr> for WorkflowStatus {
    type Error = String;

    fn try_from(repr: EnumRepr) -> Result<Self, Self::Error> {
        match repr {
            EnumRepr::Name(name) => name.parse(),
            EnumRepr::Ordinal(n) => Self::from_ordinal(n)
                .ok_or_else(|| format!("unable to convert {n} to WorkflowStatus")),
        }
    }
}

impl TryFrom<EnumRepr> for PointerStatus {
    type Error = String;

    fn try_from(repr: EnumRepr) -> Result<Self, Self::Error> {
        match repr {
            EnumRepr::Name(name) => name.parse(),
            EnumRepr::Ordinal(n) => usize::try_from(n)
                .ok()
                .and_then(|i| Self::ALL.get(i).copied())
                .ok_or_else(|| format!("unable to convert {n} to PointerStatus")),
        }
    }
}

/// One step activation inside an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPointer {
    pub id: String,
    pub step_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default)]
    pub active: bool,
    pub status: PointerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
}

/// Snapshot of a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    pub workflow_definition_id: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub reference: Reference,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub data: WorkflowData,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub execution_pointers: Vec<ExecutionPointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution: Option<i64>,
    pub create_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_time: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// A freshly created, not yet initialized instance (empty reference).
    pub fn new(id: WorkflowId, definition_id: impl Into<String>, version: u32, data: WorkflowData) -> Self {
        Self {
            id,
            workflow_definition_id: definition_id.into(),
            version,
            description: None,
            reference: Reference::default(),
            status: WorkflowStatus::Running,
            data,
            execution_pointers: Vec::new(),
            next_execution: None,
            create_time: Utc::now(),
            complete_time: None,
        }
    }

    /// Assign a reference unless one is already set; returns the reference.
    ///
    /// The reference is what topic names are built from, so it is set once
    /// and then left alone for the lifetime of the instance.
    pub fn ensure_reference(&mut self) -> &Reference {
        if self.reference.is_empty() {
            self.reference = Reference::generate();
        }
        &self.reference
    }

    pub fn is_initialized(&self) -> bool {
        !self.reference.is_empty()
    }

    /// Move to `status`, stamping the completion time on terminal statuses.
    pub fn transition(&mut self, status: WorkflowStatus) {
        self.status = status;
        if status.is_terminal() && self.complete_time.is_none() {
            self.complete_time = Some(Utc::now());
        }
    }
}
