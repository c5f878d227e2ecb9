// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::Deserialize;
use std::fmt;

/// Scheduler-side task state. States this crate does not act on are kept
/// verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum TaskState {
    Released,
    Waiting,
    Queued,
    NoWorker,
    Processing,
    Memory,
    Erred,
    Forgotten,
    Other(String),
}

impl TaskState {
    /// Terminal outcome of a task run: success or failure.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Memory | TaskState::Erred)
    }
}

impl From<&str> for TaskState {
    fn from(s: &str) -> Self {
        match s {
            "released" => TaskState::Released,
            "waiting" => TaskState::Waiting,
            "queued" => TaskState::Queued,
            "no-worker" => TaskState::NoWorker,
            "processing" => TaskState::Processing,
            "memory" => TaskState::Memory,
            "erred" => TaskState::Erred,
            "forgotten" => TaskState::Forgotten,
            other => TaskState::Other(other.to_string()),
        }
    }
}

impl From<String> for TaskState {
    fn from(s: String) -> Self {
        TaskState::from(s.as_str())
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Released => write!(f, "released"),
            TaskState::Waiting => write!(f, "waiting"),
            TaskState::Queued => write!(f, "queued"),
            TaskState::NoWorker => write!(f, "no-worker"),
            TaskState::Processing => write!(f, "processing"),
            TaskState::Memory => write!(f, "memory"),
            TaskState::Erred => write!(f, "erred"),
            TaskState::Forgotten => write!(f, "forgotten"),
            TaskState::Other(s) => write!(f, "{s}"),
        }
    }
}

/// A task lifecycle event from the host scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskTransition {
    pub key: String,
    pub start: TaskState,
    pub finish: TaskState,
    #[serde(default)]
    pub stimulus_id: Option<String>,
    /// Worker that ran the task, present on completion transitions.
    #[serde(default)]
    pub worker: Option<String>,
    /// Anything else the host attached (compute time, etc.).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskTransition {
    pub fn new(
        key: impl Into<String>,
        start: impl Into<TaskState>,
        finish: impl Into<TaskState>,
        worker: Option<&str>,
    ) -> Self {
        Self {
            key: key.into(),
            start: start.into(),
            finish: finish.into(),
            stimulus_id: None,
            worker: worker.map(String::from),
            extra: serde_json::Map::new(),
        }
    }

    /// processing -> memory or processing -> erred.
    pub fn is_task_completion(&self) -> bool {
        self.start == TaskState::Processing && self.finish.is_terminal()
    }
}
