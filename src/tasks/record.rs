//! # Records of the job tree.
//!
//! - [`TaskDef`] `meta/task/<def>/:taskdef`
//! - [`TaskInstance`] `task/<path>/:task`
//! - [`RunState`] `status/run/<path>/:task/<field>` (one key per field)
//!
//! The run-state record is what status tooling reads. Its `running` field is
//! the lease: it exists iff some process believes it owns the execution.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{Store, StoreError, layout};
use crate::tasks::vars::VarMap;

/// A task definition: which job kind to run and its default variables.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDef {
    /// Implementation language of the job.
    #[serde(default)]
    pub language: String,
    /// Job kind key, resolved through the [`Catalog`](crate::Catalog).
    pub code: String,
    /// Default variables.
    #[serde(default, skip_serializing_if = "VarMap::is_empty")]
    pub data: VarMap,
    /// One-line description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
}

/// A task instance: one unit of work under `task/`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Definition path below `meta/task/`.
    pub taskdef: String,
    /// Instance path that must keep existing while this one runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Variable overrides and job-specific data.
    #[serde(default, skip_serializing_if = "VarMap::is_empty")]
    pub data: VarMap,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descr: Option<String>,
}

impl TaskInstance {
    /// Instance of `taskdef` with no parent and no data.
    pub fn new(taskdef: impl Into<String>) -> Self {
        Self {
            taskdef: taskdef.into(),
            ..Self::default()
        }
    }

    /// Sets the parent instance.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Sets the data map.
    pub fn with_data(mut self, data: VarMap) -> Self {
        self.data = data;
        self
    }
}

/// Recorded (or derived) status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// A holder owns the lease.
    Run,
    /// Last run completed.
    Ok,
    /// Last run ended with a payload error.
    Error,
    /// Last run was aborted (lease lost, timeout, parent gone, cancelled).
    Fail,
    /// A run started and never recorded its end.
    Crash,
}

impl RunStatus {
    /// Stored spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Run => "run",
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Fail => "fail",
            RunStatus::Crash => "crash",
        }
    }

    /// Parses the stored spelling.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "run" => RunStatus::Run,
            "ok" => RunStatus::Ok,
            "error" => RunStatus::Error,
            "fail" => RunStatus::Fail,
            "crash" => RunStatus::Crash,
            _ => return None,
        })
    }
}

/// Field names of the run-state record.
pub mod field {
    /// Lease value (timestamp); TTL-bound.
    pub const RUNNING: &str = "running";
    /// Start timestamp.
    pub const STARTED: &str = "started";
    /// Stop timestamp.
    pub const STOPPED: &str = "stopped";
    /// Recorded status.
    pub const STATE: &str = "state";
    /// Result or error text.
    pub const MESSAGE: &str = "message";
    /// Debug chain of the last error.
    pub const DEBUG: &str = "debug";
    /// Timestamp of the last error.
    pub const DEBUG_TIME: &str = "debug_time";
}

/// Snapshot of a run-state record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunState {
    pub running: Option<f64>,
    pub started: Option<f64>,
    pub stopped: Option<f64>,
    pub state: Option<RunStatus>,
    pub message: Option<String>,
    pub debug: Option<String>,
    pub debug_time: Option<f64>,
}

impl RunState {
    /// Reads every field of the record of `path`.
    pub async fn load(store: &dyn Store, path: &str) -> Result<Self, StoreError> {
        Ok(Self {
            running: read(store, path, field::RUNNING).await?.as_ref().and_then(Value::as_f64),
            started: read(store, path, field::STARTED).await?.as_ref().and_then(Value::as_f64),
            stopped: read(store, path, field::STOPPED).await?.as_ref().and_then(Value::as_f64),
            state: read(store, path, field::STATE)
                .await?
                .as_ref()
                .and_then(Value::as_str)
                .and_then(RunStatus::parse),
            message: read(store, path, field::MESSAGE).await?.and_then(into_string),
            debug: read(store, path, field::DEBUG).await?.and_then(into_string),
            debug_time: read(store, path, field::DEBUG_TIME)
                .await?
                .as_ref()
                .and_then(Value::as_f64),
        })
    }

    /// Observed status: `run` while the lease exists, `crash` when a start has
    /// no later stop, otherwise the recorded state.
    pub fn status(&self) -> Option<RunStatus> {
        if self.running.is_some() {
            return Some(RunStatus::Run);
        }
        if let Some(started) = self.started {
            if self.stopped.is_none_or(|stopped| stopped < started) {
                return Some(RunStatus::Crash);
            }
        }
        self.state
    }
}

async fn read(store: &dyn Store, path: &str, f: &str) -> Result<Option<Value>, StoreError> {
    Ok(store.get(&layout::state_key(path, f)).await?.map(|n| n.value))
}

fn into_string(v: Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Wall-clock seconds since the epoch, as stored in timestamps.
pub fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_is_derived() {
        let mut rs = RunState {
            state: Some(RunStatus::Ok),
            started: Some(10.0),
            stopped: Some(12.0),
            ..RunState::default()
        };
        assert_eq!(rs.status(), Some(RunStatus::Ok));

        rs.running = Some(13.0);
        assert_eq!(rs.status(), Some(RunStatus::Run));

        rs.running = None;
        rs.started = Some(14.0);
        assert_eq!(rs.status(), Some(RunStatus::Crash));

        rs.stopped = None;
        assert_eq!(rs.status(), Some(RunStatus::Crash));

        assert_eq!(RunState::default().status(), None);
    }

    #[test]
    fn instance_json_shape() {
        let inst = TaskInstance::new("test/sleep").with_parent("a");
        assert_eq!(
            serde_json::to_value(&inst).unwrap(),
            json!({"taskdef": "test/sleep", "parent": "a"})
        );
        let back: TaskInstance = serde_json::from_value(json!({"taskdef": "x"})).unwrap();
        assert_eq!(back, TaskInstance::new("x"));
    }

    #[test]
    fn status_spelling() {
        for s in ["run", "ok", "error", "fail", "crash"] {
            assert_eq!(RunStatus::parse(s).map(|st| st.as_str()), Some(s));
        }
        assert_eq!(serde_json::to_value(RunStatus::Fail).unwrap(), json!("fail"));
    }
}
