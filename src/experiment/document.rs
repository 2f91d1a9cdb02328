//! Run documents published by the `RunEngine`.
//!
//! Every run bracket produces exactly one pair of documents:
//!
//! - **StartDoc**: emitted on `open_run`, carries the run metadata
//! - **StopDoc**: emitted on `close_run` (or when the engine closes a run the
//!   plan left open), carries the exit status
//!
//! ```text
//! StartDoc ── uid ──┐
//!                   │
//! StopDoc ── run_uid┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Completed, or stopped on request
    Success,
    /// Aborted on request
    Abort,
    /// Ended by an error
    Fail,
}

impl ExitStatus {
    /// Wire form used in the `exit_status` kwarg.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitStatus::Success => "success",
            ExitStatus::Abort => "abort",
            ExitStatus::Fail => "fail",
        }
    }

    /// Parse the `exit_status` kwarg of a close message. Unknown or missing
    /// values count as success.
    pub fn from_kwarg(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("abort") => ExitStatus::Abort,
            Some("fail") => ExitStatus::Fail,
            _ => ExitStatus::Success,
        }
    }
}

/// Document types for run data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Run opened
    Start(StartDoc),
    /// Run closed
    Stop(StopDoc),
}

impl Document {
    /// Unique id of this document
    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// Get the run UID this document belongs to
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Stop(d) => &d.run_uid,
        }
    }

    /// Creation time in nanoseconds since the Unix epoch
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            Document::Start(d) => d.time_ns,
            Document::Stop(d) => d.time_ns,
        }
    }
}

/// Start document - emitted at the beginning of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    /// Name of the plan that opened the run
    pub plan_name: String,
    /// Keyword arguments of the open message
    pub metadata: Map<String, Value>,
    /// Creation time in nanoseconds since the Unix epoch
    pub time_ns: u64,
}

impl StartDoc {
    /// New start document with a fresh run uid.
    pub fn new(plan_name: &str) -> Self {
        Self {
            uid: new_uid(),
            plan_name: plan_name.to_string(),
            metadata: Map::new(),
            time_ns: now_ns(),
        }
    }

    /// Add the open message's metadata.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique id of this document
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// How the run ended
    pub exit_status: ExitStatus,
    /// Reason for abort/failure
    pub reason: String,
    /// Creation time in nanoseconds since the Unix epoch
    pub time_ns: u64,
    /// Messages processed while the run was open
    pub num_messages: u32,
}

impl StopDoc {
    /// New stop document for `run_uid`.
    pub fn new(run_uid: &str, exit_status: ExitStatus, reason: &str, num_messages: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status,
            reason: reason.to_string(),
            time_ns: now_ns(),
            num_messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_doc_builder() {
        let mut md = Map::new();
        md.insert("operator".into(), json!("Alice"));
        let doc = StartDoc::new("count").with_metadata(md);

        assert_eq!(doc.plan_name, "count");
        assert_eq!(doc.metadata.get("operator"), Some(&json!("Alice")));
    }

    #[test]
    fn test_document_enum() {
        let start = StartDoc::new("test");
        let run_uid = start.uid.clone();
        let stop = Document::Stop(StopDoc::new(&run_uid, ExitStatus::Fail, "boom", 3));
        let doc = Document::Start(start);

        assert_eq!(doc.run_uid(), run_uid);
        assert_eq!(stop.run_uid(), run_uid);
        assert_ne!(stop.uid(), run_uid);
    }

    #[test]
    fn test_exit_status_serialization() {
        let stop = StopDoc::new("run", ExitStatus::Abort, "user", 0);
        let value = serde_json::to_value(Document::Stop(stop)).unwrap();
        assert_eq!(value["type"], json!("stop"));
        assert_eq!(value["exit_status"], json!("abort"));
    }

    #[test]
    fn test_exit_status_from_kwarg() {
        assert_eq!(ExitStatus::from_kwarg(None), ExitStatus::Success);
        assert_eq!(ExitStatus::from_kwarg(Some(&json!("fail"))), ExitStatus::Fail);
        assert_eq!(ExitStatus::from_kwarg(Some(&json!("abort"))), ExitStatus::Abort);
    }
}
