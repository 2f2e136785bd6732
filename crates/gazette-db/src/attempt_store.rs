//! Per-attempt execution telemetry.
//!
//! One appended row per finished attempt: who ran it, with what routing,
//! how it ended. Kept separate from the event log so operational queries
//! ("show me every attempt of task 12") stay cheap and structured.

use anyhow::Result;
use chrono::{DateTime, Utc};
use gazette_core::task::{FailureClass, TaskId};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

/// Attempts table: i64 attempt ID -> JSON-serialized AttemptRecord.
pub const ATTEMPTS_TABLE: TableDefinition<i64, &str> = TableDefinition::new("task_attempts");

const NEXT_ATTEMPT_ID_KEY: &str = "next_attempt_id";

/// Telemetry for one finished attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Assigned by the store on append.
    pub id: i64,
    pub task_id: TaskId,
    /// 1-based attempt number within the task.
    pub attempt_no: u32,
    pub worker_id: String,
    pub agent: String,
    pub model: String,
    pub profile: String,
    /// Final status label the attempt committed ("succeeded", "queued",
    /// "failed", "canceled").
    pub outcome: String,
    pub failure_class: Option<FailureClass>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub wall_time_secs: f64,
    /// Sanitized, truncated previews — never raw agent output.
    pub error_summary: Option<String>,
    pub stdout_preview: String,
    pub stderr_preview: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct AttemptStore<'a> {
    db: &'a Database,
}

impl<'a> AttemptStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Append an attempt record.
    pub fn append(&self, mut record: AttemptRecord) -> Result<AttemptRecord> {
        let write_txn = self.db.begin_write()?;
        {
            let mut counters = write_txn.open_table(crate::task_store::COUNTER_TABLE)?;
            let next_id = counters
                .get(NEXT_ATTEMPT_ID_KEY)?
                .map(|v| v.value())
                .unwrap_or(1);
            record.id = next_id;
            counters.insert(NEXT_ATTEMPT_ID_KEY, next_id + 1)?;

            let json = serde_json::to_string(&record)?;
            let mut attempts = write_txn.open_table(ATTEMPTS_TABLE)?;
            attempts.insert(next_id, json.as_str())?;
        }
        write_txn.commit()?;
        Ok(record)
    }

    /// All attempts for one task, in execution order.
    pub fn for_task(&self, task_id: TaskId) -> Result<Vec<AttemptRecord>> {
        let read_txn = self.db.begin_read()?;
        let attempts = read_txn.open_table(ATTEMPTS_TABLE)?;
        let mut result = Vec::new();

        let iter = attempts.iter()?;
        for entry in iter {
            let (_, value) = entry?;
            let record: AttemptRecord = serde_json::from_str(value.value())?;
            if record.task_id == task_id {
                result.push(record);
            }
        }
        Ok(result)
    }
}
