//! Append-only task event log.
//!
//! Events are written inside the same transaction as the transition they
//! record (see `task_store`); this module owns the table and the read API.

use anyhow::Result;
use gazette_core::event::TaskEvent;
use gazette_core::task::TaskId;
use redb::{Database, ReadableTable, Table, TableDefinition};

/// Events table: i64 event ID -> JSON-serialized TaskEvent.
pub const EVENTS_TABLE: TableDefinition<i64, &str> = TableDefinition::new("task_events");

const NEXT_EVENT_ID_KEY: &str = "next_event_id";

/// Append an event within an already-open write transaction.
///
/// Shared with `task_store` so a transition and its event commit atomically.
pub(crate) fn append_in_txn(
    events: &mut Table<i64, &str>,
    counters: &mut Table<&str, i64>,
    mut event: TaskEvent,
) -> Result<i64> {
    let next_id = counters
        .get(NEXT_EVENT_ID_KEY)?
        .map(|v| v.value())
        .unwrap_or(1);
    event.id = next_id;
    counters.insert(NEXT_EVENT_ID_KEY, next_id + 1)?;

    let json = serde_json::to_string(&event)?;
    events.insert(next_id, json.as_str())?;
    Ok(next_id)
}

pub struct EventStore<'a> {
    db: &'a Database,
}

impl<'a> EventStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Append a standalone event (not tied to a status transition).
    pub fn append(&self, event: TaskEvent) -> Result<TaskEvent> {
        let write_txn = self.db.begin_write()?;
        let id = {
            let mut events = write_txn.open_table(EVENTS_TABLE)?;
            let mut counters = write_txn.open_table(crate::task_store::COUNTER_TABLE)?;
            append_in_txn(&mut events, &mut counters, event.clone())?
        };
        write_txn.commit()?;
        let mut event = event;
        event.id = id;
        Ok(event)
    }

    /// All events for one task, in append order.
    pub fn for_task(&self, task_id: TaskId) -> Result<Vec<TaskEvent>> {
        let read_txn = self.db.begin_read()?;
        let events = read_txn.open_table(EVENTS_TABLE)?;
        let mut result = Vec::new();

        let iter = events.iter()?;
        for entry in iter {
            let (_, value) = entry?;
            let event: TaskEvent = serde_json::from_str(value.value())?;
            if event.task_id == task_id {
                result.push(event);
            }
        }
        Ok(result)
    }

    /// The most recent `limit` events across all tasks.
    pub fn recent(&self, limit: usize) -> Result<Vec<TaskEvent>> {
        let read_txn = self.db.begin_read()?;
        let events = read_txn.open_table(EVENTS_TABLE)?;
        let mut result = Vec::new();

        let iter = events.iter()?.rev();
        for entry in iter {
            let (_, value) = entry?;
            result.push(serde_json::from_str(value.value())?);
            if result.len() >= limit {
                break;
            }
        }
        result.reverse();
        Ok(result)
    }
}
