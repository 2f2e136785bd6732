pub mod attempt_store;
pub mod event_store;
pub mod task_store;

use anyhow::Result;
use redb::Database;
use std::path::Path;

/// Open (or create) the gazette database at the given path.
pub fn open_db(path: &Path) -> Result<Database> {
    let db = Database::create(path)?;
    // Ensure all tables exist by doing a write transaction
    let write_txn = db.begin_write()?;
    {
        let _tasks = write_txn.open_table(task_store::TASKS_TABLE)?;
        let _counters = write_txn.open_table(task_store::COUNTER_TABLE)?;
        let _events = write_txn.open_table(event_store::EVENTS_TABLE)?;
        let _attempts = write_txn.open_table(attempt_store::ATTEMPTS_TABLE)?;
    }
    write_txn.commit()?;
    Ok(db)
}
