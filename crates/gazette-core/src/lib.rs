//! Domain types and pure logic for the gazette orchestration core.
//!
//! No async runtime and no storage here: the task model and state machine,
//! the file contract crossing the process boundary, routing resolution, the
//! failure classifier, drift counting, configuration, and telemetry setup.

pub mod classify;
pub mod config;
pub mod contract;
pub mod drift;
pub mod event;
pub mod routing;
pub mod task;
pub mod telemetry;
