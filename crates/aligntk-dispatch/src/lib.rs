//! Component F: the distributed work-dispatch layer (`prun`/`libpar`, §4.F).
//!
//! A master process reads a task list, enqueues [`unit::WorkUnit`]s, and
//! hands them out to workers over a [`transport::Transport`] as each
//! worker reports `READY`. Workers execute units as child processes and
//! stream captured output back as `LOG` chunks; a failed unit is requeued
//! up to a configured retry limit before being marked permanently failed.
//! See [`master::run_master`] and [`worker::run_worker`].

pub mod error;
pub mod master;
pub mod message;
pub mod transport;
pub mod unit;
pub mod worker;

/// Process-level exit codes (§4.F).
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const UNIT_FAILURE: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const IO_ERROR: i32 = 3;
}
