//! The three messages a worker may send a master, plus the two a master
//! may send a worker, per §4.F:
//!
//! - worker -> master: `READY`, `DONE(id, status)`, `LOG(id, bytes)`
//! - master -> worker: an assignment (the next queued unit), or `EXIT`
//!   once the queue has drained.

use serde::{Deserialize, Serialize};

use crate::unit::{UnitStatus, WorkUnit};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// Worker -> master: this worker is idle and wants a unit.
    Ready,
    /// Worker -> master: unit `id` finished with `status`.
    Done { id: u64, status: UnitStatus },
    /// Worker -> master: a chunk of captured stdout/stderr for unit `id`.
    Log { id: u64, bytes: Vec<u8> },
    /// Master -> worker: execute this unit next.
    Assign(WorkUnit),
    /// Master -> worker: no more units; shut down.
    Exit,
}
