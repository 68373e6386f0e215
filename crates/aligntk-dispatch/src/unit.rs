//! Work units: the self-contained tasks a master hands out and a worker
//! executes as a child process (§3 "Work unit", §4.F).

use serde::{Deserialize, Serialize};

/// Which stage of the core pipeline a unit invokes. Used only for logging
/// and for routing a unit's arguments to the right CLI binary; the
/// dispatcher itself treats every kind identically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkKind {
    /// A component A pyramid (+ mask) build for one image.
    BuildPyramid,
    /// A component B/C/D run for one pair: pyramid walk, correspondence,
    /// local-map solve, ending in a persisted per-pair `Map`.
    RegisterPair,
    /// One color class's worth of component E relaxation sweeps.
    RelaxationBlock,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildPyramid => "build_pyramid",
            Self::RegisterPair => "register_pair",
            Self::RelaxationBlock => "relaxation_block",
        }
    }
}

/// A serialized description of one task: which program to run, with what
/// arguments, plus a unique id the master uses to track completion and
/// retries (§3).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: u64,
    pub kind: WorkKind,
    /// Executable to run. Workers execute units as child processes.
    pub program: String,
    pub args: Vec<String>,
}

impl WorkUnit {
    pub fn new(id: u64, kind: WorkKind, program: impl Into<String>, args: Vec<String>) -> Self {
        Self { id, kind, program: program.into(), args }
    }
}

/// The outcome of running one unit, reported by a worker in `DONE(id, status)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Ok,
    Fail { reason: String },
}

impl UnitStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}
