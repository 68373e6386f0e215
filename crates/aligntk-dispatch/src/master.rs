//! The master side of the dispatcher (§4.F): reads a task list, hands out
//! work units on `READY`, requeues failures up to `max_retries`, appends
//! `LOG` chunks to a per-unit buffer, and shuts workers down with `EXIT`
//! once the queue has drained.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{info, warn};

use crate::error::{DispatchError, Result};
use crate::message::Message;
use crate::transport::{NodeId, Transport, MASTER};
use crate::unit::{UnitStatus, WorkUnit};

/// How a unit ultimately resolved, including how many times it was
/// requeued after a failure.
#[derive(Clone, Debug)]
pub struct UnitOutcome {
    pub id: u64,
    pub status: UnitStatus,
    pub retries: usize,
}

/// The dispatcher's final accounting for one run: every unit's outcome
/// plus accumulated log bytes, keyed by unit id.
#[derive(Clone, Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<UnitOutcome>,
    pub logs: HashMap<u64, Vec<u8>>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.outcomes.iter().filter(|o| o.status.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.outcomes.iter().filter(|o| !o.status.is_ok())
    }

    /// Process exit code per §4.F: 0 if every unit succeeded, 1 if any
    /// unit permanently failed.
    pub fn exit_code(&self) -> i32 {
        if self.failed().next().is_some() {
            1
        } else {
            0
        }
    }
}

/// Tunables for one dispatch run.
#[derive(Clone, Copy, Debug)]
pub struct MasterConfig {
    pub max_retries: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

/// Run the master loop to completion against `num_workers` connected
/// workers (node ids `0..num_workers`), distributing `units` and
/// returning once every worker has been sent `EXIT` and the loop's
/// receive channel is drained. Blocks on `transport.recv` exactly as
/// production workers would (§5 "Suspension points").
pub fn run_master<T: Transport>(
    transport: &T,
    units: Vec<WorkUnit>,
    num_workers: usize,
    config: MasterConfig,
) -> Result<DispatchReport> {
    let unit_by_id: HashMap<u64, WorkUnit> = units.iter().map(|u| (u.id, u.clone())).collect();
    let mut queue: VecDeque<WorkUnit> = units.into_iter().collect();
    let mut retries: HashMap<u64, usize> = HashMap::new();
    let mut outcomes: Vec<UnitOutcome> = Vec::new();
    let mut logs: HashMap<u64, Vec<u8>> = HashMap::new();
    let mut active_workers: HashSet<NodeId> = (0..num_workers).collect();

    if num_workers == 0 {
        return Err(DispatchError::Config("no workers to dispatch to".into()));
    }

    while !active_workers.is_empty() {
        let (msg, from) = transport.recv(MASTER)?;
        match msg {
            Message::Ready => {
                if let Some(unit) = queue.pop_front() {
                    info!(worker = from, unit = unit.id, kind = unit.kind.as_str(), "assigning unit");
                    transport.send(from, Message::Assign(unit))?;
                } else {
                    transport.send(from, Message::Exit)?;
                    active_workers.remove(&from);
                }
            }
            Message::Done { id, status } => match status {
                UnitStatus::Ok => {
                    let retry_count = retries.get(&id).copied().unwrap_or(0);
                    outcomes.push(UnitOutcome { id, status: UnitStatus::Ok, retries: retry_count });
                }
                UnitStatus::Fail { reason } => {
                    let retry_count = retries.entry(id).or_insert(0);
                    if *retry_count < config.max_retries {
                        *retry_count += 1;
                        warn!(unit = id, retry = *retry_count, reason = %reason, "unit failed, requeuing");
                        let original = unit_by_id
                            .get(&id)
                            .ok_or_else(|| DispatchError::Config(format!("unknown unit id {id}")))?
                            .clone();
                        queue.push_back(original);
                    } else {
                        warn!(unit = id, reason = %reason, "unit permanently failed");
                        outcomes.push(UnitOutcome {
                            id,
                            status: UnitStatus::Fail { reason },
                            retries: *retry_count,
                        });
                    }
                }
            },
            Message::Log { id, bytes } => {
                logs.entry(id).or_default().extend(bytes);
            }
            Message::Assign(_) | Message::Exit => {
                return Err(DispatchError::Transport(format!(
                    "master received a worker-bound message from node {from}"
                )));
            }
        }
    }

    Ok(DispatchReport { outcomes, logs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use crate::unit::WorkKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    /// §8 scenario 6: 3 workers, 100 units, 5 of which deterministically
    /// fail once then succeed. All 100 must eventually `DONE(OK)`, and
    /// each of the 5 must show exactly one retry.
    #[test]
    fn all_units_eventually_succeed_with_exactly_one_retry_each() {
        const NUM_UNITS: u64 = 100;
        const NUM_WORKERS: usize = 3;
        let flaky: HashSet<u64> = [3, 17, 42, 61, 88].into_iter().collect();

        let units: Vec<WorkUnit> = (0..NUM_UNITS)
            .map(|id| WorkUnit::new(id, WorkKind::RegisterPair, "register", vec![id.to_string()]))
            .collect();

        let (master, workers) = ChannelTransport::new(NUM_WORKERS);
        let attempt_counts: Arc<Vec<AtomicUsize>> =
            Arc::new((0..NUM_UNITS).map(|_| AtomicUsize::new(0)).collect());

        let handles: Vec<_> = workers
            .into_iter()
            .map(|w| {
                let flaky = flaky.clone();
                let attempt_counts = attempt_counts.clone();
                thread::spawn(move || {
                    let id = w.id();
                    loop {
                        w.send(MASTER, Message::Ready).unwrap();
                        match w.recv(id).unwrap().0 {
                            Message::Assign(unit) => {
                                let attempt = attempt_counts[unit.id as usize].fetch_add(1, Ordering::SeqCst);
                                let status = if flaky.contains(&unit.id) && attempt == 0 {
                                    UnitStatus::Fail { reason: "deterministic test failure".into() }
                                } else {
                                    UnitStatus::Ok
                                };
                                w.send(MASTER, Message::Done { id: unit.id, status }).unwrap();
                            }
                            Message::Exit => break,
                            _ => unreachable!(),
                        }
                    }
                })
            })
            .collect();

        let report = run_master(&master, units, NUM_WORKERS, MasterConfig { max_retries: 2 }).unwrap();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(report.outcomes.len(), NUM_UNITS as usize);
        assert!(report.failed().next().is_none(), "no unit should be permanently failed");
        for outcome in &report.outcomes {
            let expected_retries = if flaky.contains(&outcome.id) { 1 } else { 0 };
            assert_eq!(
                outcome.retries, expected_retries,
                "unit {} expected {} retries, got {}",
                outcome.id, expected_retries, outcome.retries
            );
        }
    }

    #[test]
    fn exhausting_retries_marks_unit_permanently_failed() {
        let units = vec![WorkUnit::new(0, WorkKind::BuildPyramid, "build", vec![])];
        let (master, workers) = ChannelTransport::new(1);
        let worker = workers.into_iter().next().unwrap();

        let handle = thread::spawn(move || {
            let id = worker.id();
            loop {
                worker.send(MASTER, Message::Ready).unwrap();
                match worker.recv(id).unwrap().0 {
                    Message::Assign(unit) => {
                        worker
                            .send(MASTER, Message::Done {
                                id: unit.id,
                                status: UnitStatus::Fail { reason: "always fails".into() },
                            })
                            .unwrap();
                    }
                    Message::Exit => break,
                    _ => unreachable!(),
                }
            }
        });

        let report = run_master(&master, units, 1, MasterConfig { max_retries: 2 }).unwrap();
        handle.join().unwrap();

        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].retries, 2);
        assert!(!report.outcomes[0].status.is_ok());
    }
}
