//! The worker side of the dispatcher (§4.F): sends `READY`, executes
//! whatever unit it is assigned as a child process, streams captured
//! output back as `LOG` chunks, reports `DONE`, and exits on `EXIT`.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::Result;
use crate::message::Message;
use crate::transport::{NodeId, Transport, MASTER};
use crate::unit::{UnitStatus, WorkUnit};

/// Executes one [`WorkUnit`] and reports back its outcome plus any
/// captured output. Kept as a trait so tests can substitute a fake
/// executor instead of actually spawning a child process (§8 scenario 6).
pub trait UnitExecutor: Send + Sync {
    fn execute(&self, unit: &WorkUnit) -> (UnitStatus, Vec<u8>);
}

/// Runs a unit's `program`/`args` as a child process, capturing combined
/// stdout+stderr. Exit code 0 maps to `UnitStatus::Ok`; anything else
/// (including termination by signal, indistinguishable from `DONE(FAIL)`
/// per §5 "Cancellation") maps to `UnitStatus::Fail`.
pub struct ProcessExecutor {
    pub timeout: Option<Duration>,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self { timeout: None }
    }
}

impl UnitExecutor for ProcessExecutor {
    fn execute(&self, unit: &WorkUnit) -> (UnitStatus, Vec<u8>) {
        let mut child = match Command::new(&unit.program)
            .args(&unit.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => return (UnitStatus::Fail { reason: format!("spawn failed: {e}") }, Vec::new()),
        };

        // Drain stdout and stderr concurrently on background threads so a
        // unit that fills one pipe's buffer while the other stays open
        // can't deadlock a sequential read against the child's blocked
        // write, and so a hung child's full pipes don't block the
        // timeout check below.
        let stdout_reader = child.stdout.take().map(|mut stdout| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stdout.read_to_end(&mut buf);
                buf
            })
        });
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            })
        });

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => {
                    if let Some(timeout) = self.timeout {
                        if start.elapsed() >= timeout {
                            let _ = child.kill();
                            let _ = child.wait();
                            break Err("unit exceeded its wall-clock timeout".to_string());
                        }
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => break Err(format!("wait failed: {e}")),
            }
        };

        // The child has exited or been killed, so both pipes are closed
        // and these joins can no longer block.
        let mut bytes = stdout_reader.map(|h| h.join().unwrap_or_default()).unwrap_or_default();
        if let Some(stderr_bytes) = stderr_reader.map(|h| h.join().unwrap_or_default()) {
            bytes.extend(stderr_bytes);
        }

        let unit_status = match status {
            Ok(status) if status.success() => UnitStatus::Ok,
            Ok(status) => UnitStatus::Fail {
                reason: format!("exited with {status}"),
            },
            Err(reason) => UnitStatus::Fail { reason },
        };
        (unit_status, bytes)
    }
}

/// Drive one worker's message loop to completion: `READY`, execute, `DONE`
/// (with an interleaved `LOG` if the unit produced output), repeat until
/// `EXIT`. Returns once the master signals shutdown.
pub fn run_worker<T: Transport>(transport: &T, id: NodeId, executor: &dyn UnitExecutor) -> Result<()> {
    loop {
        transport.send(MASTER, Message::Ready)?;
        match transport.recv(id)?.0 {
            Message::Assign(unit) => {
                info!(unit = unit.id, kind = unit.kind.as_str(), "executing unit");
                let (status, log_bytes) = executor.execute(&unit);
                if !log_bytes.is_empty() {
                    transport.send(MASTER, Message::Log { id: unit.id, bytes: log_bytes })?;
                }
                if !status.is_ok() {
                    warn!(unit = unit.id, "unit reported failure");
                }
                transport.send(MASTER, Message::Done { id: unit.id, status })?;
            }
            Message::Exit => {
                info!("received EXIT, shutting down");
                return Ok(());
            }
            other => {
                return Err(crate::error::DispatchError::Transport(format!(
                    "worker received unexpected message {other:?}"
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::{run_master, MasterConfig};
    use crate::transport::ChannelTransport;
    use crate::unit::WorkKind;
    use std::thread;

    struct AlwaysOk;
    impl UnitExecutor for AlwaysOk {
        fn execute(&self, _unit: &WorkUnit) -> (UnitStatus, Vec<u8>) {
            (UnitStatus::Ok, b"did the thing\n".to_vec())
        }
    }

    #[test]
    fn worker_loop_reports_logs_and_exits_cleanly() {
        let units = vec![WorkUnit::new(0, WorkKind::BuildPyramid, "noop", vec![])];
        let (master, workers) = ChannelTransport::new(1);
        let worker = workers.into_iter().next().unwrap();

        let handle = thread::spawn(move || {
            let id = worker.id();
            run_worker(&worker, id, &AlwaysOk).unwrap();
        });

        let report = run_master(&master, units, 1, MasterConfig::default()).unwrap();
        handle.join().unwrap();

        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.logs.get(&0).map(|v| v.as_slice()), Some(b"did the thing\n".as_slice()));
    }
}
