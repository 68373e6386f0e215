//! `prun`: the distributed dispatcher CLI (§4.F, §6 "CLI surface"). The
//! `master` subcommand reads a task list, listens for worker connections,
//! and runs the dispatch loop to completion; the `worker` subcommand
//! connects to a master and executes whatever it is assigned as child
//! processes.

use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::info;

use aligntk_cli::common::init_tracing;
use aligntk_cli::taskfile::TaskList;
use aligntk_dispatch::error::{DispatchError, Result};
use aligntk_dispatch::exit_code;
use aligntk_dispatch::master::{run_master, MasterConfig};
use aligntk_dispatch::transport::{TcpMasterTransport, TcpTransport};
use aligntk_dispatch::worker::{run_worker, ProcessExecutor};

#[derive(Parser)]
#[command(name = "prun", version, about)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a task list and dispatch it to a fixed number of workers.
    Master {
        /// TOML task list (§3 "Work unit").
        #[arg(long)]
        tasks: PathBuf,
        /// Address to listen for worker connections on.
        #[arg(long, default_value = "0.0.0.0:9300")]
        listen: String,
        /// Number of worker connections to accept before dispatching.
        #[arg(long)]
        workers: usize,
        #[arg(long, default_value_t = MasterConfig::default().max_retries)]
        max_retries: usize,
    },
    /// Connect to a running master and execute assigned units.
    Worker {
        /// Master address, `host:port`.
        #[arg(long)]
        connect: String,
    },
}

fn run_master_command(tasks: &PathBuf, listen: &str, workers: usize, max_retries: usize) -> Result<i32> {
    let task_list = TaskList::load(tasks).map_err(|e| DispatchError::Config(e.to_string()))?;
    let units = task_list.into_work_units().map_err(|e| DispatchError::Config(e.to_string()))?;

    let listener = TcpListener::bind(listen)?;
    info!(listen, workers, "waiting for worker connections");

    let mut streams = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (stream, addr) = listener.accept()?;
        info!(peer = %addr, "worker connected");
        streams.push(stream);
    }

    let transport = TcpMasterTransport::new(streams)?;
    let report = run_master(&transport, units, workers, MasterConfig { max_retries })?;

    for outcome in report.failed() {
        tracing::error!(unit = outcome.id, retries = outcome.retries, "unit permanently failed");
    }
    info!(
        succeeded = report.succeeded().count(),
        failed = report.failed().count(),
        "dispatch run complete"
    );
    Ok(report.exit_code())
}

fn run_worker_command(connect: &str) -> Result<i32> {
    let stream = TcpStream::connect(connect)?;
    let transport = TcpTransport::new(stream)?;
    let executor = ProcessExecutor::default();
    run_worker(&transport, 0, &executor)?;
    Ok(exit_code::SUCCESS)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let outcome = match &args.command {
        Commands::Master { tasks, listen, workers, max_retries } => {
            run_master_command(tasks, listen, *workers, *max_retries)
        }
        Commands::Worker { connect } => run_worker_command(connect),
    };

    match outcome {
        Ok(code) => ExitCode::from(code as u8),
        Err(e @ DispatchError::Io(_)) => {
            eprintln!("{e}");
            ExitCode::from(exit_code::IO_ERROR as u8)
        }
        Err(e @ DispatchError::Config(_)) => {
            eprintln!("{e}");
            ExitCode::from(exit_code::CONFIG_ERROR as u8)
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(exit_code::UNIT_FAILURE as u8)
        }
    }
}
