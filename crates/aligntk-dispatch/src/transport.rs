//! The point-to-point message-passing transport abstraction (Design Note 9):
//! `send(msg, dest)` / `recv() -> (msg, src)`. The master is always node
//! [`MASTER`]; workers are numbered from 0.
//!
//! Two implementations are provided: [`ChannelTransport`], an in-process
//! `std::sync::mpsc` hub used by tests to drive the dispatcher
//! deterministically (§8 scenario 6), and [`TcpTransport`], a length-prefixed
//! `bincode` stream used for real inter-process/inter-node dispatch.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::error::{DispatchError, Result};
use crate::message::Message;

pub type NodeId = usize;

/// Reserved node id for the master side of a [`Transport`].
pub const MASTER: NodeId = usize::MAX;

/// A two-method message-passing transport. `recv` blocks until a message
/// arrives or the transport is torn down, in which case it returns
/// [`DispatchError::Transport`] — the one error kind that is fatal to a
/// master or worker loop (§7).
pub trait Transport: Send + Sync {
    fn send(&self, dest: NodeId, msg: Message) -> Result<()>;
    /// Blocks for the next message addressed to `me`, returning it along
    /// with the sender's node id.
    fn recv(&self, me: NodeId) -> Result<(Message, NodeId)>;
}

struct ChannelHub {
    to_master: Mutex<Receiver<(Message, NodeId)>>,
    to_master_tx: Sender<(Message, NodeId)>,
    to_worker: Vec<(Sender<Message>, Mutex<Receiver<Message>>)>,
}

/// An in-process transport over `std::sync::mpsc` channels, one pair per
/// worker plus a shared worker-to-master channel. Cloning a handle is
/// cheap (it's a shared `Arc`); master and worker handles are distinct
/// types so a worker cannot accidentally call `send` with an arbitrary
/// destination other than the master.
pub struct ChannelTransport {
    hub: Arc<ChannelHub>,
}

impl ChannelTransport {
    /// Build a hub wired for `num_workers` workers, returning the master
    /// handle and one handle per worker (indices `0..num_workers`).
    pub fn new(num_workers: usize) -> (ChannelMasterTransport, Vec<ChannelWorkerTransport>) {
        let (to_master_tx, to_master_rx) = std::sync::mpsc::channel();
        let mut to_worker = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (tx, rx) = std::sync::mpsc::channel();
            to_worker.push((tx, Mutex::new(rx)));
        }
        let hub = Arc::new(ChannelHub {
            to_master: Mutex::new(to_master_rx),
            to_master_tx,
            to_worker,
        });
        let master = ChannelMasterTransport { hub: hub.clone() };
        let workers = (0..num_workers)
            .map(|id| ChannelWorkerTransport { hub: hub.clone(), id })
            .collect();
        (master, workers)
    }
}

#[derive(Clone)]
pub struct ChannelMasterTransport {
    hub: Arc<ChannelHub>,
}

impl Transport for ChannelMasterTransport {
    fn send(&self, dest: NodeId, msg: Message) -> Result<()> {
        self.hub
            .to_worker
            .get(dest)
            .ok_or_else(|| DispatchError::Transport(format!("no such worker node {dest}")))?
            .0
            .send(msg)
            .map_err(|_| DispatchError::Transport(format!("worker {dest} channel closed")))
    }

    fn recv(&self, _me: NodeId) -> Result<(Message, NodeId)> {
        self.hub
            .to_master
            .lock()
            .expect("channel hub mutex poisoned")
            .recv()
            .map_err(|_| DispatchError::Transport("all workers disconnected".into()))
    }
}

#[derive(Clone)]
pub struct ChannelWorkerTransport {
    hub: Arc<ChannelHub>,
    id: NodeId,
}

impl ChannelWorkerTransport {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl Transport for ChannelWorkerTransport {
    fn send(&self, _dest: NodeId, msg: Message) -> Result<()> {
        self.hub
            .to_master_tx
            .send((msg, self.id))
            .map_err(|_| DispatchError::Transport("master channel closed".into()))
    }

    fn recv(&self, me: NodeId) -> Result<(Message, NodeId)> {
        let (_, rx) = &self.hub.to_worker[me];
        rx.lock()
            .expect("channel hub mutex poisoned")
            .recv()
            .map(|msg| (msg, MASTER))
            .map_err(|_| DispatchError::Transport("master disconnected".into()))
    }
}

/// A length-prefixed `bincode` transport over one [`TcpStream`] per peer,
/// used when master and workers run as separate OS processes (possibly on
/// separate nodes). `dest`/`me` are ignored beyond validating there's
/// exactly one peer, since each socket already identifies its remote end.
pub struct TcpTransport {
    stream: Mutex<TcpStream>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream: Mutex::new(stream) })
    }
}

impl Transport for TcpTransport {
    fn send(&self, _dest: NodeId, msg: Message) -> Result<()> {
        let payload = bincode::serialize(&msg)
            .map_err(|e| DispatchError::Serialization(e.to_string()))?;
        let mut stream = self.stream.lock().expect("tcp transport mutex poisoned");
        stream.write_all(&(payload.len() as u32).to_le_bytes())?;
        stream.write_all(&payload)?;
        stream.flush()?;
        Ok(())
    }

    fn recv(&self, _me: NodeId) -> Result<(Message, NodeId)> {
        let mut stream = self.stream.lock().expect("tcp transport mutex poisoned");
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).map_err(|e| {
            DispatchError::Transport(format!("connection closed reading length: {e}"))
        })?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream
            .read_exact(&mut payload)
            .map_err(|e| DispatchError::Transport(format!("connection closed reading body: {e}")))?;
        let msg: Message = bincode::deserialize(&payload)
            .map_err(|e| DispatchError::Serialization(e.to_string()))?;
        Ok((msg, 0))
    }
}

/// The master side of a real TCP deployment: one accepted [`TcpStream`]
/// per worker, indexed by the worker's [`NodeId`]. A background reader
/// thread per connection deserializes incoming frames onto a shared
/// channel so `recv` can block for "the next message from any worker"
/// the same way [`ChannelMasterTransport::recv`] does.
pub struct TcpMasterTransport {
    streams: Vec<Mutex<TcpStream>>,
    inbox: Mutex<Receiver<(Message, NodeId)>>,
}

impl TcpMasterTransport {
    pub fn new(streams: Vec<TcpStream>) -> Result<Self> {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut guarded = Vec::with_capacity(streams.len());
        for (id, stream) in streams.into_iter().enumerate() {
            stream.set_nodelay(true)?;
            let mut reader = stream.try_clone()?;
            let tx = tx.clone();
            std::thread::spawn(move || loop {
                let mut len_buf = [0u8; 4];
                if reader.read_exact(&mut len_buf).is_err() {
                    break;
                }
                let len = u32::from_le_bytes(len_buf) as usize;
                let mut payload = vec![0u8; len];
                if reader.read_exact(&mut payload).is_err() {
                    break;
                }
                let Ok(msg) = bincode::deserialize::<Message>(&payload) else {
                    break;
                };
                if tx.send((msg, id)).is_err() {
                    break;
                }
            });
            guarded.push(Mutex::new(stream));
        }
        Ok(Self { streams: guarded, inbox: Mutex::new(rx) })
    }
}

impl Transport for TcpMasterTransport {
    fn send(&self, dest: NodeId, msg: Message) -> Result<()> {
        let payload = bincode::serialize(&msg)
            .map_err(|e| DispatchError::Serialization(e.to_string()))?;
        let stream = self
            .streams
            .get(dest)
            .ok_or_else(|| DispatchError::Transport(format!("no such worker node {dest}")))?;
        let mut stream = stream.lock().expect("tcp master transport mutex poisoned");
        stream.write_all(&(payload.len() as u32).to_le_bytes())?;
        stream.write_all(&payload)?;
        stream.flush()?;
        Ok(())
    }

    fn recv(&self, _me: NodeId) -> Result<(Message, NodeId)> {
        self.inbox
            .lock()
            .expect("tcp master transport mutex poisoned")
            .recv()
            .map_err(|_| DispatchError::Transport("all worker connections closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_transport_round_trips_ready_and_assign() {
        let (master, mut workers) = ChannelTransport::new(1);
        let worker = workers.remove(0);

        worker.send(MASTER, Message::Ready).unwrap();
        let (msg, from) = master.recv(MASTER).unwrap();
        assert!(matches!(msg, Message::Ready));
        assert_eq!(from, 0);

        master.send(0, Message::Exit).unwrap();
        let (msg, _) = worker.recv(worker.id()).unwrap();
        assert!(matches!(msg, Message::Exit));
    }
}
