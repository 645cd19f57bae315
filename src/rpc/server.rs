//! Inbound RPC server.
//!
//! One listening socket, a non-blocking accept loop polling on a 1 s
//! quantum, and a small worker pool draining a mutex-guarded FIFO of
//! accepted sockets. Every connection carries exactly one request:
//! read until short-read/EOF, dispatch, reply, close. There is no
//! keep-alive by design.

use std::collections::VecDeque;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rmpv::Value;
use tracing::{debug, info, warn};

use crate::rpc::codec::{self, OP_CALL, OP_ERROR, OP_RETURN};

const ACCEPT_POLL_QUANTUM: Duration = Duration::from_secs(1);
const WORKER_COUNT: usize = 4;
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of dispatching one request.
pub enum DispatchOutcome {
    /// The handler's return value.
    Value(Value),
    /// No handler is registered for the function code.
    UnknownFunction,
    /// The handler failed with the given message.
    Failed(String),
}

/// The seam between the server and the node: maps a function code and
/// argument sequence to an outcome.
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(&self, fun_code: u64, args: Vec<Value>) -> DispatchOutcome;
}

struct QueueState {
    sockets: VecDeque<TcpStream>,
    closed: bool,
}

/// Mutex-guarded FIFO handing accepted sockets to the workers.
struct ClientQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl ClientQueue {
    fn new() -> Self {
        ClientQueue {
            state: Mutex::new(QueueState {
                sockets: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn push(&self, stream: TcpStream) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.sockets.push_back(stream);
        drop(state);
        self.available.notify_one();
    }

    /// Block until a socket is available; `None` once the queue is
    /// closed and drained.
    fn take(&self) -> Option<TcpStream> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(stream) = state.sockets.pop_front() {
                return Some(stream);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }
}

/// Shutdown handle for a running server.
#[derive(Clone)]
pub struct ServerHandle {
    stop: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Ask the accept loop to stop. Observed within one poll quantum.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// The TCP RPC server.
pub struct RpcTcpServer {
    listener: TcpListener,
    queue: Arc<ClientQueue>,
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl RpcTcpServer {
    /// Bind the listening socket and spawn the worker pool. Port 0
    /// binds an ephemeral port, see [`local_port`].
    ///
    /// [`local_port`]: RpcTcpServer::local_port
    pub fn bind(host: &str, port: u16, dispatcher: Arc<dyn Dispatcher>) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .map_err(|e| anyhow!("Failed to bind {}:{}: {}", host, port, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| anyhow!("Failed to set listener non-blocking: {}", e))?;

        let queue = Arc::new(ClientQueue::new());
        let mut workers = Vec::with_capacity(WORKER_COUNT);
        for i in 0..WORKER_COUNT {
            let queue = queue.clone();
            let dispatcher = dispatcher.clone();
            let worker = std::thread::Builder::new()
                .name(format!("rpc-worker-{i}"))
                .spawn(move || worker_loop(&queue, dispatcher.as_ref()))
                .map_err(|e| anyhow!("Failed to spawn RPC worker: {}", e))?;
            workers.push(worker);
        }

        Ok(RpcTcpServer {
            listener,
            queue,
            workers,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The actually bound port.
    pub fn local_port(&self) -> Result<u16> {
        Ok(self
            .listener
            .local_addr()
            .map_err(|e| anyhow!("Failed to read listener address: {}", e))?
            .port())
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stop: self.stop.clone(),
        }
    }

    /// Run the accept loop until [`ServerHandle::shutdown`], then close
    /// the queue and join the workers.
    pub fn serve(mut self) -> Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Listening on {}", addr);
        }

        while !self.stop.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    debug!("Connection from {}", peer_addr);
                    // the accepted socket must block; only the listener polls
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!("Failed to configure accepted socket: {}", e);
                        continue;
                    }
                    self.queue.push(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_QUANTUM);
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }

        self.queue.close();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        Ok(())
    }
}

fn worker_loop(queue: &ClientQueue, dispatcher: &dyn Dispatcher) {
    while let Some(stream) = queue.take() {
        if let Err(e) = handle_connection(stream, dispatcher) {
            debug!("Dropping connection: {}", e);
        }
    }
}

/// One request per connection. Network and framing errors before the
/// response is sent close the socket without a reply; handler errors
/// become ERROR responses.
fn handle_connection(mut stream: TcpStream, dispatcher: &dyn Dispatcher) -> Result<()> {
    stream
        .set_read_timeout(Some(IO_TIMEOUT))
        .map_err(|e| anyhow!("Failed to set read timeout: {}", e))?;
    stream
        .set_write_timeout(Some(IO_TIMEOUT))
        .map_err(|e| anyhow!("Failed to set write timeout: {}", e))?;

    let raw = codec::read_framed(&mut stream).map_err(|e| anyhow!("Read failed: {}", e))?;
    if raw.is_empty() {
        return Err(anyhow!("Peer closed the connection without a request"));
    }

    let (op_code, fun_code, body) =
        codec::decode_message(&raw).map_err(|e| anyhow!("Undecodable request: {}", e))?;
    if op_code != OP_CALL {
        return Err(anyhow!("Unexpected op code {} in request", op_code));
    }

    let response = match body {
        Value::Array(args) => match dispatcher.dispatch(fun_code, args) {
            DispatchOutcome::Value(value) => codec::encode_message(OP_RETURN, fun_code, value),
            DispatchOutcome::UnknownFunction => codec::encode_message(
                OP_ERROR,
                fun_code,
                Value::from(format!(
                    "Function {fun_code} not exists: no handler registered"
                )),
            ),
            DispatchOutcome::Failed(message) => codec::encode_message(
                OP_ERROR,
                fun_code,
                Value::from(format!("Function {fun_code}: {message}")),
            ),
        },
        _ => codec::encode_message(
            OP_ERROR,
            fun_code,
            Value::from(format!(
                "Function {fun_code}: arguments must be a sequence"
            )),
        ),
    }
    .map_err(|e| anyhow!("Failed to encode response: {}", e))?;

    stream
        .write_all(&response)
        .map_err(|e| anyhow!("Failed to send response: {}", e))?;
    // drop closes the socket, completing the one-shot framing
    Ok(())
}
