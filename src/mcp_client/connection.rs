//! One JSON-RPC peer reached over a pair of byte streams.
//!
//! A connection runs two background tasks:
//! - a reader task that feeds stdout chunks through the [`LineFramer`] and
//!   forwards every parsed message to the dispatch task;
//! - a dispatch task that exclusively owns the pending-request table.
//!
//! Every mutation of the table (register, response, timeout, close) travels
//! through the dispatch task's channel, so each request settles exactly once.
//! Callers only write request lines and await their oneshot receiver.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::framer::LineFramer;
use super::lifecycle::ProcessHandle;
use super::types::{
    IncomingMessage, JsonRpcNotification, JsonRpcRequest, ResponsePayload, ServerInfo,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period between closing stdin and killing the process.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Recent stderr lines kept for diagnostics, newest last.
pub type StderrTail = Arc<StdMutex<VecDeque<String>>>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Responder = oneshot::Sender<Result<Value, McpError>>;

// ─── State ───────────────────────────────────────────────────────────────────

/// Connection lifecycle. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }
}

/// State visible to both the handle and the dispatch task.
struct Shared {
    state: AtomicU8,
    /// Fired once to ask the process supervisor to stop the child.
    terminate: StdMutex<Option<oneshot::Sender<Duration>>>,
    shutdown_timeout: Duration,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_connected(&self) {
        // Only Connecting -> Connected; a dead connection stays dead.
        let _ = self.state.compare_exchange(
            ConnectionState::Connecting.as_u8(),
            ConnectionState::Connected.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn mark_disconnected(&self) {
        self.state
            .store(ConnectionState::Disconnected.as_u8(), Ordering::Release);
    }

    fn fire_terminate(&self) {
        let sender = match self.terminate.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(tx) = sender {
            let _ = tx.send(self.shutdown_timeout);
        }
    }
}

// ─── Options ─────────────────────────────────────────────────────────────────

/// Per-connection tuning.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

// ─── Dispatch commands ───────────────────────────────────────────────────────

enum Command {
    Register {
        id: u64,
        method: String,
        timeout: Duration,
        responder: Responder,
    },
    Withdraw {
        id: u64,
    },
    Incoming(Value),
    Expire {
        id: u64,
    },
    Close {
        reason: String,
        done: Option<oneshot::Sender<()>>,
    },
    PendingCount(oneshot::Sender<usize>),
}

/// Why a line could not be written to stdin.
enum WriteFailure {
    /// Deadline passed while another write held stdin; nothing was sent.
    Queued,
    /// Deadline passed mid-write.
    Stalled,
    Broken(String),
}

/// Lets the process supervisor report an exit without owning the connection.
pub(crate) struct ExitNotifier {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ExitNotifier {
    pub(crate) fn notify_closed(&self, reason: String) {
        let _ = self.cmd_tx.send(Command::Close { reason, done: None });
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// A live (or terminated) JSON-RPC peer.
pub struct Connection {
    name: String,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    request_timeout_ms: AtomicU64,
    writer: Mutex<Option<BoxedWriter>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    reader_task: JoinHandle<()>,
    dispatch_task: JoinHandle<()>,
    stderr_task: StdMutex<Option<JoinHandle<()>>>,
    process: Mutex<Option<ProcessHandle>>,
    pid: Option<u32>,
    server_info: StdMutex<Option<ServerInfo>>,
    stderr_tail: StderrTail,
}

impl Connection {
    /// Wire a connection over an arbitrary reader/writer pair.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_io<R, W>(name: &str, reader: R, writer: W, options: ConnectionOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
            terminate: StdMutex::new(None),
            shutdown_timeout: options.shutdown_timeout,
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();

        let dispatcher = Dispatcher {
            server_name: name.to_string(),
            shared: shared.clone(),
            pending: HashMap::new(),
            cmd_tx: cmd_tx.downgrade(),
            closed_reason: None,
        };
        let dispatch_task = tokio::spawn(dispatcher.run(cmd_rx));
        let reader_task = tokio::spawn(read_loop(name.to_string(), reader, cmd_tx.clone()));

        shared.set_connected();
        tracing::debug!(server = %name, "connection established");

        Self {
            name: name.to_string(),
            shared,
            next_id: AtomicU64::new(1),
            request_timeout_ms: AtomicU64::new(duration_ms(options.request_timeout)),
            writer: Mutex::new(Some(Box::new(writer))),
            cmd_tx,
            reader_task,
            dispatch_task,
            stderr_task: StdMutex::new(None),
            process: Mutex::new(None),
            pid: None,
            server_info: StdMutex::new(None),
            stderr_tail: Arc::new(StdMutex::new(VecDeque::new())),
        }
    }

    // ─── Wiring (used while spawning) ────────────────────────────────────

    pub(crate) fn exit_notifier(&self) -> ExitNotifier {
        ExitNotifier {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub(crate) fn stderr_buffer(&self) -> StderrTail {
        self.stderr_tail.clone()
    }

    pub(crate) fn attach_process(
        &mut self,
        handle: ProcessHandle,
        terminate_tx: oneshot::Sender<Duration>,
    ) {
        self.pid = handle.pid();
        if let Ok(mut slot) = self.shared.terminate.lock() {
            *slot = Some(terminate_tx);
        }
        *self.process.get_mut() = Some(handle);
    }

    pub(crate) fn attach_stderr_task(&mut self, task: JoinHandle<()>) {
        if let Ok(slot) = self.stderr_task.get_mut() {
            *slot = Some(task);
        }
    }

    pub(crate) fn set_server_info(&self, info: Option<ServerInfo>) {
        if let Ok(mut slot) = self.server_info.lock() {
            *slot = info;
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// OS process id of the child, when this connection owns one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.lock().ok().and_then(|info| info.clone())
    }

    /// Recent stderr output joined into one string.
    pub fn stderr_tail(&self) -> String {
        match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(_) => String::new(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        self.request_timeout_ms
            .store(duration_ms(timeout), Ordering::Relaxed);
    }

    /// Number of requests still waiting for a response.
    pub async fn pending_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::PendingCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Send a request using the connection's default timeout.
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.send_with_timeout(method, params, self.request_timeout())
            .await
    }

    /// Send a request and wait for its response, a timeout, or close.
    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        if !self.is_alive() {
            return Err(self.closed_error("connection is not alive"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let mut line = serde_json::to_string(&request).map_err(|e| McpError::TransportError {
            server: self.name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        line.push('\n');

        // Register before writing so the response can never beat its entry.
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Register {
                id,
                method: method.to_string(),
                timeout,
                responder: tx,
            })
            .map_err(|_| self.closed_error("dispatch task stopped"))?;

        tracing::debug!(server = %self.name, id, method, "sending request");

        // The timer only covers the wait; the write shares the same deadline.
        let deadline = deadline_after(timeout);
        if let Err(failure) = self.write_line(&line, deadline).await {
            let _ = self.cmd_tx.send(Command::Withdraw { id });
            return Err(self.write_failed(failure, method, timeout));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.closed_error("connection dropped")),
        }
    }

    /// Send a notification (no id, no response).
    ///
    /// The write is bounded by the connection's request timeout.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if !self.is_alive() {
            return Err(self.closed_error("connection is not alive"));
        }

        let notification = JsonRpcNotification::new(method, params);
        let mut line =
            serde_json::to_string(&notification).map_err(|e| McpError::TransportError {
                server: self.name.clone(),
                reason: format!("failed to serialize notification: {e}"),
            })?;
        line.push('\n');

        let timeout = self.request_timeout();
        let deadline = deadline_after(timeout);
        self.write_line(&line, deadline)
            .await
            .map_err(|failure| self.write_failed(failure, method, timeout))
    }

    async fn write_line(
        &self,
        line: &str,
        deadline: tokio::time::Instant,
    ) -> Result<(), WriteFailure> {
        let Ok(mut guard) = tokio::time::timeout_at(deadline, self.writer.lock()).await else {
            return Err(WriteFailure::Queued);
        };
        let Some(writer) = guard.as_mut() else {
            return Err(WriteFailure::Broken("stdin already closed".to_string()));
        };

        let written = tokio::time::timeout_at(deadline, async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        })
        .await;

        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WriteFailure::Broken(format!("failed to write to stdin: {e}"))),
            Err(_) => {
                // Part of the line may be on the wire; nothing after it would frame.
                guard.take();
                Err(WriteFailure::Stalled)
            }
        }
    }

    /// Map a failed write to the caller's error, closing the connection when
    /// stdin can no longer be used.
    fn write_failed(&self, failure: WriteFailure, method: &str, timeout: Duration) -> McpError {
        let (reason, err) = match failure {
            WriteFailure::Queued => {
                tracing::warn!(
                    server = %self.name,
                    method,
                    "timed out waiting for stdin behind another write"
                );
                return self.timeout_error(method, timeout);
            }
            WriteFailure::Stalled => (
                "stdin write stalled (server not reading)".to_string(),
                self.timeout_error(method, timeout),
            ),
            WriteFailure::Broken(reason) => {
                let err = self.closed_error(&reason);
                (reason, err)
            }
        };

        tracing::warn!(
            server = %self.name,
            method,
            error = %reason,
            "stdin not writable, closing connection"
        );
        self.shared.mark_disconnected();
        let _ = self.cmd_tx.send(Command::Close { reason, done: None });
        err
    }

    fn timeout_error(&self, method: &str, timeout: Duration) -> McpError {
        McpError::Timeout {
            server: self.name.clone(),
            method: method.to_string(),
            timeout_ms: duration_ms(timeout),
        }
    }

    // ─── Close ───────────────────────────────────────────────────────────

    /// Close the connection. Idempotent.
    ///
    /// Rejects everything pending, closes stdin, then stops the child
    /// process (grace period, then kill) and waits for it to go away.
    pub async fn close(&self) {
        self.close_with_reason("connection closed").await;
    }

    async fn close_with_reason(&self, reason: &str) {
        let was_alive = self.is_alive();
        self.shared.mark_disconnected();

        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Close {
                reason: reason.to_string(),
                done: Some(done_tx),
            })
            .is_ok()
        {
            let _ = done_rx.await;
        }

        // A writer stuck on a full pipe must not block close forever.
        if let Ok(mut guard) =
            tokio::time::timeout(self.shared.shutdown_timeout, self.writer.lock()).await
        {
            if let Some(mut writer) = guard.take() {
                let _ = writer.shutdown().await;
            }
        }

        self.shared.fire_terminate();
        let process = self.process.lock().await.take();
        if let Some(process) = process {
            process.wait().await;
        }

        self.reader_task.abort();

        if was_alive {
            tracing::info!(server = %self.name, "connection closed");
        }
    }

    /// Wait (bounded) for the stderr logger to drain, then return the tail.
    pub(crate) async fn collect_stderr(&self, wait: Duration) -> String {
        let task = self.stderr_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = tokio::time::timeout(wait, task).await;
        }
        self.stderr_tail()
    }

    fn closed_error(&self, reason: &str) -> McpError {
        McpError::ConnectionClosed {
            server: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.mark_disconnected();
        self.reader_task.abort();
        self.dispatch_task.abort();
        if let Ok(mut slot) = self.stderr_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        // The supervisor owns the child with kill_on_drop set.
        if let Some(process) = self.process.get_mut().take() {
            process.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pid", &self.pid)
            .finish()
    }
}

// ─── Reader task ─────────────────────────────────────────────────────────────

async fn read_loop<R>(server_name: String, mut reader: R, cmd_tx: mpsc::UnboundedSender<Command>)
where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new(&server_name);
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                if let Some(value) = framer.finish() {
                    let _ = cmd_tx.send(Command::Incoming(value));
                }
                break "server stdout closed (process may have exited)".to_string();
            }
            Ok(n) => {
                for value in framer.push(&buf[..n]) {
                    if cmd_tx.send(Command::Incoming(value)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    tracing::debug!(server = %server_name, reason = %reason, "reader stopped");
    let _ = cmd_tx.send(Command::Close { reason, done: None });
}

// ─── Dispatch task ───────────────────────────────────────────────────────────

struct PendingRequest {
    method: String,
    responder: Responder,
    created_at: Instant,
    timeout: Duration,
    timeout_handle: JoinHandle<()>,
}

impl PendingRequest {
    fn settle(self, outcome: Result<Value, McpError>) {
        self.timeout_handle.abort();
        // The caller may have given up; nothing to do then.
        let _ = self.responder.send(outcome);
    }
}

struct Dispatcher {
    server_name: String,
    shared: Arc<Shared>,
    pending: HashMap<u64, PendingRequest>,
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
    closed_reason: Option<String>,
}

impl Dispatcher {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = cmd_rx.recv().await {
            match command {
                Command::Register {
                    id,
                    method,
                    timeout,
                    responder,
                } => self.register(id, method, timeout, responder),
                Command::Withdraw { id } => {
                    if let Some(entry) = self.pending.remove(&id) {
                        entry.timeout_handle.abort();
                    }
                }
                Command::Incoming(value) => self.dispatch(value),
                Command::Expire { id } => self.expire(id),
                Command::Close { reason, done } => {
                    self.close(reason);
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                Command::PendingCount(reply) => {
                    let _ = reply.send(self.pending.len());
                }
            }
        }
    }

    fn register(&mut self, id: u64, method: String, timeout: Duration, responder: Responder) {
        if let Some(reason) = &self.closed_reason {
            let _ = responder.send(Err(McpError::ConnectionClosed {
                server: self.server_name.clone(),
                reason: reason.clone(),
            }));
            return;
        }

        let cmd_tx = self.cmd_tx.clone();
        let timeout_handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(cmd_tx) = cmd_tx.upgrade() {
                let _ = cmd_tx.send(Command::Expire { id });
            }
        });

        let entry = PendingRequest {
            method,
            responder,
            created_at: Instant::now(),
            timeout,
            timeout_handle,
        };
        if let Some(previous) = self.pending.insert(id, entry) {
            // Ids come from a monotonic counter; this is unreachable in practice.
            previous.settle(Err(McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("request id {id} reused"),
            }));
        }
    }

    fn dispatch(&mut self, value: Value) {
        match IncomingMessage::classify(value) {
            IncomingMessage::Response { id, payload } => {
                let Some(entry) = self.pending.remove(&id) else {
                    tracing::debug!(
                        server = %self.server_name,
                        id,
                        "discarding response with no pending request"
                    );
                    return;
                };

                let elapsed_ms = duration_ms(entry.created_at.elapsed());
                tracing::debug!(
                    server = %self.server_name,
                    id,
                    method = %entry.method,
                    elapsed_ms,
                    "response received"
                );

                let outcome = match payload {
                    ResponsePayload::Success(result) => Ok(result),
                    ResponsePayload::Failure(err) => Err(McpError::ServerError {
                        code: err.code,
                        message: err.message,
                        data: err.data,
                    }),
                };
                entry.settle(outcome);
            }
            IncomingMessage::UnknownIdResponse { id } => {
                tracing::debug!(
                    server = %self.server_name,
                    id = %id,
                    "discarding response with non-integer id"
                );
            }
            IncomingMessage::ServerMessage { method, id } => {
                tracing::debug!(
                    server = %self.server_name,
                    method = %method,
                    has_id = id.is_some(),
                    "ignoring server-initiated message"
                );
            }
            IncomingMessage::Invalid => {
                tracing::warn!(
                    server = %self.server_name,
                    "discarding line that is not a JSON-RPC message"
                );
            }
        }
    }

    fn expire(&mut self, id: u64) {
        let Some(entry) = self.pending.remove(&id) else {
            return;
        };
        let timeout_ms = duration_ms(entry.timeout);
        tracing::warn!(
            server = %self.server_name,
            id,
            method = %entry.method,
            timeout_ms,
            "request timed out"
        );
        let err = McpError::Timeout {
            server: self.server_name.clone(),
            method: entry.method.clone(),
            timeout_ms,
        };
        entry.settle(Err(err));
    }

    fn close(&mut self, reason: String) {
        self.shared.mark_disconnected();
        self.shared.fire_terminate();

        if self.closed_reason.is_some() {
            return;
        }

        let drained: Vec<(u64, PendingRequest)> = self.pending.drain().collect();
        if drained.is_empty() {
            tracing::debug!(server = %self.server_name, reason = %reason, "connection disconnected");
        } else {
            tracing::warn!(
                server = %self.server_name,
                reason = %reason,
                pending = drained.len(),
                "connection disconnected, rejecting pending requests"
            );
        }
        for (_, entry) in drained {
            entry.settle(Err(McpError::ConnectionClosed {
                server: self.server_name.clone(),
                reason: reason.clone(),
            }));
        }
        self.closed_reason = Some(reason);
    }
}

fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    // Far enough out to never fire in practice.
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    /// The server side of an in-memory connection.
    struct Peer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn next_message(&mut self) -> Value {
            let line = self
                .lines
                .next_line()
                .await
                .expect("read from client")
                .expect("client closed stream");
            serde_json::from_str(&line).expect("client wrote valid json")
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn respond(&mut self, id: u64, result: Value) {
            let line = json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string();
            self.send_raw(&format!("{line}\n")).await;
        }
    }

    fn in_memory(request_timeout: Duration) -> (Arc<Connection>, Peer) {
        in_memory_with_capacity(request_timeout, 64 * 1024)
    }

    /// `capacity` bounds how much the client can write before the peer reads.
    fn in_memory_with_capacity(
        request_timeout: Duration,
        capacity: usize,
    ) -> (Arc<Connection>, Peer) {
        let (client_io, server_io) = tokio::io::duplex(capacity);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);

        let options = ConnectionOptions {
            request_timeout,
            shutdown_timeout: Duration::from_millis(200),
        };
        let connection = Connection::from_io("test", client_read, client_write, options);
        let peer = Peer {
            lines: BufReader::new(server_read).lines(),
            writer: server_write,
        };
        (Arc::new(connection), peer)
    }

    fn spawn_send(
        connection: &Arc<Connection>,
        method: &'static str,
    ) -> JoinHandle<Result<Value, McpError>> {
        let connection = connection.clone();
        tokio::spawn(async move { connection.send(method, Some(json!({}))).await })
    }

    #[tokio::test]
    async fn test_request_wire_format() {
        let (conn, mut peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);
        let call = spawn_send(&conn, "tools/list");

        let req = peer.next_message().await;
        assert_eq!(req["jsonrpc"], "2.0");
        assert_eq!(req["id"], 1);
        assert_eq!(req["method"], "tools/list");
        assert_eq!(req["params"], json!({}));

        peer.respond(1, json!({"tools": []})).await;
        assert_eq!(call.await.unwrap().unwrap(), json!({"tools": []}));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_ids_strictly_increasing() {
        let (conn, mut peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let call = spawn_send(&conn, "tools/list");
            let req = peer.next_message().await;
            let id = req["id"].as_u64().unwrap();
            peer.respond(id, json!(id)).await;
            assert_eq!(call.await.unwrap().unwrap(), json!(id));
            seen.push(id);
        }
        assert_eq!(seen, vec![1, 2, 3]);

        // Concurrent sends still get distinct ids.
        let calls: Vec<_> = (0..5).map(|_| spawn_send(&conn, "tools/list")).collect();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(peer.next_message().await["id"].as_u64().unwrap());
        }
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted, vec![4, 5, 6, 7, 8]);
        for id in ids {
            peer.respond(id, json!(id)).await;
        }
        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_out_of_order_responses_correlate_by_id() {
        let (conn, mut peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);

        let first = spawn_send(&conn, "tools/call");
        let first_id = peer.next_message().await["id"].as_u64().unwrap();
        let second = spawn_send(&conn, "tools/call");
        let second_id = peer.next_message().await["id"].as_u64().unwrap();

        peer.respond(second_id, json!("second")).await;
        peer.respond(first_id, json!("first")).await;

        assert_eq!(first.await.unwrap().unwrap(), json!("first"));
        assert_eq!(second.await.unwrap().unwrap(), json!("second"));
        assert_eq!(conn.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_unmatched_response_is_discarded() {
        let (conn, mut peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);

        let call = spawn_send(&conn, "tools/list");
        let id = peer.next_message().await["id"].as_u64().unwrap();

        peer.respond(999, json!("stray")).await;
        peer.send_raw("{\"jsonrpc\":\"2.0\",\"id\":\"abc\",\"result\":1}\n")
            .await;
        assert_eq!(conn.pending_count().await, 1);

        peer.respond(id, json!("mine")).await;
        assert_eq!(call.await.unwrap().unwrap(), json!("mine"));

        // A duplicate of an already-settled response is noise as well.
        peer.respond(id, json!("again")).await;
        assert_eq!(conn.pending_count().await, 0);
        assert!(conn.is_alive());
    }

    #[tokio::test]
    async fn test_malformed_line_then_valid_line() {
        let (conn, mut peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);

        let call = spawn_send(&conn, "tools/list");
        let id = peer.next_message().await["id"].as_u64().unwrap();

        peer.send_raw("this is {not json\n").await;
        peer.respond(id, json!({"ok": true})).await;

        assert_eq!(call.await.unwrap().unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_response_split_across_writes() {
        let (conn, mut peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);

        let call = spawn_send(&conn, "tools/list");
        let id = peer.next_message().await["id"].as_u64().unwrap();

        peer.send_raw(&format!("{{\"jsonrpc\":\"2.0\",\"id\":{id},")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        peer.send_raw("\"result\":[1,2]}\n").await;

        assert_eq!(call.await.unwrap().unwrap(), json!([1, 2]));
    }

    #[tokio::test]
    async fn test_remote_error_is_propagated() {
        let (conn, mut peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);

        let call = spawn_send(&conn, "tools/call");
        let id = peer.next_message().await["id"].as_u64().unwrap();
        peer.send_raw(&format!(
            "{{\"jsonrpc\":\"2.0\",\"id\":{id},\"error\":{{\"code\":-32601,\"message\":\"Method not found\"}}}}\n"
        ))
        .await;

        match call.await.unwrap() {
            Err(McpError::ServerError { code, message, .. }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }

        let call = spawn_send(&conn, "tools/call");
        let id = peer.next_message().await["id"].as_u64().unwrap();
        peer.send_raw(&format!("{{\"jsonrpc\":\"2.0\",\"id\":{id},\"error\":{{}}}}\n"))
            .await;
        match call.await.unwrap() {
            Err(McpError::ServerError { message, .. }) => assert_eq!(message, "MCP error"),
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_response_without_result_or_error_resolves_null() {
        let (conn, mut peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);

        let call = spawn_send(&conn, "tools/list");
        let id = peer.next_message().await["id"].as_u64().unwrap();
        peer.send_raw(&format!("{{\"jsonrpc\":\"2.0\",\"id\":{id}}}\n")).await;

        assert_eq!(call.await.unwrap().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_timeout_rejects_only_that_request() {
        let (conn, mut peer) = in_memory(Duration::from_millis(50));

        let slow = spawn_send(&conn, "tools/call");
        let slow_id = peer.next_message().await["id"].as_u64().unwrap();

        let err = slow.await.unwrap().unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err:?}");
        assert_eq!(conn.pending_count().await, 0);
        assert!(conn.is_alive());

        // The late answer finds no entry and is dropped.
        peer.respond(slow_id, json!("late")).await;

        let next = spawn_send(&conn, "tools/list");
        let id = peer.next_message().await["id"].as_u64().unwrap();
        assert!(id > slow_id);
        peer.respond(id, json!("fresh")).await;
        assert_eq!(next.await.unwrap().unwrap(), json!("fresh"));
    }

    #[tokio::test]
    async fn test_timeout_leaves_other_pending_requests_alone() {
        let (conn, mut peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);

        let conn2 = conn.clone();
        let short = tokio::spawn(async move {
            conn2
                .send_with_timeout("tools/call", Some(json!({})), Duration::from_millis(50))
                .await
        });
        let short_id = peer.next_message().await["id"].as_u64().unwrap();
        let long = spawn_send(&conn, "resources/read");
        let long_id = peer.next_message().await["id"].as_u64().unwrap();

        let err = short.await.unwrap().unwrap_err();
        assert!(err.is_timeout(), "got {err:?}");
        assert_eq!(conn.pending_count().await, 1);

        peer.respond(long_id, json!({"contents": []})).await;
        assert_eq!(long.await.unwrap().unwrap(), json!({"contents": []}));
        assert_eq!(conn.pending_count().await, 0);

        // The expired request's late answer changes nothing.
        peer.respond(short_id, json!("late")).await;
        assert_eq!(conn.pending_count().await, 0);
        assert!(conn.is_alive());
    }

    #[tokio::test]
    async fn test_send_times_out_when_peer_stops_reading() {
        let (conn, _peer) = in_memory_with_capacity(Duration::from_millis(100), 64);

        let blob = "x".repeat(4096);
        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            conn.send("tools/call", Some(json!({ "blob": blob }))),
        )
        .await
        .expect("send must not outlive its request timeout");

        match outcome {
            Err(McpError::Timeout { method, timeout_ms, .. }) => {
                assert_eq!(method, "tools/call");
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        // A half-written line leaves stdin unusable.
        assert!(!conn.is_alive());
        assert_eq!(conn.pending_count().await, 0);

        let next = tokio::time::timeout(Duration::from_secs(1), conn.send("tools/list", None))
            .await
            .expect("later sends fail fast");
        assert!(matches!(next, Err(McpError::ConnectionClosed { .. })));
    }

    #[tokio::test]
    async fn test_queued_send_times_out_behind_stalled_write() {
        let (conn, _peer) = in_memory_with_capacity(Duration::from_secs(1), 64);

        let conn2 = conn.clone();
        let blocked = tokio::spawn(async move {
            conn2
                .send("tools/call", Some(json!({ "blob": "x".repeat(4096) })))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        let queued = conn
            .send_with_timeout("tools/list", None, Duration::from_millis(100))
            .await;
        assert!(matches!(queued, Err(McpError::Timeout { .. })), "got {queued:?}");
        assert!(started.elapsed() < Duration::from_millis(900));

        let err = blocked.await.unwrap().unwrap_err();
        assert!(err.is_timeout(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_send_with_timeout_overrides_default() {
        let (conn, mut peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);

        let conn2 = conn.clone();
        let call = tokio::spawn(async move {
            conn2
                .send_with_timeout("tools/call", None, Duration::from_millis(30))
                .await
        });
        let req = peer.next_message().await;
        assert!(req.get("params").is_none());

        match call.await.unwrap() {
            Err(McpError::Timeout { method, .. }) => assert_eq!(method, "tools/call"),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_rejects_pending_and_is_idempotent() {
        let (conn, mut peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);

        let a = spawn_send(&conn, "tools/call");
        let b = spawn_send(&conn, "tools/call");
        peer.next_message().await;
        peer.next_message().await;

        conn.close().await;
        conn.close().await;

        for call in [a, b] {
            match call.await.unwrap() {
                Err(McpError::ConnectionClosed { reason, .. }) => {
                    assert_eq!(reason, "connection closed")
                }
                other => panic!("expected ConnectionClosed, got {other:?}"),
            }
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.pending_count().await, 0);

        let err = conn.send("tools/list", None).await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_peer_eof_drains_pending() {
        let (conn, mut peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);

        let call = spawn_send(&conn, "tools/call");
        peer.next_message().await;
        drop(peer);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed { .. }), "got {err:?}");
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn test_server_notifications_are_ignored() {
        let (conn, mut peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);

        let call = spawn_send(&conn, "tools/call");
        let id = peer.next_message().await["id"].as_u64().unwrap();
        peer.send_raw("{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n")
            .await;
        peer.send_raw(&format!(
            "{{\"jsonrpc\":\"2.0\",\"id\":{id},\"method\":\"sampling/createMessage\"}}\n"
        ))
        .await;
        assert_eq!(conn.pending_count().await, 1);

        peer.respond(id, json!("done")).await;
        assert_eq!(call.await.unwrap().unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_notify_has_no_id() {
        let (conn, mut peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);

        conn.notify("notifications/initialized", None).await.unwrap();
        let msg = peer.next_message().await;
        assert_eq!(msg["method"], "notifications/initialized");
        assert!(msg.get("id").is_none());
        assert_eq!(conn.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_set_request_timeout() {
        let (conn, _peer) = in_memory(DEFAULT_REQUEST_TIMEOUT);
        conn.set_request_timeout(Duration::from_millis(1500));
        assert_eq!(conn.request_timeout(), Duration::from_millis(1500));
    }
}
