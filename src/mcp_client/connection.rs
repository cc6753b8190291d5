//! Server connection — one MCP server subprocess and its JSON-RPC session.
//!
//! Each connection exclusively owns its child process and three background
//! tasks:
//! - a writer task that owns stdin and writes queued lines in order
//! - a reader task that consumes stdout and resolves pending requests by id
//! - a stderr drain that logs server diagnostics and keeps a short tail
//!
//! Any number of requests may be in flight at once; each caller waits on its
//! own oneshot channel and is woken by its response, its timeout, or a
//! transport failure.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{decode_line, encode_reply, encode_request, extract_result};
use super::types::{
    error_codes, methods, ClientInfo, InboundMessage, InitializeResult, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, McpServersConfig, McpToolDefinition,
    ServerConfig, ServerRequest, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Number of stderr lines retained for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Upper bound on the stderr excerpt appended to error messages.
const STDERR_EXCERPT_CHARS: usize = 2000;

/// How long to wait for the stderr drain to finish after the child exits.
const STDERR_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

/// Guard against servers that return the same `nextCursor` forever.
const MAX_TOOL_PAGES: usize = 64;

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unstarted,
    Starting,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Unstarted => "unstarted",
            ConnectionState::Starting => "starting",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Timeouts and identity used by a connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Deadline for the `initialize` round trip.
    pub handshake_timeout: Duration,
    /// Default deadline for `tools/list` and `tools/call`.
    pub call_timeout: Duration,
    /// Grace period between closing stdin and force-killing the child.
    pub shutdown_grace: Duration,
    pub client_info: ClientInfo,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            client_info: ClientInfo::default(),
        }
    }
}

impl ConnectionOptions {
    /// Take the timeouts from a loaded configuration file.
    pub fn from_config(config: &McpServersConfig) -> Self {
        Self {
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
            client_info: ClientInfo::default(),
        }
    }
}

type Responder = oneshot::Sender<Result<JsonRpcResponse, McpError>>;

/// A request that has been sent and is waiting for its response.
struct PendingRequest {
    method: String,
    issued_at: Instant,
    responder: Responder,
}

/// State and pending table share one lock so that a transport failure can
/// never miss a request registered concurrently.
struct Inner {
    state: ConnectionState,
    failure: Option<String>,
    ready_at: Option<DateTime<Utc>>,
    pending: HashMap<u64, PendingRequest>,
}

/// Everything the background tasks need to reach.
struct Shared {
    name: String,
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    stderr_tail: Mutex<VecDeque<String>>,
    /// The server process, while one is attached.
    child: Mutex<Option<Child>>,
}

/// I/O resources owned by a started connection.
struct Io {
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    /// Hand a response to its waiter. Responses for unknown or expired ids
    /// are dropped.
    fn resolve(&self, response: JsonRpcResponse) {
        let pending = lock(&self.inner).pending.remove(&response.id);
        match pending {
            Some(pending) => {
                tracing::debug!(
                    server = %self.name,
                    id = response.id,
                    method = %pending.method,
                    elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
                    "response received"
                );
                let _ = pending.responder.send(Ok(response));
            }
            None => {
                tracing::debug!(
                    server = %self.name,
                    id = response.id,
                    "discarding response with no pending request (late or unknown id)"
                );
            }
        }
    }

    /// Move to `Failed` and wake every waiter with the error.
    ///
    /// A connection that fails while `Ready` also loses its process; nothing
    /// reads its output any more. During `Starting` the failed start does the
    /// cleanup, and during `Closing`/`Closed` the state is left alone.
    fn fail(&self, error: McpError) {
        let (drained, was_ready) = {
            let mut inner = lock(&self.inner);
            let was_ready = inner.state == ConnectionState::Ready;
            if !matches!(
                inner.state,
                ConnectionState::Closing | ConnectionState::Closed
            ) {
                inner.state = ConnectionState::Failed;
                inner.failure = Some(error.to_string());
            }
            (std::mem::take(&mut inner.pending), was_ready)
        };

        if was_ready {
            self.kill_child();
        }

        for (_, pending) in drained {
            let _ = pending.responder.send(Err(error.clone()));
        }
    }

    /// Kill and reap the process in the background.
    fn kill_child(&self) {
        let Some(mut child) = lock(&self.child).take() else {
            return;
        };
        let name = self.name.clone();
        tokio::spawn(async move {
            match child.kill().await {
                Ok(()) => tracing::warn!(server = %name, "killed MCP server after transport failure"),
                Err(e) => tracing::error!(
                    server = %name,
                    error = %e,
                    "failed to kill MCP server after transport failure"
                ),
            }
        });
    }

    fn push_stderr(&self, line: String) {
        let mut tail = lock(&self.stderr_tail);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    fn stderr_excerpt(&self) -> String {
        let tail = lock(&self.stderr_tail);
        let joined = tail.iter().map(String::as_str).collect::<Vec<_>>().join("; ");
        truncate_chars(joined.trim(), STDERR_EXCERPT_CHARS)
    }
}

/// Removes a pending entry when the waiting future finishes or is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.shared.inner).pending.remove(&self.id);
    }
}

/// Why `start()` failed, before the stderr excerpt is attached.
enum StartFailure {
    Launch(String),
    Handshake(String),
}

// ─── ServerConnection ────────────────────────────────────────────────────────

/// One MCP server process and its JSON-RPC session.
pub struct ServerConnection {
    config: ServerConfig,
    options: ConnectionOptions,
    shared: Arc<Shared>,
    io: Mutex<Option<Io>>,
}

impl ServerConnection {
    /// Create an unstarted connection for a server descriptor.
    pub fn new(name: &str, config: ServerConfig, options: ConnectionOptions) -> Self {
        Self {
            config,
            options,
            shared: Arc::new(Shared {
                name: name.to_string(),
                inner: Mutex::new(Inner {
                    state: ConnectionState::Unstarted,
                    failure: None,
                    ready_at: None,
                    pending: HashMap::new(),
                }),
                next_id: AtomicU64::new(1),
                stderr_tail: Mutex::new(VecDeque::new()),
                child: Mutex::new(None),
            }),
            io: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.inner).state
    }

    /// Reason recorded when the connection entered `Failed`.
    pub fn failure(&self) -> Option<String> {
        lock(&self.shared.inner).failure.clone()
    }

    /// When the handshake completed.
    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.shared.inner).ready_at
    }

    /// OS process id of the server, while it is running.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.shared.child).as_ref().and_then(Child::id)
    }

    /// Number of requests currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.inner).pending.len()
    }

    // ─── Startup ─────────────────────────────────────────────────────────

    /// Launch the server process and perform the initialization handshake.
    ///
    /// On any failure the process and its I/O tasks are released and the
    /// connection is left in `Failed`.
    pub async fn start(&self) -> Result<(), McpError> {
        self.begin_start()?;

        tracing::info!(
            server = %self.name(),
            command = %self.config.command,
            args = ?self.config.args,
            "starting MCP server"
        );

        let mut child = match self.build_command().spawn() {
            Ok(child) => child,
            Err(e) => {
                return Err(self
                    .abort_start(StartFailure::Launch(format!(
                        "could not spawn '{}': {e}",
                        self.config.command
                    )))
                    .await)
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            // kill_on_drop reaps the child
            drop(child);
            return Err(self
                .abort_start(StartFailure::Launch("failed to capture stdio pipes".into()))
                .await);
        };
        let stderr = child.stderr.take();

        self.attach(stdout, stdin, stderr, Some(child));
        self.finish_start().await
    }

    /// Run the handshake over arbitrary streams instead of a child process.
    #[cfg(test)]
    pub(crate) async fn start_with_io<R, W>(&self, reader: R, writer: W) -> Result<(), McpError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.begin_start()?;
        self.attach(reader, writer, None, None);
        self.finish_start().await
    }

    fn begin_start(&self) -> Result<(), McpError> {
        let mut inner = lock(&self.shared.inner);
        if inner.state != ConnectionState::Unstarted {
            return Err(McpError::NotReady {
                name: self.name().to_string(),
                state: inner.state,
            });
        }
        inner.state = ConnectionState::Starting;
        Ok(())
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &self.config.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    fn attach<R, W>(
        &self,
        reader: R,
        writer: W,
        stderr: Option<ChildStderr>,
        child: Option<Child>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, rx) = mpsc::unbounded_channel();
        let writer = spawn_writer(self.shared.clone(), writer, rx);
        let reader = spawn_reader(self.shared.clone(), reader, outbound.clone());
        let stderr = stderr.map(|s| spawn_stderr_drain(self.shared.clone(), s));

        *lock(&self.shared.child) = child;
        *lock(&self.io) = Some(Io {
            outbound,
            reader,
            writer,
            stderr,
        });
    }

    async fn finish_start(&self) -> Result<(), McpError> {
        let init = match self.handshake().await {
            Ok(init) => init,
            Err(e) => return Err(self.abort_start(classify_start_error(e)).await),
        };

        let lost = {
            let mut inner = lock(&self.shared.inner);
            if inner.state == ConnectionState::Starting {
                inner.state = ConnectionState::Ready;
                inner.ready_at = Some(Utc::now());
                None
            } else {
                Some(inner.failure.clone().unwrap_or_default())
            }
        };
        if let Some(reason) = lost {
            return Err(self
                .abort_start(StartFailure::Launch(format!(
                    "server failed right after handshake: {reason}"
                )))
                .await);
        }

        let server_info = init.server_info.as_ref();
        tracing::info!(
            server = %self.name(),
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            server_name = server_info.and_then(|s| s.name.as_deref()).unwrap_or("unknown"),
            server_version = server_info.and_then(|s| s.version.as_deref()).unwrap_or("unknown"),
            "MCP server initialized"
        );
        Ok(())
    }

    /// `initialize` request followed by the `initialized` notification.
    async fn handshake(&self) -> Result<InitializeResult, McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": self.options.client_info,
        });

        let response = self
            .request(
                methods::INITIALIZE,
                Some(params),
                self.options.handshake_timeout,
                ConnectionState::Starting,
            )
            .await?;
        let result = extract_result(self.name(), methods::INITIALIZE, response)?;

        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                name: self.name().to_string(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        self.notify(
            methods::INITIALIZED,
            Some(serde_json::json!({})),
            ConnectionState::Starting,
        )?;

        Ok(init)
    }

    /// Release everything acquired so far and record the failure.
    async fn abort_start(&self, failure: StartFailure) -> McpError {
        let exit = match self.release().await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(server = %self.name(), error = %e, "cleanup after failed start");
                None
            }
        };

        let stderr = self.shared.stderr_excerpt();
        if !stderr.is_empty() {
            tracing::warn!(
                server = %self.name(),
                stderr = %stderr,
                "server stderr captured on failure"
            );
        }

        let error = match failure {
            StartFailure::Launch(reason) => {
                let status = exit.map(|s| format!(" ({s})")).unwrap_or_default();
                McpError::SpawnFailed {
                    name: self.name().to_string(),
                    reason: format!("{reason}{status}{}", format_stderr_suffix(&stderr)),
                }
            }
            StartFailure::Handshake(reason) => McpError::InitFailed {
                name: self.name().to_string(),
                reason: format!("{reason}{}", format_stderr_suffix(&stderr)),
            },
        };

        {
            let mut inner = lock(&self.shared.inner);
            inner.state = ConnectionState::Failed;
            inner.failure = Some(error.to_string());
        }
        tracing::error!(server = %self.name(), error = %error, "failed to start MCP server");
        error
    }

    // ─── Operations ──────────────────────────────────────────────────────

    /// Fetch the server's tool catalog, following pagination cursors.
    pub async fn discover_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(c) => serde_json::json!({ "cursor": c }),
                None => serde_json::json!({}),
            };
            let response = self
                .request(
                    methods::TOOLS_LIST,
                    Some(params),
                    self.options.call_timeout,
                    ConnectionState::Ready,
                )
                .await
                .map_err(escalate_framing)?;
            let result = extract_result(self.name(), methods::TOOLS_LIST, response)?;

            let page: ListToolsResult =
                serde_json::from_value(result).map_err(|e| McpError::ServerError {
                    server: self.name().to_string(),
                    method: methods::TOOLS_LIST.to_string(),
                    code: error_codes::INTERNAL_ERROR,
                    message: format!("malformed tools/list result: {e}"),
                    data: None,
                })?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }
        }

        tracing::debug!(server = %self.name(), count = tools.len(), "discovered tools");
        Ok(tools)
    }

    /// Call a tool with the default per-call timeout.
    pub async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value, McpError> {
        self.invoke_with_timeout(tool, arguments, self.options.call_timeout)
            .await
    }

    /// Call a tool, waiting at most `timeout` for its response.
    ///
    /// A timeout leaves the connection `Ready`; the late response is dropped.
    pub async fn invoke_with_timeout(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        tracing::info!(server = %self.name(), tool, "calling tool");
        tracing::debug!(server = %self.name(), tool, arguments = %arguments, "tool arguments");

        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments,
        });
        let response = self
            .request(methods::TOOLS_CALL, Some(params), timeout, ConnectionState::Ready)
            .await
            .map_err(escalate_framing)?;

        let result = extract_result(self.name(), methods::TOOLS_CALL, response);
        if let Err(e) = &result {
            tracing::warn!(server = %self.name(), tool, error = %e, "tool call failed");
        }
        result
    }

    // ─── Shutdown ────────────────────────────────────────────────────────

    /// Close stdin, wait out the grace period, then force-kill.
    ///
    /// Closing an already-closed connection is a no-op.
    pub async fn close(&self) -> Result<(), McpError> {
        let drained = {
            let mut inner = lock(&self.shared.inner);
            match inner.state {
                ConnectionState::Closed => return Ok(()),
                ConnectionState::Unstarted => {
                    inner.state = ConnectionState::Closed;
                    return Ok(());
                }
                _ => {}
            }
            inner.state = ConnectionState::Closing;
            std::mem::take(&mut inner.pending)
        };

        tracing::info!(server = %self.name(), "stopping MCP server");
        for (_, pending) in drained {
            let _ = pending.responder.send(Err(McpError::TransportError {
                server: self.name().to_string(),
                reason: format!("connection closed while '{}' was pending", pending.method),
            }));
        }

        let result = self.release().await.map(|_| ());
        lock(&self.shared.inner).state = ConnectionState::Closed;
        result
    }

    /// Tear down the I/O tasks and the child process.
    ///
    /// Returns the child's exit status when one was observed.
    async fn release(&self) -> Result<Option<ExitStatus>, McpError> {
        let Some(io) = lock(&self.io).take() else {
            return Ok(None);
        };
        let Io {
            outbound,
            reader,
            mut writer,
            stderr,
        } = io;
        let child = lock(&self.shared.child).take();

        // The reader holds a sender clone; it must go before stdin can close.
        reader.abort();
        drop(outbound);

        let deadline = tokio::time::Instant::now() + self.options.shutdown_grace;
        if tokio::time::timeout_at(deadline, &mut writer).await.is_err() {
            writer.abort();
        }

        let result = match child {
            Some(child) => terminate(self.name(), child, deadline).await.map(Some),
            None => Ok(None),
        };

        if let Some(mut stderr) = stderr {
            if tokio::time::timeout(STDERR_FLUSH_TIMEOUT, &mut stderr)
                .await
                .is_err()
            {
                stderr.abort();
            }
        }

        result
    }

    // ─── Request plumbing ────────────────────────────────────────────────

    /// Send a request and wait for the response with the matching id.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        required: ConnectionState,
    ) -> Result<JsonRpcResponse, McpError> {
        let outbound = self.outbound()?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode_request(self.name(), &JsonRpcRequest::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = lock(&self.shared.inner);
            if inner.state != required {
                return Err(self.state_error(&inner));
            }
            inner.pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    issued_at: Instant::now(),
                    responder: tx,
                },
            );
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        tracing::debug!(server = %self.name(), id, method, ">> request");
        if outbound.send(line).is_err() {
            return Err(McpError::TransportError {
                server: self.name().to_string(),
                reason: "writer task has stopped".into(),
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::TransportError {
                server: self.name().to_string(),
                reason: format!("request {id} ('{method}') was dropped by the connection"),
            }),
            Err(_) => {
                tracing::warn!(
                    server = %self.name(),
                    id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(McpError::Timeout {
                    server: self.name().to_string(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification (no response expected).
    fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        required: ConnectionState,
    ) -> Result<(), McpError> {
        {
            let inner = lock(&self.shared.inner);
            if inner.state != required {
                return Err(self.state_error(&inner));
            }
        }
        let line = encode_request(self.name(), &JsonRpcRequest::notification(method, params))?;
        tracing::debug!(server = %self.name(), method, ">> notification");
        self.outbound()?
            .send(line)
            .map_err(|_| McpError::TransportError {
                server: self.name().to_string(),
                reason: "writer task has stopped".into(),
            })
    }

    fn outbound(&self) -> Result<mpsc::UnboundedSender<String>, McpError> {
        if let Some(io) = lock(&self.io).as_ref() {
            return Ok(io.outbound.clone());
        }
        let inner = lock(&self.shared.inner);
        Err(self.state_error(&inner))
    }

    fn state_error(&self, inner: &Inner) -> McpError {
        match (inner.state, &inner.failure) {
            (ConnectionState::Failed, Some(reason)) => McpError::TransportError {
                server: self.name().to_string(),
                reason: format!("connection failed: {reason}"),
            },
            (state, _) => McpError::NotReady {
                name: self.name().to_string(),
                state,
            },
        }
    }
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("command", &self.config.command)
            .finish()
    }
}

// ─── Background tasks ────────────────────────────────────────────────────────

fn spawn_writer<W>(
    shared: Arc<Shared>,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_line(&mut writer, &line).await {
                tracing::error!(server = %shared.name, error = %e, "failed to write to server stdin");
                shared.fail(McpError::TransportError {
                    server: shared.name.clone(),
                    reason: format!("failed to write to stdin: {e}"),
                });
                return;
            }
        }
        let _ = writer.shutdown().await;
    })
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

fn spawn_reader<R>(
    shared: Arc<Shared>,
    reader: R,
    outbound: mpsc::UnboundedSender<String>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    shared.fail(McpError::TransportError {
                        server: shared.name.clone(),
                        reason: "server closed its output stream".into(),
                    });
                    return;
                }
                Err(e) => {
                    shared.fail(McpError::TransportError {
                        server: shared.name.clone(),
                        reason: format!("failed to read from stdout: {e}"),
                    });
                    return;
                }
            };

            match decode_line(&shared.name, &line) {
                Ok(None) => {}
                Ok(Some(InboundMessage::Response(response))) => shared.resolve(response),
                Ok(Some(InboundMessage::Notification { method, .. })) => {
                    tracing::debug!(server = %shared.name, method = %method, "<< notification");
                }
                Ok(Some(InboundMessage::Unaddressed(error))) => {
                    tracing::warn!(
                        server = %shared.name,
                        code = error.code,
                        message = %error.message,
                        "server reported an error without a request id; discarding"
                    );
                }
                Ok(Some(InboundMessage::Request(request))) => {
                    let _ = outbound.send(answer_server_request(&shared.name, &request));
                }
                Err(e) => {
                    tracing::error!(server = %shared.name, error = %e, "unparseable line from server");
                    shared.fail(e);
                    return;
                }
            }
        }
    })
}

fn spawn_stderr_drain(shared: Arc<Shared>, stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            tracing::debug!(server = %shared.name, "stderr: {line}");
            shared.push_stderr(line);
        }
    })
}

/// The client answers `ping` and refuses every other server-initiated request.
fn answer_server_request(server: &str, request: &ServerRequest) -> String {
    if request.method == methods::PING {
        return encode_reply(&request.id, Ok(serde_json::json!({})));
    }
    tracing::debug!(server, method = %request.method, "refusing server request");
    encode_reply(
        &request.id,
        Err(JsonRpcError {
            code: error_codes::METHOD_NOT_FOUND,
            message: format!("client does not support '{}'", request.method),
            data: None,
        }),
    )
}

/// Wait for the child to exit until `deadline`, then force-kill it.
async fn terminate(
    server: &str,
    mut child: Child,
    deadline: tokio::time::Instant,
) -> Result<ExitStatus, McpError> {
    match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(server, %status, "server exited");
            Ok(status)
        }
        Ok(Err(e)) => {
            let _ = child.start_kill();
            Err(McpError::TransportError {
                server: server.to_string(),
                reason: format!("failed to wait for process exit: {e}"),
            })
        }
        Err(_) => {
            tracing::warn!(server, "force killing MCP server");
            child.kill().await.map_err(|e| McpError::TransportError {
                server: server.to_string(),
                reason: format!("failed to kill process: {e}"),
            })?;
            child.wait().await.map_err(|e| McpError::TransportError {
                server: server.to_string(),
                reason: format!("failed to reap process: {e}"),
            })
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn classify_start_error(error: McpError) -> StartFailure {
    match error {
        McpError::Timeout { timeout_ms, .. } => {
            StartFailure::Handshake(format!("initialization timed out after {timeout_ms}ms"))
        }
        McpError::ServerError { code, message, .. } => {
            StartFailure::Handshake(format!("server rejected initialize [{code}]: {message}"))
        }
        McpError::Framing { reason, .. } => {
            StartFailure::Handshake(format!("malformed initialize response: {reason}"))
        }
        McpError::InitFailed { reason, .. } => StartFailure::Handshake(reason),
        McpError::TransportError { reason, .. } => StartFailure::Launch(format!(
            "server exited before handshake completed: {reason}"
        )),
        other => StartFailure::Launch(other.to_string()),
    }
}

/// Callers see framing corruption as a transport failure.
fn escalate_framing(error: McpError) -> McpError {
    match error {
        McpError::Framing { server, reason } => McpError::TransportError {
            server,
            reason: format!("framing error: {reason}"),
        },
        other => other,
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {stderr}")
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...(truncated)", &s[..idx]),
        None => s.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    /// What the scripted server does in response to one client message.
    enum Out {
        Line(String),
        Close,
    }

    fn reply(id: &Value, result: Value) -> Out {
        Out::Line(format!(
            "{}\n",
            serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result})
        ))
    }

    fn reply_error(id: &Value, code: i64, message: &str) -> Out {
        Out::Line(format!(
            "{}\n",
            serde_json::json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
        ))
    }

    /// Handles the handshake and tool listing; returns `None` for anything else.
    fn standard(msg: &Value) -> Option<Vec<Out>> {
        let id = msg.get("id")?;
        match msg["method"].as_str()? {
            "initialize" => Some(vec![reply(
                id,
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "scripted", "version": "0.0.1"}
                }),
            )]),
            "tools/list" => Some(vec![reply(
                id,
                serde_json::json!({"tools": [
                    {"name": "echo", "description": "Echo text", "inputSchema": {"type": "object"}}
                ]}),
            )]),
            _ => None,
        }
    }

    async fn serve<F>(stream: DuplexStream, mut handle: F)
    where
        F: FnMut(Value) -> Vec<Out> + Send + 'static,
    {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let msg: Value = serde_json::from_str(&line).expect("client sent valid json");
            for out in handle(msg) {
                match out {
                    Out::Line(l) => {
                        if write.write_all(l.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    Out::Close => return,
                }
            }
        }
    }

    fn fast_options() -> ConnectionOptions {
        ConnectionOptions {
            handshake_timeout: Duration::from_millis(500),
            call_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(200),
            client_info: ClientInfo::default(),
        }
    }

    fn connection(name: &str) -> ServerConnection {
        ServerConnection::new(
            name,
            ServerConfig::new("scripted", vec![]),
            fast_options(),
        )
    }

    async fn start_scripted<F>(conn: &ServerConnection, handle: F) -> Result<(), McpError>
    where
        F: FnMut(Value) -> Vec<Out> + Send + 'static,
    {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(server, handle));
        let (read, write) = tokio::io::split(client);
        conn.start_with_io(read, write).await
    }

    /// Echo tool: returns the arguments it was called with.
    fn echo_server(msg: Value) -> Vec<Out> {
        if let Some(out) = standard(&msg) {
            return out;
        }
        match (msg.get("id"), msg["method"].as_str()) {
            (Some(id), Some("tools/call")) => vec![reply(
                id,
                serde_json::json!({"content": [{"type": "text", "text": msg["params"]["arguments"]}]}),
            )],
            _ => vec![],
        }
    }

    #[tokio::test]
    async fn test_start_reaches_ready() {
        let conn = connection("echo");
        assert_eq!(conn.state(), ConnectionState::Unstarted);
        start_scripted(&conn, echo_server).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert!(conn.ready_at().is_some());
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_sends_initialize_then_initialized() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let conn = connection("echo");
        start_scripted(&conn, move |msg| {
            record.lock().unwrap().push(msg.clone());
            echo_server(msg)
        })
        .await
        .unwrap();

        // a round trip after Ready guarantees the notification was seen
        conn.discover_tools().await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0]["method"], "initialize");
        assert_eq!(seen[0]["params"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(seen[0]["params"]["clientInfo"]["name"], "mcp-hub");
        assert_eq!(seen[1]["method"], "notifications/initialized");
        assert!(seen[1].get("id").is_none());
        assert_eq!(seen[2]["method"], "tools/list");
    }

    #[tokio::test]
    async fn test_discover_and_invoke() {
        let conn = connection("echo");
        start_scripted(&conn, echo_server).await.unwrap();

        let tools = conn.discover_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = conn
            .invoke("echo", serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"]["text"], "hi");
        assert_eq!(conn.in_flight(), 0);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_discover_follows_cursor() {
        let conn = connection("paged");
        start_scripted(&conn, |msg| {
            let id = msg.get("id").cloned();
            match (id, msg["method"].as_str()) {
                (Some(id), Some("tools/list")) => match msg["params"]["cursor"].as_str() {
                    None => vec![reply(
                        &id,
                        serde_json::json!({"tools": [{"name": "a"}], "nextCursor": "page-2"}),
                    )],
                    Some("page-2") => {
                        vec![reply(&id, serde_json::json!({"tools": [{"name": "b"}]}))]
                    }
                    Some(_) => vec![reply_error(&id, -32602, "bad cursor")],
                },
                _ => standard(&msg).unwrap_or_default(),
            }
        })
        .await
        .unwrap();

        let names: Vec<String> = conn
            .discover_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_concurrent_invokes_resolve_out_of_order() {
        let conn = connection("reorder");
        let mut held: Option<Value> = None;
        start_scripted(&conn, move |msg| {
            if let Some(out) = standard(&msg) {
                return out;
            }
            let Some(id) = msg.get("id").cloned() else {
                return vec![];
            };
            let tag = msg["params"]["arguments"]["tag"].clone();
            match held.take() {
                // Hold the first call; answer the second before it.
                None => {
                    held = Some(serde_json::json!({"id": id, "tag": tag}));
                    vec![]
                }
                Some(first) => vec![
                    reply(&id, serde_json::json!({"tag": tag})),
                    reply(&first["id"], serde_json::json!({"tag": first["tag"]})),
                ],
            }
        })
        .await
        .unwrap();

        let first = conn.invoke("echo", serde_json::json!({"tag": "first"}));
        let second = async {
            // make sure "first" is written before "second"
            tokio::time::sleep(Duration::from_millis(50)).await;
            conn.invoke("echo", serde_json::json!({"tag": "second"})).await
        };
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap()["tag"], "first");
        assert_eq!(b.unwrap()["tag"], "second");
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_discarded() {
        let conn = connection("slow");
        let mut stale: Option<Value> = None;
        start_scripted(&conn, move |msg| {
            if let Some(out) = standard(&msg) {
                return out;
            }
            let Some(id) = msg.get("id").cloned() else {
                return vec![];
            };
            match msg["params"]["name"].as_str() {
                Some("slow") => {
                    stale = Some(id);
                    vec![]
                }
                _ => {
                    let mut out = Vec::new();
                    if let Some(old) = stale.take() {
                        out.push(reply(&old, serde_json::json!({"late": true})));
                    }
                    out.push(reply(&id, serde_json::json!({"fresh": true})));
                    out
                }
            }
        })
        .await
        .unwrap();

        let err = conn
            .invoke_with_timeout("slow", serde_json::json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.in_flight(), 0);

        let result = conn.invoke("fast", serde_json::json!({})).await.unwrap();
        assert_eq!(result["fresh"], true);
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_rpc_error_keeps_connection_ready() {
        let conn = connection("strict");
        start_scripted(&conn, |msg| {
            if let Some(out) = standard(&msg) {
                return out;
            }
            match msg.get("id") {
                Some(id) => vec![reply_error(id, -32602, "missing argument 'b'")],
                None => vec![],
            }
        })
        .await
        .unwrap();

        let err = conn.invoke("add", serde_json::json!({"a": 1})).await.unwrap_err();
        match err {
            McpError::ServerError { server, method, code, message, .. } => {
                assert_eq!(server, "strict");
                assert_eq!(method, "tools/call");
                assert_eq!(code, -32602);
                assert_eq!(message, "missing argument 'b'");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_closed_output_fails_connection() {
        let conn = connection("crashy");
        start_scripted(&conn, |msg| {
            if let Some(out) = standard(&msg) {
                return out;
            }
            match msg["method"].as_str() {
                Some("tools/call") => vec![Out::Close],
                _ => vec![],
            }
        })
        .await
        .unwrap();

        let err = conn.invoke("echo", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }), "got {err:?}");
        assert_eq!(conn.state(), ConnectionState::Failed);

        // Later calls fail fast instead of waiting for a timeout.
        let err = conn.invoke("echo", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_framing_error_escalates_to_transport_error() {
        let conn = connection("noisy");
        start_scripted(&conn, |msg| {
            if let Some(out) = standard(&msg) {
                return out;
            }
            match msg["method"].as_str() {
                Some("tools/call") => vec![Out::Line("this is not json\n".into())],
                _ => vec![],
            }
        })
        .await
        .unwrap();

        let err = conn.invoke("echo", serde_json::json!({})).await.unwrap_err();
        match err {
            McpError::TransportError { reason, .. } => assert!(reason.contains("framing")),
            other => panic!("expected TransportError, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(conn.failure().unwrap().contains("invalid JSON"));
    }

    #[tokio::test]
    async fn test_null_id_error_is_discarded() {
        let conn = connection("parser");
        start_scripted(&conn, |msg| {
            if let Some(out) = standard(&msg) {
                return out;
            }
            match msg.get("id") {
                Some(id) => vec![
                    Out::Line(format!(
                        "{}\n",
                        serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": null,
                            "error": {"code": -32700, "message": "Parse error"}
                        })
                    )),
                    reply(id, serde_json::json!({"content": []})),
                ],
                None => vec![],
            }
        })
        .await
        .unwrap();

        let result = conn.invoke("echo", serde_json::json!({})).await.unwrap();
        assert_eq!(result["content"], serde_json::json!([]));
        assert_eq!(conn.state(), ConnectionState::Ready);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_error_payload() {
        let conn = connection("grumpy");
        let err = start_scripted(&conn, |msg| match msg.get("id") {
            Some(id) => vec![reply_error(id, -32600, "unsupported protocol")],
            None => vec![],
        })
        .await
        .unwrap_err();

        match err {
            McpError::InitFailed { name, reason } => {
                assert_eq!(name, "grumpy");
                assert!(reason.contains("unsupported protocol"));
            }
            other => panic!("expected InitFailed, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_handshake_timeout_never_leaves_starting() {
        let conn = connection("silent");
        let err = start_scripted(&conn, |_| vec![]).await.unwrap_err();
        assert!(matches!(err, McpError::InitFailed { .. }), "got {err:?}");
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_exit_during_handshake_is_launch_error() {
        let conn = connection("quitter");
        let err = start_scripted(&conn, |_| vec![Out::Close]).await.unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }), "got {err:?}");
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_launch_error() {
        let conn = ServerConnection::new(
            "ghost",
            ServerConfig::new("/nonexistent/mcp-hub-test-binary", vec![]),
            fast_options(),
        );
        let err = conn.start().await.unwrap_err();
        match err {
            McpError::SpawnFailed { name, reason } => {
                assert_eq!(name, "ghost");
                assert!(reason.contains("could not spawn"));
            }
            other => panic!("expected SpawnFailed, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(conn.pid().is_none());
    }

    #[tokio::test]
    async fn test_operations_require_ready() {
        let conn = connection("idle");
        let err = conn.discover_tools().await.unwrap_err();
        assert!(matches!(
            err,
            McpError::NotReady { state: ConnectionState::Unstarted, .. }
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let conn = connection("echo");
        start_scripted(&conn, echo_server).await.unwrap();
        let err = start_scripted(&conn, echo_server).await.unwrap_err();
        assert!(matches!(err, McpError::NotReady { state: ConnectionState::Ready, .. }));
    }

    #[tokio::test]
    async fn test_answers_server_ping() {
        let replies = Arc::new(Mutex::new(Vec::new()));
        let record = replies.clone();
        let conn = connection("pinger");
        start_scripted(&conn, move |msg| {
            if msg["method"] == "notifications/initialized" {
                return vec![
                    Out::Line("{\"jsonrpc\":\"2.0\",\"id\":\"p1\",\"method\":\"ping\"}\n".into()),
                    Out::Line(
                        "{\"jsonrpc\":\"2.0\",\"id\":\"p2\",\"method\":\"sampling/createMessage\"}\n"
                            .into(),
                    ),
                ];
            }
            if msg.get("method").is_none() {
                record.lock().unwrap().push(msg);
                return vec![];
            }
            echo_server(msg)
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["id"], "p1");
        assert_eq!(replies[0]["result"], serde_json::json!({}));
        assert_eq!(replies[1]["error"]["code"], error_codes::METHOD_NOT_FOUND);
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_wakes_waiters() {
        let conn = Arc::new(connection("hang"));
        start_scripted(&conn, |msg| standard(&msg).unwrap_or_default())
            .await
            .unwrap();

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.invoke("never", serde_json::json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.in_flight(), 1);

        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));

        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(truncate_chars("héllo", 2), "hé...(truncated)");
    }
}
