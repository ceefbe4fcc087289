//! Stdio Transport
//!
//! This transport spawns a server as a child process and speaks
//! Content-Length framed JSON-RPC over its stdin/stdout. Stderr lines are
//! reported to the observer as [`RpcError::Stderr`].
//!
//! Each connection runs four tasks: a writer fed by an unbounded channel (so
//! notifications never suspend), a reader feeding a [`FrameParser`], a stderr
//! reader, and an exit monitor that owns the [`Child`].

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

use crate::dispatch::{CloseInfo, Dispatcher, TransportObserver};
use crate::framing::{encode_frame, FrameParser};
use crate::protocol::{JsonRpcMessage, RpcError, RpcResult};
use crate::transport::{Transport, TransportState};

/// Default time allowed for the process to start
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time the process gets to exit after SIGTERM before it is killed
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// Stdio Transport Configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioConfig {
    /// Command to run (e.g., "npx", "python", "node")
    pub command: String,

    /// Arguments for the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the process
    #[serde(default, alias = "cwd")]
    pub working_dir: Option<String>,

    /// How long to wait for the OS to confirm the process started
    #[serde(default = "default_connection_timeout", rename = "connectionTimeoutMs", with = "millis")]
    pub connection_timeout: Duration,

    /// Default per-request timeout
    #[serde(default = "default_request_timeout", rename = "requestTimeoutMs", with = "millis")]
    pub request_timeout: Duration,

    /// Grace period between SIGTERM and a forced kill on disconnect
    #[serde(default = "default_shutdown_grace", rename = "shutdownGraceMs", with = "millis")]
    pub shutdown_grace: Duration,
}

fn default_connection_timeout() -> Duration {
    DEFAULT_CONNECTION_TIMEOUT
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_shutdown_grace() -> Duration {
    DEFAULT_SHUTDOWN_GRACE
}

/// Durations expressed as integer milliseconds in config files
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl StdioConfig {
    /// Create a new stdio configuration
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Add an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Per-connection handles, shared with the exit monitor.
struct Connection {
    state: TransportState,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    shutdown: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
    pid: Option<u32>,
}

impl Connection {
    fn disconnected() -> Self {
        Self {
            state: TransportState::Disconnected,
            writer: None,
            shutdown: None,
            monitor: None,
            cancel: None,
            pid: None,
        }
    }

    fn clear(&mut self) {
        *self = Self::disconnected();
    }
}

type SharedConnection = Arc<Mutex<Connection>>;

fn lock(connection: &SharedConnection) -> MutexGuard<'_, Connection> {
    connection.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stdio Transport
///
/// Spawns a server as a child process and communicates via stdin/stdout.
pub struct StdioTransport {
    config: StdioConfig,
    command_str: String,
    dispatcher: Dispatcher,
    connection: SharedConnection,
}

impl StdioTransport {
    /// Create a transport for `config`; nothing is spawned until `connect()`
    pub fn new(config: StdioConfig) -> Self {
        let command_str = config.display();
        Self {
            config,
            command_str,
            dispatcher: Dispatcher::new(),
            connection: Arc::new(Mutex::new(Connection::disconnected())),
        }
    }

    /// Spawn a server process and connect to it
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let transport = StdioTransport::spawn("npx", &["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]).await?;
    /// ```
    pub async fn spawn(command: &str, args: &[&str]) -> RpcResult<Self> {
        let transport = Self::new(StdioConfig::new(command).args(args.iter().copied()));
        transport.connect().await?;
        Ok(transport)
    }

    pub fn config(&self) -> &StdioConfig {
        &self.config
    }

    /// OS process id of the running server
    pub fn pid(&self) -> Option<u32> {
        lock(&self.connection).pid
    }

    /// Number of requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.dispatcher.correlator().len()
    }

    /// Fire-and-forget write of a notification (or a reply to a server request).
    ///
    /// Never suspends; fails immediately when the transport is not connected.
    pub fn notify(&self, message: &JsonRpcMessage) -> RpcResult<()> {
        let frame = encode_frame(message)?;
        let writer = {
            let connection = lock(&self.connection);
            ensure_connected(&connection)?;
            connection
                .writer
                .clone()
                .ok_or_else(|| RpcError::closed("transport is not connected"))?
        };
        trace!(method = ?message.method(), bytes = frame.len(), "queueing frame");
        writer
            .send(frame)
            .map_err(|_| RpcError::closed("server stdin is closed"))
    }

    async fn start_process(&self) -> RpcResult<Child> {
        debug!(command = %self.command_str, "Spawning server process");

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }

        let spawned = tokio::time::timeout(
            self.config.connection_timeout,
            tokio::task::spawn_blocking(move || cmd.spawn()),
        )
        .await;

        match spawned {
            Ok(Ok(Ok(child))) => Ok(child),
            Ok(Ok(Err(e))) => {
                error!(error = %e, command = %self.command_str, "Failed to spawn server");
                Err(RpcError::connection(format!("{}: {}", self.command_str, e)))
            }
            Ok(Err(join)) => Err(RpcError::connection(format!(
                "{}: spawn task failed: {}",
                self.command_str, join
            ))),
            Err(_) => {
                error!(command = %self.command_str, "Server did not start in time");
                Err(RpcError::connection(format!(
                    "{}: process did not start within {}ms",
                    self.command_str,
                    self.config.connection_timeout.as_millis()
                )))
            }
        }
    }
}

fn ensure_connected(connection: &Connection) -> RpcResult<()> {
    if connection.state != TransportState::Connected {
        return Err(RpcError::closed(format!(
            "transport is {}, not connected",
            connection.state
        )));
    }
    Ok(())
}

#[async_trait]
impl Transport for StdioTransport {
    #[instrument(skip(self), fields(command = %self.command_str))]
    async fn connect(&self) -> RpcResult<()> {
        {
            let mut connection = lock(&self.connection);
            if connection.state != TransportState::Disconnected {
                return Err(RpcError::AlreadyConnected);
            }
            connection.state = TransportState::Connecting;
        }

        let mut child = match self.start_process().await {
            Ok(child) => child,
            Err(e) => {
                lock(&self.connection).state = TransportState::Disconnected;
                return Err(e);
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            lock(&self.connection).state = TransportState::Disconnected;
            return Err(RpcError::connection("failed to capture server stdio"));
        };

        let pid = child.id();
        let cancel = CancellationToken::new();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let mut connection = lock(&self.connection);
        tokio::spawn(run_writer(stdin, writer_rx, cancel.clone(), self.dispatcher.clone()));
        tokio::spawn(run_stderr(stderr, cancel.clone(), self.dispatcher.clone()));
        let reader = tokio::spawn(run_reader(stdout, cancel.clone(), self.dispatcher.clone()));
        let monitor = tokio::spawn(monitor_exit(ExitMonitor {
            child,
            shutdown: shutdown_rx,
            reader,
            cancel: cancel.clone(),
            connection: Arc::clone(&self.connection),
            dispatcher: self.dispatcher.clone(),
            grace: self.config.shutdown_grace,
            command: self.command_str.clone(),
        }));

        *connection = Connection {
            state: TransportState::Connected,
            writer: Some(writer_tx),
            shutdown: Some(shutdown_tx),
            monitor: Some(monitor),
            cancel: Some(cancel),
            pid,
        };

        debug!(command = %self.command_str, pid = ?pid, "Server process spawned successfully");
        Ok(())
    }

    async fn send_with_timeout(
        &self,
        message: JsonRpcMessage,
        timeout: Duration,
    ) -> RpcResult<Option<Value>> {
        let JsonRpcMessage::Request(request) = &message else {
            self.notify(&message)?;
            return Ok(None);
        };

        let frame = encode_frame(&message)?;
        let (writer, pending) = {
            let connection = lock(&self.connection);
            ensure_connected(&connection)?;
            let writer = connection
                .writer
                .clone()
                .ok_or_else(|| RpcError::closed("transport is not connected"))?;
            // Registered under the connection lock so an exit racing this send
            // is guaranteed to see the entry when it rejects everything.
            let pending =
                self.dispatcher
                    .correlator()
                    .register(request.id.clone(), &request.method, timeout)?;
            (writer, pending)
        };

        trace!(method = %request.method, id = %request.id, "Sending request");
        if writer.send(frame).is_err() {
            self.dispatcher
                .correlator()
                .reject(&request.id, RpcError::closed("server stdin is closed"));
        }

        pending.await.map(Some)
    }

    #[instrument(skip(self), fields(command = %self.command_str))]
    async fn disconnect(&self) {
        let (shutdown, monitor, cancel) = {
            let mut connection = lock(&self.connection);
            if connection.state != TransportState::Connected {
                return;
            }
            connection.state = TransportState::Closing;
            // Dropping the writer closes the server's stdin once queued frames are flushed.
            connection.writer = None;
            (
                connection.shutdown.take(),
                connection.monitor.take(),
                connection.cancel.take(),
            )
        };

        let rejected = self
            .dispatcher
            .correlator()
            .reject_all("transport disconnected");
        debug!(rejected, "Closing server connection");

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        if let Some(monitor) = monitor {
            if let Err(e) = monitor.await {
                warn!(error = %e, "exit monitor task failed");
            }
        }
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        lock(&self.connection).clear();
    }

    fn state(&self) -> TransportState {
        lock(&self.connection).state
    }

    fn set_observer(&self, observer: Arc<dyn TransportObserver>) {
        self.dispatcher.set_observer(observer);
    }

    fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // The monitor holds the child; ask it to terminate since we can't await here.
        if let Some(shutdown) = lock(&self.connection).shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("command", &self.command_str)
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

// ========================================
// Connection Tasks
// ========================================

async fn run_writer(
    mut stdin: ChildStdin,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
    dispatcher: Dispatcher,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            frame = frames.recv() => {
                let Some(frame) = frame else {
                    trace!("writer channel closed, closing server stdin");
                    break;
                };
                let written = async {
                    stdin.write_all(&frame).await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    warn!(error = %e, "Failed to write to server stdin");
                    dispatcher.error(RpcError::Io(e));
                    break;
                }
            }
        }
    }
}

async fn run_reader<R>(mut stdout: R, cancel: CancellationToken, dispatcher: Dispatcher)
where
    R: AsyncRead + Unpin + Send,
{
    let mut parser = FrameParser::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            read = stdout.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => {
                trace!("server stdout reached EOF");
                break;
            }
            Ok(n) => {
                for parsed in parser.push(&chunk[..n]) {
                    dispatcher.deliver_parsed(parsed);
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read from server stdout");
                dispatcher.error(RpcError::Io(e));
                break;
            }
        }
    }

    if parser.buffered_len() > 0 {
        dispatcher.error(RpcError::protocol(format!(
            "stdout closed with {} bytes of an incomplete frame",
            parser.buffered_len()
        )));
    }
}

async fn run_stderr<R>(stderr: R, cancel: CancellationToken, dispatcher: Dispatcher)
where
    R: AsyncRead + Unpin + Send,
{
    // Raw lines: a server may write anything to stderr, and the pipe must keep
    // draining or the server blocks on its next write.
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            read = reader.read_until(b'\n', &mut line) => read,
        };
        match read {
            Ok(0) => return,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']).to_string();
                debug!(stderr = %text, "server stderr");
                dispatcher.error(RpcError::Stderr(text));
            }
            Err(e) => {
                warn!(error = %e, "Failed to read server stderr");
                dispatcher.error(RpcError::Io(e));
                return;
            }
        }
    }
}

struct ExitMonitor {
    child: Child,
    shutdown: oneshot::Receiver<()>,
    reader: JoinHandle<()>,
    cancel: CancellationToken,
    connection: SharedConnection,
    dispatcher: Dispatcher,
    grace: Duration,
    command: String,
}

async fn monitor_exit(monitor: ExitMonitor) {
    let ExitMonitor {
        mut child,
        shutdown,
        reader,
        cancel,
        connection,
        dispatcher,
        grace,
        command,
    } = monitor;

    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        // A dropped sender means the transport itself was dropped.
        _ = shutdown => (terminate(&mut child, grace, &command).await, true),
    };

    // Let the reader drain whatever the process wrote before it went away.
    if tokio::time::timeout(grace, reader).await.is_err() {
        debug!(command = %command, "reader still busy after exit, cancelling");
    }
    cancel.cancel();

    let requested = requested || {
        let mut connection = lock(&connection);
        let closing = connection.state == TransportState::Closing;
        if !closing {
            connection.clear();
        }
        closing
    };

    let info = close_info(&status, requested);
    if requested {
        debug!(command = %command, status = %info, "Server process stopped");
    } else {
        warn!(command = %command, status = %info, "Server process exited unexpectedly");
        dispatcher
            .correlator()
            .reject_all(&format!("server process {}", info));
    }
    dispatcher.closed(info);
}

async fn terminate(child: &mut Child, grace: Duration, command: &str) -> std::io::Result<ExitStatus> {
    if let Some(status) = request_exit(child, grace, command).await {
        return status;
    }

    debug!(command, "Killing server process");
    child.kill().await?;
    child.wait().await
}

/// SIGTERM, then wait up to `grace`. `None` means the caller should kill.
#[cfg(unix)]
async fn request_exit(
    child: &mut Child,
    grace: Duration,
    command: &str,
) -> Option<std::io::Result<ExitStatus>> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = child.id().and_then(|pid| i32::try_from(pid).ok())?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).ok()?;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Some(status),
        Err(_) => {
            warn!(command, ?grace, "Server ignored SIGTERM, killing");
            None
        }
    }
}

#[cfg(not(unix))]
async fn request_exit(
    _child: &mut Child,
    _grace: Duration,
    _command: &str,
) -> Option<std::io::Result<ExitStatus>> {
    None
}

fn close_info(status: &std::io::Result<ExitStatus>, requested: bool) -> CloseInfo {
    match status {
        Ok(status) => CloseInfo {
            code: status.code(),
            signal: exit_signal(status),
            requested,
        },
        Err(e) => {
            warn!(error = %e, "error waiting for server process");
            CloseInfo {
                requested,
                ..CloseInfo::default()
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
