//! A single server connection.
//!
//! Each connection runs as a dedicated driver task owning the socket,
//! plus a reader task feeding it decoded lines. Outbound work is pulled:
//! whenever the in-flight queue has room the driver asks its event
//! handler for the next task, so callers never block on a full queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::task::{Task, TaskError, TaskOutcome};
use super::wire::{self, Incoming};

const SUPPORTED_VERSIONS: &[&str] = &["1.1", "1.2", "1.3", "1.4"];

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_name: String,
    /// Maximum requests in flight at once.
    pub queue_size: usize,
    pub task_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_name: concat!("sigma-sync ", env!("CARGO_PKG_VERSION")).to_string(),
            queue_size: 5,
            task_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// Callbacks a connection raises into its owner. All methods are called
/// from the driver task.
pub trait ConnectionEvents: Send + Sync {
    /// Handshake succeeded; `version` is what the server negotiated.
    fn on_open(&self, uri: &str, version: &str);
    /// Socket gone. `error` is `None` on a requested shutdown.
    fn on_close(&self, uri: &str, error: Option<anyhow::Error>);
    /// The in-flight queue has room. Return the next task to send, or
    /// `None` if there is nothing to do right now.
    fn on_queue_space(&self, uri: &str, version: &str) -> Option<Task>;
    fn on_height_changed(&self, uri: &str, height: i64);
    fn on_script_hash_changed(&self, uri: &str, script_hash: &str, status_hash: Option<&str>);
}

/// Handle to a live (or closing) connection.
pub trait ServerConnection: Send + Sync {
    fn uri(&self) -> &str;
    fn is_connected(&self) -> bool;
    /// Pushes a task directly, bypassing the pull queue. Used for
    /// broadcasts which must go out on every connection at once.
    fn submit_task(&self, task: Task);
    /// Nudges the driver to re-poll `on_queue_space`.
    fn wake_up(&self);
    fn disconnect(&self);
}

enum ConnMsg {
    Submit(Task),
    WakeUp,
    Shutdown,
}

pub struct Connection {
    uri: String,
    tx: mpsc::UnboundedSender<ConnMsg>,
    connected: Arc<AtomicBool>,
}

impl Connection {
    /// Starts the driver task for `uri` (`tcp://host:port` or
    /// `ssl://host:port`) and returns immediately; dial errors surface
    /// through `events.on_close`.
    pub fn spawn(
        uri: impl Into<String>,
        options: ConnectOptions,
        events: Arc<dyn ConnectionEvents>,
    ) -> Self {
        let uri = uri.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            uri: uri.clone(),
            options,
            events,
            connected: connected.clone(),
            pending: HashMap::new(),
            next_id: 0,
            version: None,
            last_write: Instant::now(),
        };
        tokio::spawn(driver.run(rx));

        Self { uri, tx, connected }
    }
}

impl ServerConnection for Connection {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn submit_task(&self, task: Task) {
        if let Err(e) = self.tx.send(ConnMsg::Submit(task)) {
            let ConnMsg::Submit(task) = e.0 else { return };
            task.resolve(TaskOutcome::Failed(TaskError::ConnectionClosed(
                self.uri.clone(),
            )));
        }
    }

    fn wake_up(&self) {
        let _ = self.tx.send(ConnMsg::WakeUp);
    }

    fn disconnect(&self) {
        let _ = self.tx.send(ConnMsg::Shutdown);
    }
}

// =====================================================================
// Driver
// =====================================================================

enum PendingKind {
    Handshake,
    KeepAlive,
    Task(Task),
}

struct Pending {
    kind: PendingKind,
    sent_at: Instant,
}

struct Driver {
    uri: String,
    options: ConnectOptions,
    events: Arc<dyn ConnectionEvents>,
    connected: Arc<AtomicBool>,
    pending: HashMap<u64, Pending>,
    next_id: u64,
    version: Option<String>,
    last_write: Instant,
}

type WriteHalf = tokio::io::WriteHalf<Box<dyn IoStream>>;

trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

async fn dial(uri: &str) -> Result<Box<dyn IoStream>> {
    let (scheme, addr) = uri
        .split_once("://")
        .ok_or_else(|| anyhow!("invalid server uri: {uri}"))?;
    let addr = addr.trim_end_matches('/');

    match scheme {
        "tcp" => {
            let stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("connecting to {uri}"))?;
            Ok(Box::new(stream))
        }
        "ssl" | "tls" => {
            let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
            // Electrum servers near-universally run self-signed certs.
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?;
            let tls = tokio_native_tls::TlsConnector::from(tls);
            let tcp = TcpStream::connect(addr)
                .await
                .with_context(|| format!("connecting to {uri}"))?;
            let stream = tls
                .connect(host, tcp)
                .await
                .with_context(|| format!("tls handshake with {uri}"))?;
            Ok(Box::new(stream))
        }
        other => bail!("unsupported scheme {other}:// in {uri}"),
    }
}

impl Driver {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<ConnMsg>) {
        let error = self.run_inner(&mut cmd_rx).await.err();
        self.connected.store(false, Ordering::Relaxed);

        // Everything still in flight is lost.
        for (_, pending) in self.pending.drain() {
            if let PendingKind::Task(task) = pending.kind {
                task.resolve(TaskOutcome::Failed(TaskError::ConnectionClosed(
                    self.uri.clone(),
                )));
            }
        }
        cmd_rx.close();
        while let Ok(msg) = cmd_rx.try_recv() {
            if let ConnMsg::Submit(task) = msg {
                task.resolve(TaskOutcome::Failed(TaskError::ConnectionClosed(
                    self.uri.clone(),
                )));
            }
        }

        match &error {
            Some(e) => log::info!("[CONN] {} closed: {e:#}", self.uri),
            None => log::debug!("[CONN] {} closed", self.uri),
        }
        self.events.on_close(&self.uri, error);
    }

    async fn run_inner(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<ConnMsg>) -> Result<()> {
        let stream = dial(&self.uri).await?;
        let (read_half, mut write_half) = tokio::io::split(stream);

        // `read_line` is not cancel-safe, so reading gets its own task
        // and the driver selects on a channel instead.
        let (line_tx, mut line_rx) = mpsc::channel::<std::io::Result<String>>(16);
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if line_tx.send(Ok(line)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = line_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        log::debug!("[CONN] {} dialed, negotiating version", self.uri);
        self.send_handshake(&mut write_half).await?;

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                line = line_rx.recv() => {
                    let line = line
                        .ok_or_else(|| anyhow!("server closed the socket"))?
                        .context("socket read failed")?;
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    self.handle_line(line, &mut write_half).await?;
                }
                msg = cmd_rx.recv() => {
                    match msg {
                        Some(ConnMsg::Submit(task)) => {
                            self.send_task(task, &mut write_half).await?;
                        }
                        Some(ConnMsg::WakeUp) => {
                            self.fill_queue(&mut write_half).await?;
                        }
                        Some(ConnMsg::Shutdown) | None => return Ok(()),
                    }
                }
                _ = tick.tick() => {
                    self.expire_pending()?;
                    self.maybe_keep_alive(&mut write_half).await?;
                    self.fill_queue(&mut write_half).await?;
                }
            }
        }
    }

    async fn send_handshake(&mut self, writer: &mut WriteHalf) -> Result<()> {
        let id = self.next_id;
        self.next_id += 1;
        let line = wire::request_json(
            id,
            "server.version",
            &json!([self.options.client_name, ["1.1", "1.4"]]),
        )?;
        self.pending.insert(
            id,
            Pending {
                kind: PendingKind::Handshake,
                sent_at: Instant::now(),
            },
        );
        self.write_line(writer, &line).await
    }

    async fn send_keep_alive(&mut self, writer: &mut WriteHalf) -> Result<()> {
        let id = self.next_id;
        self.next_id += 1;
        // server.ping only exists from protocol 1.2 on; older servers
        // get another version call instead.
        let line = match self.version.as_deref() {
            Some(v) if v >= "1.2" => wire::request_json(id, "server.ping", &json!([]))?,
            _ => wire::request_json(
                id,
                "server.version",
                &json!([self.options.client_name, ["1.1", "1.4"]]),
            )?,
        };
        self.pending.insert(
            id,
            Pending {
                kind: PendingKind::KeepAlive,
                sent_at: Instant::now(),
            },
        );
        self.write_line(writer, &line).await
    }

    async fn send_task(&mut self, task: Task, writer: &mut WriteHalf) -> Result<()> {
        let id = self.next_id;
        self.next_id += 1;
        let line = match wire::request_json(id, &task.method, &task.params) {
            Ok(line) => line,
            Err(e) => {
                task.resolve(TaskOutcome::Failed(TaskError::BadReply(e.to_string())));
                return Ok(());
            }
        };
        log::trace!("[CONN] {} -> {}", self.uri, task.method);
        self.pending.insert(
            id,
            Pending {
                kind: PendingKind::Task(task),
                sent_at: Instant::now(),
            },
        );
        self.write_line(writer, &line).await
    }

    async fn write_line(&mut self, writer: &mut WriteHalf, line: &str) -> Result<()> {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        self.last_write = Instant::now();
        Ok(())
    }

    fn in_flight_tasks(&self) -> usize {
        self.pending
            .values()
            .filter(|p| matches!(p.kind, PendingKind::Task(_)))
            .count()
    }

    /// Pulls tasks from the owner until the queue is full or the owner
    /// has nothing. Nothing is pulled before the handshake completes.
    async fn fill_queue(&mut self, writer: &mut WriteHalf) -> Result<()> {
        let Some(version) = self.version.clone() else {
            return Ok(());
        };
        while self.in_flight_tasks() < self.options.queue_size {
            let Some(task) = self.events.on_queue_space(&self.uri, &version) else {
                break;
            };
            self.send_task(task, writer).await?;
        }
        Ok(())
    }

    /// Times out individual tasks without dropping the connection; a
    /// dead handshake or keepalive means the server itself is gone.
    fn expire_pending(&mut self) -> Result<()> {
        let timeout = self.options.task_timeout;
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.sent_at.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            match pending.kind {
                PendingKind::Task(task) => {
                    log::debug!("[CONN] {} task {id} timed out", self.uri);
                    task.resolve(TaskOutcome::Failed(TaskError::Timeout));
                }
                PendingKind::Handshake => bail!("version handshake timed out"),
                PendingKind::KeepAlive => bail!("keepalive timed out"),
            }
        }
        Ok(())
    }

    async fn maybe_keep_alive(&mut self, writer: &mut WriteHalf) -> Result<()> {
        if self.last_write.elapsed() >= self.options.keep_alive {
            self.send_keep_alive(writer).await?;
        }
        Ok(())
    }

    async fn handle_line(&mut self, line: &str, writer: &mut WriteHalf) -> Result<()> {
        match wire::parse_line(line)? {
            Incoming::Response { id, result, error } => {
                let pending = self
                    .pending
                    .remove(&id)
                    .ok_or_else(|| anyhow!("reply to unknown request id {id}"))?;
                let elapsed = pending.sent_at.elapsed();
                match pending.kind {
                    PendingKind::Handshake => {
                        if let Some(error) = error {
                            bail!("version handshake rejected: {error}");
                        }
                        let result = result.unwrap_or_default();
                        let version = wire::parse_version_reply(&result, SUPPORTED_VERSIONS)?;
                        log::info!("[CONN] {} connected (protocol {version})", self.uri);
                        self.version = Some(version.clone());
                        self.connected.store(true, Ordering::Relaxed);
                        self.events.on_open(&self.uri, &version);
                        self.fill_queue(writer).await?;
                    }
                    PendingKind::KeepAlive => {}
                    PendingKind::Task(task) => {
                        match (result, error) {
                            (_, Some(error)) => task.resolve(TaskOutcome::Failed(
                                TaskError::Server(error.to_string()),
                            )),
                            (Some(result), None) => {
                                task.resolve(TaskOutcome::Done { result, elapsed })
                            }
                            (None, None) => task.resolve(TaskOutcome::Failed(
                                TaskError::BadReply("reply with neither result nor error".into()),
                            )),
                        }
                        self.fill_queue(writer).await?;
                    }
                }
            }
            Incoming::HeightChanged { height } => {
                self.events.on_height_changed(&self.uri, height);
                self.fill_queue(writer).await?;
            }
            Incoming::ScriptHashChanged {
                script_hash,
                status_hash,
            } => {
                self.events
                    .on_script_hash_changed(&self.uri, &script_hash, status_hash.as_deref());
                self.fill_queue(writer).await?;
            }
            Incoming::UnknownNotification { method } => {
                log::debug!("[CONN] {} ignoring notification {method}", self.uri);
            }
        }
        Ok(())
    }
}
