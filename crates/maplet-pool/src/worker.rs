//! Child process host.
//!
//! A [`Worker`] owns one rendering child: the process handle and the
//! framed pipe over an anonymous unix socket pair. The child inherits its
//! end of the pair as a raw fd (`MAPLET_WORKER_FD`) and must send its
//! startup banner within `process_start_timeout`, otherwise it is killed
//! and reported dead.
//!
//! One command is in flight at a time. Typed stubs send a command and
//! consume the reply sequence up to its terminal `End`; a reply sequence
//! abandoned half-way is settled by the recycler (see
//! [`Worker::settle`]) before the worker is handed to anyone else.

use std::fmt;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::net::UnixStream;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use maplet_core::codec::CommandCodec;
use maplet_core::frames::{
    CacheInfo, CatalogItem, CollectionsPage, Command, JsonValue, PluginInfo, ProjectInfo, Reply,
    ReplyError, RequestParams, Severity,
};
use maplet_core::{Error, Result, env};

const TERM_TIMEOUT: Duration = Duration::from_secs(5);

// Grace granted to a child to finish an abandoned reply on its own before
// a cancel is issued.
const READY_TIMEOUT: Duration = Duration::from_secs(1);

/// Spawns one worker; cheap to clone, one clone per spawn.
#[derive(Clone)]
pub(crate) struct WorkerLauncher {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub start_timeout: u64,
    pub cancel_timeout: u64,
    pub max_frame_size: usize,
    pub engine_config: String,
}

impl WorkerLauncher {
    /// Start the child process and wait for its banner.
    pub async fn spawn(self) -> Result<Worker> {
        let (parent_io, child_io) = UnixStream::pair()?;
        let child_io = child_io.into_std()?;
        child_io.set_nonblocking(false)?;
        // The fd must survive exec.
        fcntl(&child_io, FcntlArg::F_SETFD(FdFlag::empty())).map_err(std::io::Error::from)?;

        tracing::debug!("starting child process {}", self.program.display());
        let mut child = ProcessCommand::new(&self.program)
            .args(&self.args)
            .env(env::WORKER_FD, child_io.as_raw_fd().to_string())
            .env(env::WORKER_NAME, &self.name)
            .env(env::ENGINE_CONFIG, &self.engine_config)
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                tracing::error!("failed to spawn worker process: {err}");
                Error::WorkerStartFailure
            })?;

        let mut conn = Framed::new(parent_io, CommandCodec::new(self.max_frame_size));

        let banner = tokio::select! {
            frame = timeout(Duration::from_secs(self.start_timeout), conn.next()) => {
                match frame {
                    Err(_) => {
                        tracing::error!("worker stalled at start, killing it");
                        let _ = child.start_kill();
                        Err(Error::WorkerStartFailure)
                    }
                    Ok(Some(Ok(Reply::Banner { pid, engine_version }))) => {
                        Ok((pid, engine_version))
                    }
                    Ok(Some(Ok(other))) => {
                        tracing::error!("unexpected handshake frame: {other:?}");
                        let _ = child.start_kill();
                        Err(Error::WorkerStartFailure)
                    }
                    Ok(Some(Err(err))) => {
                        tracing::error!("handshake failed: {err}");
                        let _ = child.start_kill();
                        Err(Error::WorkerStartFailure)
                    }
                    Ok(None) => Err(Error::WorkerStartFailure),
                }
            }
            status = child.wait() => {
                tracing::error!("worker exited prematurely: {status:?}");
                Err(Error::WorkerStartFailure)
            }
        };
        // Parent-side copy of the child's end, no longer needed.
        drop(child_io);

        let (pid, engine_version) = banner?;
        tracing::debug!("worker {pid} ready (engine {engine_version})");

        Ok(Worker {
            name: self.name,
            child,
            conn,
            pid,
            engine_version,
            cancel_timeout: Duration::from_secs(self.cancel_timeout),
            uptime: Instant::now(),
            next_id: 1,
            current_id: None,
            pending: 0,
            requests: 0,
            generation: 1,
            last_update: 0,
        })
    }
}

/// Handle to one rendering child.
pub struct Worker {
    name: String,
    child: Child,
    conn: Framed<UnixStream, CommandCodec>,
    pid: u32,
    engine_version: String,
    cancel_timeout: Duration,
    uptime: Instant,
    next_id: u64,
    current_id: Option<u64>,
    // Number of terminal `End` frames not yet consumed (0 or 1).
    pending: u32,
    /// Requests served by this child.
    pub(crate) requests: u64,
    pub(crate) generation: usize,
    /// Restore revision last applied to this child.
    pub(crate) last_update: u64,
}

impl Worker {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> WorkerId {
        WorkerId {
            value: self.child.id().or(Some(self.pid)),
        }
    }

    /// Label attached to cache replies: `{name}_{pid}`.
    pub fn cache_id(&self) -> String {
        format!("{}_{}", self.name, self.pid)
    }

    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    /// Commands served by this child so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn uptime(&self) -> Duration {
        self.uptime.elapsed()
    }

    pub fn is_alive(&mut self) -> bool {
        self.child.try_wait().map(|r| r.is_none()).unwrap_or(false)
    }

    /// Terminate the child: SIGTERM, then SIGKILL after a short wait.
    pub async fn terminate(&mut self) -> Result<()> {
        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::info!("worker {} already exited ({status})", self.pid);
            return Ok(());
        }
        tracing::debug!("terminating worker {}", self.pid);
        self.send_signal(Signal::SIGTERM)?;
        if timeout(TERM_TIMEOUT, self.child.wait()).await.is_err() {
            tracing::warn!("worker {} ignored SIGTERM, killing it", self.pid);
            self.child.start_kill().inspect_err(|err| {
                tracing::error!("failed to kill worker {}: {err}", self.pid);
            })?;
        }
        Ok(())
    }

    fn send_signal(&mut self, sig: Signal) -> Result<()> {
        // try_wait refreshes the pid table entry first; signalling a
        // process that was never waited on is racy.
        let _ = self.child.try_wait();
        match self.child.id() {
            Some(pid) => {
                signal::kill(Pid::from_raw(pid as i32), sig).map_err(std::io::Error::from)?;
                Ok(())
            }
            None => Err(Error::WorkerDead),
        }
    }

    // --- Frame plumbing ---------------------------------------------------

    /// Mark a command in flight and allocate its id.
    fn begin(&mut self) -> Result<u64> {
        if self.pending != 0 {
            return Err(Error::WorkerBusy);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.pending = 1;
        self.requests += 1;
        self.current_id = Some(id);
        Ok(id)
    }

    fn end(&mut self) {
        self.pending = self.pending.saturating_sub(1);
        self.current_id = None;
    }

    async fn put(&mut self, cmd: Command) -> Result<()> {
        self.conn.send(cmd).await
    }

    /// Next reply frame; `Event` frames are logged and skipped.
    async fn next_reply(&mut self) -> Result<Reply> {
        loop {
            match self.conn.next().await {
                None => return Err(Error::WorkerDead),
                Some(Err(err)) => return Err(err),
                Some(Ok(Reply::Event { severity, text })) => {
                    let pid = self.pid;
                    match severity {
                        Severity::Debug => tracing::debug!("[worker {pid}] {text}"),
                        Severity::Info => tracing::info!("[worker {pid}] {text}"),
                        Severity::Warning => tracing::warn!("[worker {pid}] {text}"),
                        Severity::Error | Severity::Critical => {
                            tracing::error!("[worker {pid}] {text}")
                        }
                    }
                }
                Some(Ok(reply)) => return Ok(reply),
            }
        }
    }

    fn reply_error(error: Option<ReplyError>) -> Error {
        match error {
            Some(err) => Error::Reply {
                kind: err.kind,
                message: err.message,
            },
            None => Error::UnexpectedReply("failed End without error detail"),
        }
    }

    /// Consume the terminal frame of the current sequence.
    async fn expect_end(&mut self) -> Result<()> {
        match self.next_reply().await? {
            Reply::End { ok: true, .. } => {
                self.end();
                Ok(())
            }
            Reply::End { ok: false, error } => {
                self.end();
                Err(Self::reply_error(error))
            }
            _ => Err(Error::UnexpectedReply("expected End frame")),
        }
    }

    /// Read and discard frames until the pending sequence terminates.
    async fn drain_until_end(&mut self) -> Result<()> {
        while self.pending > 0 {
            if let Reply::End { .. } = self.next_reply().await? {
                self.end();
            }
        }
        Ok(())
    }

    /// Abort the in-flight command.
    ///
    /// Writes a `Cancel` frame and waits `grace` for the child to terminate
    /// the pending sequence. Fails with [`Error::WorkerStalled`] when the
    /// child does not comply; the caller is expected to kill it.
    pub async fn cancel(&mut self, grace: Duration) -> Result<()> {
        let id = self.current_id.unwrap_or(0);
        tracing::debug!("cancelling request {id} on worker {}", self.pid);
        self.put(Command::Cancel { id }).await?;
        match timeout(grace, self.drain_until_end()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::WorkerStalled),
        }
    }

    /// Bring the worker back to the idle protocol state.
    ///
    /// No-op when the last reply sequence was fully consumed. Otherwise the
    /// child is given a moment to finish on its own, then cancelled with
    /// the configured grace.
    pub(crate) async fn settle(&mut self) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }
        if !self.is_alive() {
            return Err(Error::WorkerDead);
        }
        match timeout(READY_TIMEOUT, self.drain_until_end()).await {
            Ok(result) => result,
            Err(_) => self.cancel(self.cancel_timeout).await,
        }
    }

    // --- Typed stubs -------------------------------------------------------

    /// Liveness probe.
    pub async fn ping(&mut self, echo: &str) -> Result<String> {
        self.begin()?;
        self.put(Command::Ping { echo: echo.into() }).await?;
        match self.next_reply().await? {
            Reply::Pong { echo } => {
                self.expect_end().await?;
                Ok(echo)
            }
            Reply::End { error, .. } => {
                self.end();
                Err(Self::reply_error(error))
            }
            _ => Err(Error::UnexpectedReply("expected Pong")),
        }
    }

    /// Hold the worker busy for `delay` (diagnostic aid).
    ///
    /// The child blocks for the whole delay, exactly like an engine call;
    /// a sleep abandoned past the cancel grace gets the child killed.
    pub async fn sleep(&mut self, delay: Duration) -> Result<()> {
        self.begin()?;
        self.put(Command::Sleep {
            delay_ms: delay.as_millis() as u64,
        })
        .await?;
        self.expect_end().await
    }

    /// Send an engine request. Returns the reply headers; the body is
    /// consumed through [`Worker::byte_stream`].
    pub async fn request(&mut self, params: RequestParams) -> Result<RequestReply> {
        let id = self.begin()?;
        self.put(Command::Request { id, params }).await?;
        match self.next_reply().await? {
            Reply::Headers {
                id: reply_id,
                status,
                headers,
            } => {
                if reply_id != id {
                    return Err(Error::UnexpectedReply("headers for another request"));
                }
                Ok(RequestReply { status, headers })
            }
            Reply::End { error, .. } => {
                self.end();
                Err(Self::reply_error(error))
            }
            _ => Err(Error::UnexpectedReply("expected Headers")),
        }
    }

    /// Body chunks of the in-flight request.
    pub fn byte_stream(&mut self) -> ByteStream<'_> {
        ByteStream { worker: self }
    }

    pub async fn collections(
        &mut self,
        location: Option<&str>,
        resource: Option<&str>,
        range: std::ops::Range<i64>,
    ) -> Result<CollectionsPage> {
        self.begin()?;
        self.put(Command::Collections {
            location: location.map(Into::into),
            resource: resource.map(Into::into),
            start: range.start,
            end: range.end,
        })
        .await?;
        match self.next_reply().await? {
            Reply::Page(page) => {
                self.expect_end().await?;
                Ok(page)
            }
            Reply::End { error, .. } => {
                self.end();
                Err(Self::reply_error(error))
            }
            _ => Err(Error::UnexpectedReply("expected Page")),
        }
    }

    /// Checkout project status, optionally pulling it into the cache.
    pub async fn checkout_project(&mut self, uri: &str, pull: bool) -> Result<CacheInfo> {
        self.begin()?;
        self.put(Command::Checkout {
            uri: uri.into(),
            pull,
        })
        .await?;
        match self.next_reply().await? {
            Reply::Info(info) => {
                self.expect_end().await?;
                Ok(info)
            }
            Reply::End { error, .. } => {
                self.end();
                Err(Self::reply_error(error))
            }
            _ => Err(Error::UnexpectedReply("expected Info")),
        }
    }

    /// Drop a project from the cache, pinned or not.
    pub async fn drop_project(&mut self, uri: &str) -> Result<CacheInfo> {
        self.begin()?;
        self.put(Command::DropProject { uri: uri.into() }).await?;
        match self.next_reply().await? {
            Reply::Info(info) => {
                self.expect_end().await?;
                Ok(info)
            }
            Reply::End { error, .. } => {
                self.end();
                Err(Self::reply_error(error))
            }
            _ => Err(Error::UnexpectedReply("expected Info")),
        }
    }

    /// Snapshot of the child's cache entries.
    pub async fn list_cache(&mut self) -> Result<ObjectFrames<'_, CacheInfo>> {
        self.begin()?;
        self.put(Command::ListCache).await?;
        Ok(ObjectFrames::new(self))
    }

    /// Re-check and refresh every cached entry; streams per-entry statuses.
    pub async fn update_cache(&mut self) -> Result<ObjectFrames<'_, CacheInfo>> {
        self.begin()?;
        self.put(Command::UpdateCache).await?;
        Ok(ObjectFrames::new(self))
    }

    /// Drop all entries, including pinned ones.
    pub async fn clear_cache(&mut self) -> Result<()> {
        self.begin()?;
        self.put(Command::ClearCache).await?;
        self.expect_end().await
    }

    /// Enumerate projects reachable from the search paths.
    pub async fn catalog(
        &mut self,
        location: Option<&str>,
    ) -> Result<ObjectFrames<'_, CatalogItem>> {
        self.begin()?;
        self.put(Command::Catalog {
            location: location.map(Into::into),
        })
        .await?;
        Ok(ObjectFrames::new(self))
    }

    /// Layers and diagnostics of a loaded project. Does not load it.
    pub async fn project_info(&mut self, uri: &str) -> Result<ProjectInfo> {
        self.begin()?;
        self.put(Command::ProjectInfo { uri: uri.into() }).await?;
        match self.next_reply().await? {
            Reply::Project(info) => {
                self.expect_end().await?;
                Ok(info)
            }
            Reply::End { error, .. } => {
                self.end();
                Err(Self::reply_error(error))
            }
            _ => Err(Error::UnexpectedReply("expected Project")),
        }
    }

    pub async fn list_plugins(&mut self) -> Result<ObjectFrames<'_, PluginInfo>> {
        self.begin()?;
        self.put(Command::ListPlugins).await?;
        Ok(ObjectFrames::new(self))
    }

    pub async fn get_config(&mut self) -> Result<JsonValue> {
        self.begin()?;
        self.put(Command::GetConfig).await?;
        match self.next_reply().await? {
            Reply::Config(config) => {
                self.expect_end().await?;
                Ok(config)
            }
            Reply::End { error, .. } => {
                self.end();
                Err(Self::reply_error(error))
            }
            _ => Err(Error::UnexpectedReply("expected Config")),
        }
    }

    pub async fn put_config(&mut self, config: &JsonValue) -> Result<()> {
        self.begin()?;
        self.put(Command::PutConfig {
            config: config.clone(),
        })
        .await?;
        self.expect_end().await
    }

    pub async fn get_env(&mut self) -> Result<JsonValue> {
        self.begin()?;
        self.put(Command::GetEnv).await?;
        match self.next_reply().await? {
            Reply::Env(env) => {
                self.expect_end().await?;
                Ok(env)
            }
            Reply::End { error, .. } => {
                self.end();
                Err(Self::reply_error(error))
            }
            _ => Err(Error::UnexpectedReply("expected Env")),
        }
    }
}

/// Reply headers of an engine request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// Body chunk reader for an in-flight engine request.
pub struct ByteStream<'a> {
    worker: &'a mut Worker,
}

impl ByteStream<'_> {
    /// Next body chunk; `None` terminates the stream.
    pub async fn next(&mut self) -> Result<Option<bytes::Bytes>> {
        match self.worker.next_reply().await? {
            Reply::Chunk { data, .. } => Ok(Some(data.into())),
            Reply::End { ok: true, .. } => {
                self.worker.end();
                Ok(None)
            }
            Reply::End { ok: false, error } => {
                self.worker.end();
                Err(Worker::reply_error(error))
            }
            _ => Err(Error::UnexpectedReply("expected Chunk or End")),
        }
    }
}

/// Typed item frames of a streaming reply.
pub trait ReplyItem: Sized {
    fn from_reply(reply: Reply) -> Result<Self>;
}

impl ReplyItem for CacheInfo {
    fn from_reply(reply: Reply) -> Result<Self> {
        match reply {
            Reply::Info(info) => Ok(info),
            _ => Err(Error::UnexpectedReply("expected Info")),
        }
    }
}

impl ReplyItem for CatalogItem {
    fn from_reply(reply: Reply) -> Result<Self> {
        match reply {
            Reply::Item(item) => Ok(item),
            _ => Err(Error::UnexpectedReply("expected Item")),
        }
    }
}

impl ReplyItem for PluginInfo {
    fn from_reply(reply: Reply) -> Result<Self> {
        match reply {
            Reply::Plugin(plugin) => Ok(plugin),
            _ => Err(Error::UnexpectedReply("expected Plugin")),
        }
    }
}

/// Item reader for list-shaped replies.
pub struct ObjectFrames<'a, T> {
    worker: &'a mut Worker,
    done: bool,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T: ReplyItem> ObjectFrames<'a, T> {
    fn new(worker: &'a mut Worker) -> Self {
        Self {
            worker,
            done: false,
            _marker: std::marker::PhantomData,
        }
    }

    /// Next item; `None` terminates the stream.
    pub async fn next(&mut self) -> Result<Option<T>> {
        if self.done {
            return Ok(None);
        }
        match self.worker.next_reply().await? {
            Reply::End { ok: true, .. } => {
                self.worker.end();
                self.done = true;
                Ok(None)
            }
            Reply::End { ok: false, error } => {
                self.worker.end();
                self.done = true;
                Err(Worker::reply_error(error))
            }
            reply => T::from_reply(reply).map(Some),
        }
    }

    /// Collect the remaining items.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }
}

/// Displayable worker pid.
#[derive(Debug, Clone, Copy)]
pub struct WorkerId {
    pub value: Option<u32>,
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(pid) => write!(f, "{pid}"),
            None => write!(f, "<exited>"),
        }
    }
}
