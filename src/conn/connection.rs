use crate::{
    conn::{
        params::connect_params::ConnectParams,
        transport::{self, TransportReader, TransportWriter},
        ConnectionConfiguration,
    },
    protocol::{Arg, Command, CommandOptions, Encoder, Parser, Value},
    RedisError, RedisResult,
};
use bytes::BytesMut;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::oneshot,
};

/// The lifecycle states of a [`Connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No usable transport.
    Disconnected,
    /// Request/reply operation.
    Ready,
    /// Pub/sub push operation; request/reply pairing is suspended.
    Subscribed,
}

/// A coroutine that runs after every successful (re)connect, before any
/// user command is dispatched.
///
/// Registrations are weak: the connection never keeps its hook targets
/// alive.
#[async_trait::async_trait]
pub trait ReconnectHook: Send + Sync {
    /// Called with the freshly connected `Connection` after its startup
    /// sequence (auth, client name, database selection) has completed.
    async fn on_reconnect(&self, conn: &Connection) -> RedisResult<()>;
}

// What the read task does with a decoded push value while the connection
// is in subscribe mode.
pub(crate) enum DispatchOutcome {
    Continue,
    // the last subscription was acknowledged away; the connection
    // returns to request/reply operation
    SubscriptionsEmpty,
}

// Receiver of push messages while the connection is in subscribe mode.
// Dispatch runs on the read task; implementations must not block.
pub(crate) trait PushDispatch: Send + Sync {
    fn dispatch_push(&self, value: Value) -> DispatchOutcome;
    fn connection_lost(&self);
}

// One outstanding command: the completion handle and its originating
// options. The queue is strictly FIFO; replies pair by position, the
// protocol provides no request id.
pub(crate) struct PendingRequest {
    tx: oneshot::Sender<RedisResult<Value>>,
    options: CommandOptions,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct SharedState {
    pending: VecDeque<PendingRequest>,
    status: ConnectionStatus,
    push_target: Option<Weak<dyn PushDispatch>>,
    // ties each read task to one transport; a stale task must not touch
    // state after a reconnect
    generation: u64,
    broken: bool,
}

#[derive(Debug)]
struct WriteState {
    writer: Option<TransportWriter>,
}

#[derive(Debug)]
struct Times {
    last_used: Instant,
    acquired_at: Option<Instant>,
}

pub(crate) struct ConnCore {
    params: ConnectParams,
    config: ConnectionConfiguration,
    encoder: Encoder,
    write: tokio::sync::Mutex<WriteState>,
    shared: Mutex<SharedState>,
    hooks: Mutex<Vec<Weak<dyn ReconnectHook>>>,
    times: Mutex<Times>,
}

impl std::fmt::Debug for ConnCore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ConnCore")
            .field("params", &self.params)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// An asynchronous connection to one server.
///
/// The connection owns one duplex transport. Outbound commands are
/// serialized under a write lock; a background read task decodes the
/// inbound byte stream and resolves the waiting callers in FIFO order --
/// the server guarantees that replies arrive in the order the commands
/// were written.
///
/// Cheap to clone; clones share the underlying transport.
#[derive(Clone, Debug)]
pub struct Connection {
    core: Arc<ConnCore>,
}

impl Connection {
    /// Establishes the transport and runs the startup sequence: `AUTH`
    /// (if credentials are configured), `CLIENT SETNAME` (failure is
    /// logged and ignored), `SELECT` (if a non-zero database index is
    /// configured), `READONLY` (if configured), then the registered
    /// reconnect hooks in registration order.
    ///
    /// # Errors
    ///
    /// `RedisError::Connect` on transport failure, `RedisError::Auth` on
    /// rejected credentials, `RedisError::Protocol` on an unexpected
    /// startup reply.
    pub async fn connect(
        params: ConnectParams,
        config: ConnectionConfiguration,
    ) -> RedisResult<Connection> {
        trace!("trying to connect to {}", params);
        let start = Instant::now();
        let (reader, writer) = transport::connect(&params, config.connect_timeout()).await?;
        let encoder = Encoder::new(config.encoding_errors(), config.is_auto_decode());
        let now = Instant::now();
        let core = Arc::new(ConnCore {
            params,
            config,
            encoder,
            write: tokio::sync::Mutex::new(WriteState {
                writer: Some(writer),
            }),
            shared: Mutex::new(SharedState {
                pending: VecDeque::new(),
                status: ConnectionStatus::Ready,
                push_target: None,
                generation: 1,
                broken: false,
            }),
            hooks: Mutex::new(Vec::new()),
            times: Mutex::new(Times {
                last_used: now,
                acquired_at: None,
            }),
        });
        tokio::spawn(read_loop(Arc::clone(&core), reader, 1));
        let conn = Connection { core };
        if let Err(e) = conn.run_startup().await {
            conn.disconnect().await;
            return Err(e);
        }
        debug!(
            "connected to {} ({} µs)",
            conn.core.params,
            Instant::now().duration_since(start).as_micros()
        );
        Ok(conn)
    }

    /// The parameters this connection was created with.
    #[must_use]
    pub fn params(&self) -> &ConnectParams {
        &self.core.params
    }

    pub(crate) fn config(&self) -> &ConnectionConfiguration {
        &self.core.config
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.core.lock_shared().status
    }

    /// Whether the transport is gone; a broken connection must be
    /// reconnected or discarded.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.core.lock_shared().broken
    }

    /// Registers a hook that runs after every successful (re)connect,
    /// before any user command is dispatched.
    ///
    /// The registration is weak; a dropped target is pruned silently.
    pub fn register_reconnect_hook(&self, hook: Weak<dyn ReconnectHook>) {
        self.core.lock_hooks().push(hook);
    }

    /// Encodes and sends a single command and awaits its reply.
    ///
    /// Replies that are server errors resolve as the matching
    /// [`RedisError`]; the reply value is otherwise postprocessed under
    /// the connection's decode settings (overridable per call via
    /// `options`).
    ///
    /// If `retry_on_timeout` is configured and the configured deadline
    /// expires, the command is retried exactly once after a reconnect.
    ///
    /// # Errors
    ///
    /// See the error taxonomy on [`RedisError`].
    pub async fn send_command(
        &self,
        cmd: Command,
        options: CommandOptions,
    ) -> RedisResult<Value> {
        match self.send_once(&cmd, &options).await {
            Err(e) if e.is_timeout() && self.core.config.is_retry_on_timeout() => {
                debug!(
                    "send_command: reconnecting after timeout, repeating {} once",
                    cmd.name()
                );
                self.reconnect().await?;
                self.send_once(&cmd, &options).await
            }
            other => other,
        }
    }

    /// Convenience: builds a command from a name and already-converted
    /// arguments and sends it.
    ///
    /// # Errors
    ///
    /// See [`send_command`](Connection::send_command).
    pub async fn execute<S: AsRef<str>>(
        &self,
        name: S,
        args: Vec<Arg>,
        options: CommandOptions,
    ) -> RedisResult<Value> {
        let mut cmd = Command::new(name);
        for arg in args {
            cmd = cmd.arg(arg)?;
        }
        self.send_command(cmd, options).await
    }

    // One attempt: enqueue, write, await the reply under the configured
    // response deadline.
    pub(crate) async fn send_once(
        &self,
        cmd: &Command,
        options: &CommandOptions,
    ) -> RedisResult<Value> {
        let mut frame = BytesMut::with_capacity(64);
        self.core.encoder.encode_command_into(cmd, &mut frame);
        let mut receivers = self.enqueue_and_write(&frame, vec![options.clone()]).await?;
        let rx = receivers.pop().ok_or(RedisError::Usage("empty batch"))?;
        self.await_reply(rx)
            .await
            .and_then(|v| self.core.encoder.postprocess(v, options.decode()))
    }

    // Writes a pre-encoded batch as one contiguous write and returns the
    // completion handles in command order. Used by the pipeline engine.
    pub(crate) async fn send_batch(
        &self,
        cmds: &[(Command, CommandOptions)],
    ) -> RedisResult<Vec<oneshot::Receiver<RedisResult<Value>>>> {
        let mut frame = BytesMut::with_capacity(64 * cmds.len());
        for (cmd, _) in cmds {
            self.core.encoder.encode_command_into(cmd, &mut frame);
        }
        let options = cmds.iter().map(|(_, o)| o.clone()).collect();
        self.enqueue_and_write(&frame, options).await
    }

    // The single write path: registers the pending entries and performs
    // the write while holding the write lock, so that queue order always
    // equals wire order.
    async fn enqueue_and_write(
        &self,
        frame: &[u8],
        options: Vec<CommandOptions>,
    ) -> RedisResult<Vec<oneshot::Receiver<RedisResult<Value>>>> {
        let count = options.len();
        let mut write = self.core.write.lock().await;
        let Some(writer) = write.writer.as_mut() else {
            return Err(RedisError::ConnectionClosed);
        };
        let mut receivers = Vec::with_capacity(count);
        {
            let mut shared = self.core.lock_shared();
            if shared.broken {
                return Err(RedisError::ConnectionClosed);
            }
            if shared.status == ConnectionStatus::Subscribed {
                return Err(RedisError::Usage(
                    "connection is in subscribe mode; only pub/sub commands are accepted",
                ));
            }
            for opts in options {
                let (tx, rx) = oneshot::channel();
                shared.pending.push_back(PendingRequest { tx, options: opts });
                receivers.push(rx);
            }
        }
        self.touch();
        if let Err(e) = write_frame(writer, frame, self.core.config.write_timeout()).await {
            // the entries just registered are the queue tail; nobody else
            // could append while the write lock was held
            let mut shared = self.core.lock_shared();
            for _ in 0..count {
                shared.pending.pop_back();
            }
            shared.broken = true;
            drop(shared);
            write.writer = None;
            return Err(e);
        }
        Ok(receivers)
    }

    // Awaits one batch reply under the configured response deadline.
    // Server errors arrive as the matching typed error; no decode
    // postprocessing is applied.
    pub(crate) async fn await_reply(
        &self,
        rx: oneshot::Receiver<RedisResult<Value>>,
    ) -> RedisResult<Value> {
        let reply = match self.core.config.response_timeout() {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(received) => received,
                Err(_elapsed) => return Err(RedisError::Timeout),
            },
            None => rx.await,
        };
        match reply {
            Ok(result) => result,
            Err(_) => Err(RedisError::ConnectionClosed),
        }
    }

    // Fire-and-forget write for subscribe-mode commands; replies arrive
    // as push messages and are never paired with a pending entry.
    pub(crate) async fn send_push_command(&self, cmd: &Command) -> RedisResult<()> {
        let mut frame = BytesMut::with_capacity(64);
        self.core.encoder.encode_command_into(cmd, &mut frame);
        let mut write = self.core.write.lock().await;
        let Some(writer) = write.writer.as_mut() else {
            return Err(RedisError::ConnectionClosed);
        };
        self.touch();
        if let Err(e) = write_frame(writer, &frame, self.core.config.write_timeout()).await {
            self.core.lock_shared().broken = true;
            write.writer = None;
            return Err(e);
        }
        Ok(())
    }

    /// Closes the transport, cancels all pending commands with
    /// `RedisError::ConnectionClosed`, and releases the resources.
    /// Idempotent.
    pub async fn disconnect(&self) {
        debug!("Disconnect of connection to {}", self.core.params);
        let mut write = self.core.write.lock().await;
        if let Some(mut writer) = write.writer.take() {
            writer.shutdown().await.ok();
        }
        let mut shared = self.core.lock_shared();
        shared.broken = true;
        shared.status = ConnectionStatus::Disconnected;
        shared.push_target = None;
        fail_pending(&mut shared);
    }

    /// Replaces the transport, preserving identity and hook
    /// registrations, and re-runs the startup sequence.
    ///
    /// All commands pending on the old transport fail with
    /// `RedisError::ConnectionClosed`.
    ///
    /// # Errors
    ///
    /// As for [`connect`](Connection::connect).
    pub async fn reconnect(&self) -> RedisResult<()> {
        debug!("Trying to reconnect to {}", self.core.params);
        let mut write = self.core.write.lock().await;
        let new_generation = {
            let mut shared = self.core.lock_shared();
            shared.generation += 1;
            shared.broken = true;
            shared.status = ConnectionStatus::Disconnected;
            fail_pending(&mut shared);
            shared.generation
        };
        if let Some(mut old) = write.writer.take() {
            old.shutdown().await.ok();
        }
        let (reader, writer) =
            transport::connect(&self.core.params, self.core.config.connect_timeout()).await?;
        write.writer = Some(writer);
        {
            let mut shared = self.core.lock_shared();
            shared.broken = false;
            shared.status = ConnectionStatus::Ready;
        }
        tokio::spawn(read_loop(Arc::clone(&self.core), reader, new_generation));
        drop(write);
        let result = self.run_startup().await;
        if let Err(ref e) = result {
            warn!("startup sequence after reconnect failed: {}", e);
            self.core.lock_shared().broken = true;
        } else {
            debug!("Reconnected to {}", self.core.params);
        }
        result
    }

    // The implicit prelude of every (re)connect; user commands may not
    // overtake it because the connection has not been handed out yet.
    async fn run_startup(&self) -> RedisResult<()> {
        if let Some(password) = self.core.params.password() {
            let cmd = match self.core.params.username() {
                Some(user) => Command::new("AUTH")
                    .arg(user)?
                    .arg(password.unsecure())?,
                None => Command::new("AUTH").arg(password.unsecure())?,
            };
            self.send_once(&cmd, &CommandOptions::default())
                .await
                .map_err(|e| match e {
                    RedisError::Auth { message } => RedisError::Auth { message },
                    RedisError::Response { kind, message } => RedisError::Auth {
                        message: format!("{kind} {message}"),
                    },
                    other => other,
                })?;
        }
        if let Some(name) = self.core.config.client_name() {
            let cmd = Command::new("CLIENT SETNAME").arg(name)?;
            match self.send_once(&cmd, &CommandOptions::default()).await {
                Ok(_) => {}
                Err(e) if e.is_connection_error() => return Err(e),
                Err(e) => warn!("CLIENT SETNAME failed: {}", e),
            }
        }
        if self.core.config.db() != 0 {
            let cmd = Command::new("SELECT").arg(self.core.config.db())?;
            self.send_once(&cmd, &CommandOptions::default())
                .await
                .map_err(startup_error)?;
        }
        if self.core.config.is_readonly() {
            self.send_once(&Command::new("READONLY"), &CommandOptions::default())
                .await
                .map_err(startup_error)?;
        }
        let hooks: Vec<Arc<dyn ReconnectHook>> = {
            let mut registered = self.core.lock_hooks();
            registered.retain(|hook| hook.strong_count() > 0);
            registered.iter().filter_map(Weak::upgrade).collect()
        };
        for hook in hooks {
            hook.on_reconnect(self).await?;
        }
        Ok(())
    }

    /// Sends `PING` with a random sentinel payload and verifies the echo.
    ///
    /// # Errors
    ///
    /// Any send error; `RedisError::Protocol` on an echo mismatch.
    pub async fn ping_probe(&self) -> RedisResult<()> {
        let sentinel = format!("healthcheck-{:016x}", rand::random::<u64>());
        let cmd = Command::new("PING").arg(sentinel.as_str())?;
        let reply = self
            .send_once(&cmd, &CommandOptions::default().with_decode(false))
            .await?;
        match reply.as_bytes() {
            Some(echo) if echo == sentinel.as_bytes() => Ok(()),
            other => Err(RedisError::protocol(format!(
                "ping echo mismatch: {other:?}"
            ))),
        }
    }

    /// How long this connection has been idle (since it was last used or
    /// released).
    #[must_use]
    pub fn idle_age(&self) -> Duration {
        self.core.lock_times().last_used.elapsed()
    }

    /// How long this connection has been handed out, or zero if it is
    /// not in use.
    #[must_use]
    pub fn in_use_age(&self) -> Duration {
        self.core
            .lock_times()
            .acquired_at
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub(crate) fn health_check_due(&self) -> bool {
        match self.core.config.health_check_interval() {
            Some(interval) => self.idle_age() >= interval,
            None => false,
        }
    }

    pub(crate) fn mark_acquired(&self) {
        let mut times = self.core.lock_times();
        times.acquired_at = Some(Instant::now());
    }

    pub(crate) fn mark_released(&self) {
        let mut times = self.core.lock_times();
        times.acquired_at = None;
        times.last_used = Instant::now();
    }

    fn touch(&self) {
        self.core.lock_times().last_used = Instant::now();
    }

    // Entering subscribe mode suspends request/reply pairing; every
    // subsequently decoded frame is routed to the push target.
    pub(crate) fn enter_subscribed_mode(&self, target: Weak<dyn PushDispatch>) {
        let mut shared = self.core.lock_shared();
        shared.push_target = Some(target);
        if !shared.broken {
            shared.status = ConnectionStatus::Subscribed;
        }
    }

    pub(crate) fn postprocess(
        &self,
        value: Value,
        decode_override: Option<bool>,
    ) -> RedisResult<Value> {
        self.core.encoder.postprocess(value, decode_override)
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.core.params)
    }
}

impl ConnCore {
    fn lock_shared(&self) -> MutexGuard<'_, SharedState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_hooks(&self) -> MutexGuard<'_, Vec<Weak<dyn ReconnectHook>>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_times(&self) -> MutexGuard<'_, Times> {
        self.times.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Routes one decoded value; returns false when the read task must
    // terminate.
    fn dispatch_value(self: &Arc<Self>, value: Value, generation: u64) -> bool {
        let mut shared = self.lock_shared();
        if shared.generation != generation {
            return false;
        }
        if shared.status == ConnectionStatus::Subscribed {
            let target = shared.push_target.clone();
            drop(shared);
            match target.and_then(|weak| weak.upgrade()) {
                Some(dispatch) => match dispatch.dispatch_push(value) {
                    DispatchOutcome::Continue => {}
                    DispatchOutcome::SubscriptionsEmpty => {
                        let mut shared = self.lock_shared();
                        if shared.generation == generation {
                            shared.status = ConnectionStatus::Ready;
                            shared.push_target = None;
                        }
                    }
                },
                None => {
                    trace!("push message dropped, the subscriber is gone");
                }
            }
            return true;
        }
        match shared.pending.pop_front() {
            Some(mut request) => {
                let result = match value {
                    Value::Error { kind, message } => match request.options.take_parse_empty_as() {
                        Some(sentinel) => Ok(sentinel),
                        None => Err(RedisError::from_server(&kind, &message)),
                    },
                    value => Ok(value),
                };
                drop(shared);
                // a failed send means the caller cancelled; the reply is
                // discarded and the connection stays usable
                request.tx.send(result).ok();
                true
            }
            None => {
                drop(shared);
                self.fail_connection(
                    generation,
                    RedisError::protocol(format!("unsolicited reply {value:?}")),
                );
                false
            }
        }
    }

    fn fail_connection(self: &Arc<Self>, generation: u64, error: RedisError) {
        let mut shared = self.lock_shared();
        if shared.generation != generation {
            return;
        }
        debug!("connection to {} failed: {}", self.params, error);
        shared.broken = true;
        shared.status = ConnectionStatus::Disconnected;
        let target = shared.push_target.take();
        fail_pending(&mut shared);
        drop(shared);
        if let Some(dispatch) = target.and_then(|weak| weak.upgrade()) {
            dispatch.connection_lost();
        }
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.lock_shared().generation != generation
    }
}

impl Drop for ConnCore {
    fn drop(&mut self) {
        trace!("Drop of connection to {}", self.params);
    }
}

fn fail_pending(shared: &mut SharedState) {
    for request in shared.pending.drain(..) {
        request.tx.send(Err(RedisError::ConnectionClosed)).ok();
    }
}

fn startup_error(e: RedisError) -> RedisError {
    if e.is_connection_error() {
        e
    } else {
        RedisError::Connect {
            source: Box::new(e),
        }
    }
}

async fn write_frame(
    writer: &mut TransportWriter,
    frame: &[u8],
    timeout: Option<Duration>,
) -> RedisResult<()> {
    let write_all = async {
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    };
    match timeout {
        Some(deadline) => match tokio::time::timeout(deadline, write_all).await {
            Ok(written) => written.map_err(|e| {
                debug!("write failed: {}", e);
                RedisError::ConnectionClosed
            }),
            Err(_elapsed) => Err(RedisError::Timeout),
        },
        None => write_all.await.map_err(|e| {
            debug!("write failed: {}", e);
            RedisError::ConnectionClosed
        }),
    }
}

// Reads from the transport in chunks, feeds the parser, and routes every
// decoded value. The sole reader of the transport.
async fn read_loop(core: Arc<ConnCore>, mut reader: TransportReader, generation: u64) {
    trace!("read task started (generation {})", generation);
    let mut parser = Parser::new();
    let mut chunk = [0_u8; 16 * 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                core.fail_connection(generation, RedisError::ConnectionClosed);
                break;
            }
            Ok(n) => {
                parser.feed(&chunk[..n]);
                loop {
                    match parser.next() {
                        Ok(Some(value)) => {
                            if !core.dispatch_value(value, generation) {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            core.fail_connection(generation, e);
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                core.fail_connection(generation, e.into());
                break;
            }
        }
        if core.is_stale(generation) {
            trace!("read task for stale generation {} ends", generation);
            return;
        }
    }
    trace!("read task ended (generation {})", generation);
}
