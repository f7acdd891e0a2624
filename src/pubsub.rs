// The pub/sub multiplexer: maintains channel and pattern subscriptions
// over one connection, routes push messages to per-subscription handlers
// or a message stream, and survives reconnects.

use crate::{
    conn::{DispatchOutcome, PushDispatch},
    pool::{Pool, PooledConnection},
    protocol::{Command, CommandOptions, Value},
    Connection, ConnectionStatus, ReconnectHook, RedisError, RedisResult,
};
use debug_ignore::DebugIgnore;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::sync::mpsc;

/// A decoded pub/sub envelope (see the RESP2 push message shapes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PubSubMessage {
    /// A payload published to a channel this client subscribed to.
    Message {
        /// The channel the payload was published to.
        channel: Vec<u8>,
        /// The published bytes.
        payload: Vec<u8>,
    },
    /// A payload delivered via a pattern subscription.
    PMessage {
        /// The matching pattern.
        pattern: Vec<u8>,
        /// The channel the payload was published to.
        channel: Vec<u8>,
        /// The published bytes.
        payload: Vec<u8>,
    },
    /// Acknowledgment of a channel subscription.
    Subscribe {
        /// The channel.
        channel: Vec<u8>,
        /// Number of subscriptions the connection now holds.
        count: i64,
    },
    /// Acknowledgment of a channel unsubscription.
    Unsubscribe {
        /// The channel.
        channel: Vec<u8>,
        /// Number of subscriptions the connection still holds.
        count: i64,
    },
    /// Acknowledgment of a pattern subscription.
    PSubscribe {
        /// The pattern.
        pattern: Vec<u8>,
        /// Number of subscriptions the connection now holds.
        count: i64,
    },
    /// Acknowledgment of a pattern unsubscription.
    PUnsubscribe {
        /// The pattern.
        pattern: Vec<u8>,
        /// Number of subscriptions the connection still holds.
        count: i64,
    },
    /// Reply to a `PING` issued while subscribed (health-check pongs are
    /// consumed silently and never surface here).
    Pong {
        /// The echoed payload.
        payload: Vec<u8>,
    },
}

impl PubSubMessage {
    fn is_ack(&self) -> bool {
        matches!(
            self,
            Self::Subscribe { .. }
                | Self::Unsubscribe { .. }
                | Self::PSubscribe { .. }
                | Self::PUnsubscribe { .. }
        )
    }
}

/// A callback invoked for every message of one subscription.
///
/// Handlers run on the connection's read task and must not block.
pub type MessageHandler = Arc<dyn Fn(&PubSubMessage) + Send + Sync>;

/// A callback receiving the errors a running [`PubSub::run`] loop would
/// otherwise abort with.
pub type PubSubExceptionHandler = Box<dyn Fn(&RedisError) + Send>;

enum StreamItem {
    Msg(PubSubMessage),
    Lost,
    Failed(RedisError),
}

#[derive(Debug, Default)]
struct PubSubState {
    channels: HashMap<Vec<u8>, Option<DebugIgnore<MessageHandler>>>,
    patterns: HashMap<Vec<u8>, Option<DebugIgnore<MessageHandler>>>,
    pending_unsubscribe_channels: HashSet<Vec<u8>>,
    pending_unsubscribe_patterns: HashSet<Vec<u8>>,
    health_sentinel: Option<Vec<u8>>,
}

// Shared between the multiplexer and the connection's read task. The
// connection refers to this only through a weak pointer: the multiplexer
// owns the connection, never the other way around.
pub(crate) struct PubSubCore {
    state: Mutex<PubSubState>,
    tx: mpsc::UnboundedSender<StreamItem>,
    self_weak: Weak<PubSubCore>,
}

impl std::fmt::Debug for PubSubCore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PubSubCore").finish_non_exhaustive()
    }
}

impl PubSubCore {
    fn lock_state(&self) -> MutexGuard<'_, PubSubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_push(&self, value: Value) -> RedisResult<DispatchOutcome> {
        let mut items = value
            .into_array()
            .map_err(|_| pubsub_error("push frame is not an array"))?
            .into_iter();
        let kind = items
            .next()
            .ok_or_else(|| pubsub_error("empty push frame"))?
            .into_bytes()
            .map_err(|_| pubsub_error("push frame without a message type"))?;
        match kind.as_slice() {
            b"message" => {
                let channel = next_bytes(&mut items)?;
                let payload = next_bytes(&mut items)?;
                let handler = {
                    let state = self.lock_state();
                    state
                        .channels
                        .get(&channel)
                        .and_then(|h| h.as_ref().map(|h| Arc::clone(&h.0)))
                };
                let message = PubSubMessage::Message { channel, payload };
                match handler {
                    Some(handler) => handler(&message),
                    None => {
                        self.tx.send(StreamItem::Msg(message)).ok();
                    }
                }
                Ok(DispatchOutcome::Continue)
            }
            b"pmessage" => {
                let pattern = next_bytes(&mut items)?;
                let channel = next_bytes(&mut items)?;
                let payload = next_bytes(&mut items)?;
                let handler = {
                    let state = self.lock_state();
                    state
                        .patterns
                        .get(&pattern)
                        .and_then(|h| h.as_ref().map(|h| Arc::clone(&h.0)))
                };
                let message = PubSubMessage::PMessage {
                    pattern,
                    channel,
                    payload,
                };
                match handler {
                    Some(handler) => handler(&message),
                    None => {
                        self.tx.send(StreamItem::Msg(message)).ok();
                    }
                }
                Ok(DispatchOutcome::Continue)
            }
            b"subscribe" => {
                let channel = next_bytes(&mut items)?;
                let count = next_count(&mut items)?;
                self.tx
                    .send(StreamItem::Msg(PubSubMessage::Subscribe { channel, count }))
                    .ok();
                Ok(DispatchOutcome::Continue)
            }
            b"psubscribe" => {
                let pattern = next_bytes(&mut items)?;
                let count = next_count(&mut items)?;
                self.tx
                    .send(StreamItem::Msg(PubSubMessage::PSubscribe { pattern, count }))
                    .ok();
                Ok(DispatchOutcome::Continue)
            }
            b"unsubscribe" => {
                let channel = next_bytes(&mut items)?;
                let count = next_count(&mut items)?;
                let empty = {
                    let mut state = self.lock_state();
                    if state.pending_unsubscribe_channels.remove(&channel) {
                        state.channels.remove(&channel);
                    }
                    state.channels.is_empty() && state.patterns.is_empty()
                };
                self.tx
                    .send(StreamItem::Msg(PubSubMessage::Unsubscribe { channel, count }))
                    .ok();
                Ok(if empty {
                    DispatchOutcome::SubscriptionsEmpty
                } else {
                    DispatchOutcome::Continue
                })
            }
            b"punsubscribe" => {
                let pattern = next_bytes(&mut items)?;
                let count = next_count(&mut items)?;
                let empty = {
                    let mut state = self.lock_state();
                    if state.pending_unsubscribe_patterns.remove(&pattern) {
                        state.patterns.remove(&pattern);
                    }
                    state.channels.is_empty() && state.patterns.is_empty()
                };
                self.tx
                    .send(StreamItem::Msg(PubSubMessage::PUnsubscribe {
                        pattern,
                        count,
                    }))
                    .ok();
                Ok(if empty {
                    DispatchOutcome::SubscriptionsEmpty
                } else {
                    DispatchOutcome::Continue
                })
            }
            b"pong" => {
                let payload = match items.next() {
                    Some(v) => v.into_bytes().unwrap_or_default(),
                    None => Vec::new(),
                };
                let is_health_check = {
                    let mut state = self.lock_state();
                    if state.health_sentinel.as_deref() == Some(payload.as_slice()) {
                        state.health_sentinel = None;
                        true
                    } else {
                        false
                    }
                };
                if !is_health_check {
                    self.tx
                        .send(StreamItem::Msg(PubSubMessage::Pong { payload }))
                        .ok();
                }
                Ok(DispatchOutcome::Continue)
            }
            other => Err(pubsub_error(format!(
                "unknown push message type {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

impl PushDispatch for PubSubCore {
    fn dispatch_push(&self, value: Value) -> DispatchOutcome {
        match self.handle_push(value) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("pub/sub dispatch failed: {}", e);
                self.tx.send(StreamItem::Failed(e)).ok();
                DispatchOutcome::Continue
            }
        }
    }

    fn connection_lost(&self) {
        self.tx.send(StreamItem::Lost).ok();
    }
}

#[async_trait::async_trait]
impl ReconnectHook for PubSubCore {
    // Re-subscribe to everything previously subscribed to; the pending
    // unsubscribe sets are cleared since the new session has no memory of
    // them.
    async fn on_reconnect(&self, conn: &Connection) -> RedisResult<()> {
        let (channels, patterns) = {
            let mut state = self.lock_state();
            state.pending_unsubscribe_channels.clear();
            state.pending_unsubscribe_patterns.clear();
            (
                state.channels.keys().cloned().collect::<Vec<Vec<u8>>>(),
                state.patterns.keys().cloned().collect::<Vec<Vec<u8>>>(),
            )
        };
        if channels.is_empty() && patterns.is_empty() {
            return Ok(());
        }
        debug!(
            "resubscribing to {} channels and {} patterns",
            channels.len(),
            patterns.len()
        );
        conn.enter_subscribed_mode(self.self_weak.clone());
        if !channels.is_empty() {
            let mut cmd = Command::new("SUBSCRIBE");
            for channel in channels {
                cmd = cmd.arg(channel)?;
            }
            conn.send_push_command(&cmd).await?;
        }
        if !patterns.is_empty() {
            let mut cmd = Command::new("PSUBSCRIBE");
            for pattern in patterns {
                cmd = cmd.arg(pattern)?;
            }
            conn.send_push_command(&cmd).await?;
        }
        Ok(())
    }
}

/// Publish/subscribe over one pooled connection.
///
/// Subscriptions registered with a handler are dispatched to that handler
/// on arrival; handler-less subscriptions deliver through
/// [`next_message`](PubSub::next_message). Subscriptions survive
/// reconnects: the multiplexer re-issues `SUBSCRIBE`/`PSUBSCRIBE` for its
/// entire state after the connection comes back.
#[derive(Debug)]
pub struct PubSub {
    pool: Pool,
    core: Arc<PubSubCore>,
    rx: mpsc::UnboundedReceiver<StreamItem>,
    conn: Option<PooledConnection>,
    ignore_subscribe_messages: bool,
}

impl PubSub {
    pub(crate) fn new(pool: Pool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = Arc::new_cyclic(|self_weak| PubSubCore {
            state: Mutex::new(PubSubState::default()),
            tx,
            self_weak: self_weak.clone(),
        });
        Self {
            pool,
            core,
            rx,
            conn: None,
            ignore_subscribe_messages: false,
        }
    }

    /// Builder-method: suppress subscription acknowledgments in the
    /// message stream.
    #[must_use]
    pub fn with_ignore_subscribe_messages(mut self, ignore: bool) -> Self {
        self.ignore_subscribe_messages = ignore;
        self
    }

    /// Whether any channel or pattern subscription is registered.
    #[must_use]
    pub fn subscribed(&self) -> bool {
        let state = self.core.lock_state();
        !state.channels.is_empty() || !state.patterns.is_empty()
    }

    /// The currently subscribed channel names.
    #[must_use]
    pub fn channels(&self) -> Vec<Vec<u8>> {
        self.core.lock_state().channels.keys().cloned().collect()
    }

    /// The currently subscribed patterns.
    #[must_use]
    pub fn patterns(&self) -> Vec<Vec<u8>> {
        self.core.lock_state().patterns.keys().cloned().collect()
    }

    /// Subscribes to channels whose messages are delivered via
    /// [`next_message`](PubSub::next_message).
    ///
    /// # Errors
    ///
    /// Pool and connection errors.
    pub async fn subscribe<C, I>(&mut self, channels: I) -> RedisResult<()>
    where
        C: Into<Vec<u8>>,
        I: IntoIterator<Item = C>,
    {
        let entries = channels
            .into_iter()
            .map(|c| (c.into(), None))
            .collect::<Vec<(Vec<u8>, Option<MessageHandler>)>>();
        self.subscribe_entries(entries, false).await
    }

    /// Subscribes to one channel with a handler that is invoked for every
    /// message instead of delivering through the stream.
    ///
    /// # Errors
    ///
    /// Pool and connection errors.
    pub async fn subscribe_with<C: Into<Vec<u8>>>(
        &mut self,
        channel: C,
        handler: MessageHandler,
    ) -> RedisResult<()> {
        self.subscribe_entries(vec![(channel.into(), Some(handler))], false)
            .await
    }

    /// Subscribes to glob patterns whose messages are delivered via
    /// [`next_message`](PubSub::next_message).
    ///
    /// # Errors
    ///
    /// Pool and connection errors.
    pub async fn psubscribe<P, I>(&mut self, patterns: I) -> RedisResult<()>
    where
        P: Into<Vec<u8>>,
        I: IntoIterator<Item = P>,
    {
        let entries = patterns
            .into_iter()
            .map(|p| (p.into(), None))
            .collect::<Vec<(Vec<u8>, Option<MessageHandler>)>>();
        self.subscribe_entries(entries, true).await
    }

    /// Subscribes to one glob pattern with a handler.
    ///
    /// # Errors
    ///
    /// Pool and connection errors.
    pub async fn psubscribe_with<P: Into<Vec<u8>>>(
        &mut self,
        pattern: P,
        handler: MessageHandler,
    ) -> RedisResult<()> {
        self.subscribe_entries(vec![(pattern.into(), Some(handler))], true)
            .await
    }

    /// Unsubscribes from the given channels.
    ///
    /// Messages arriving before the server acknowledges are still
    /// delivered.
    ///
    /// # Errors
    ///
    /// Connection errors.
    pub async fn unsubscribe<C, I>(&mut self, channels: I) -> RedisResult<()>
    where
        C: Into<Vec<u8>>,
        I: IntoIterator<Item = C>,
    {
        let names = channels
            .into_iter()
            .map(Into::into)
            .collect::<Vec<Vec<u8>>>();
        self.unsubscribe_entries(names, false).await
    }

    /// Unsubscribes from all channels.
    ///
    /// # Errors
    ///
    /// Connection errors.
    pub async fn unsubscribe_all(&mut self) -> RedisResult<()> {
        self.unsubscribe_entries(Vec::new(), false).await
    }

    /// Unsubscribes from the given patterns.
    ///
    /// # Errors
    ///
    /// Connection errors.
    pub async fn punsubscribe<P, I>(&mut self, patterns: I) -> RedisResult<()>
    where
        P: Into<Vec<u8>>,
        I: IntoIterator<Item = P>,
    {
        let names = patterns
            .into_iter()
            .map(Into::into)
            .collect::<Vec<Vec<u8>>>();
        self.unsubscribe_entries(names, true).await
    }

    /// Unsubscribes from all patterns.
    ///
    /// # Errors
    ///
    /// Connection errors.
    pub async fn punsubscribe_all(&mut self) -> RedisResult<()> {
        self.unsubscribe_entries(Vec::new(), true).await
    }

    /// Sends `PING` over the subscribed connection; the reply surfaces as
    /// [`PubSubMessage::Pong`] in the stream.
    ///
    /// # Errors
    ///
    /// Connection errors.
    pub async fn ping(&mut self, payload: Option<&[u8]>) -> RedisResult<()> {
        let conn = self.ensure_conn().await?;
        let mut cmd = Command::new("PING");
        if let Some(payload) = payload {
            cmd = cmd.arg(payload)?;
        }
        if conn.status() == ConnectionStatus::Subscribed {
            self.send_pubsub(&conn, &cmd).await
        } else {
            // outside subscribe mode the reply pairs normally
            conn.send_once(&cmd, &CommandOptions::default())
                .await
                .map(|_| ())
        }
    }

    /// The next message, subscription acknowledgment, or pong.
    ///
    /// Returns `None` when the timeout expires. On a lost connection the
    /// multiplexer reconnects (re-subscribing to its entire state) and
    /// keeps waiting.
    ///
    /// # Errors
    ///
    /// `RedisError::Usage` before the first subscription; reconnect
    /// errors; `RedisError::PubSub` for protocol violations.
    pub async fn next_message(
        &mut self,
        timeout: Option<Duration>,
    ) -> RedisResult<Option<PubSubMessage>> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            self.check_health().await?;
            let item = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                        Ok(item) => item,
                        Err(_elapsed) => return Ok(None),
                    }
                }
                None => self.rx.recv().await,
            };
            match item {
                Some(StreamItem::Msg(message)) => {
                    if self.ignore_subscribe_messages && message.is_ack() {
                        continue;
                    }
                    return Ok(Some(message));
                }
                Some(StreamItem::Failed(e)) => return Err(e),
                Some(StreamItem::Lost) => {
                    if !self.subscribed() {
                        return Err(RedisError::ConnectionClosed);
                    }
                    debug!("pub/sub connection lost, reconnecting");
                    self.reconnect().await?;
                }
                None => return Err(RedisError::ConnectionClosed),
            }
        }
    }

    /// Drives the registered handlers indefinitely.
    ///
    /// Every subscription must carry a handler. Errors abort the loop, or
    /// are passed to `exception_handler` if one is given.
    ///
    /// # Errors
    ///
    /// `RedisError::PubSub` when a subscription has no handler; any error
    /// of the underlying stream when no exception handler is installed.
    pub async fn run(
        &mut self,
        exception_handler: Option<PubSubExceptionHandler>,
    ) -> RedisResult<()> {
        {
            let state = self.core.lock_state();
            for (channel, handler) in &state.channels {
                if handler.is_none() {
                    return Err(pubsub_error(format!(
                        "channel {:?} has no handler registered",
                        String::from_utf8_lossy(channel)
                    )));
                }
            }
            for (pattern, handler) in &state.patterns {
                if handler.is_none() {
                    return Err(pubsub_error(format!(
                        "pattern {:?} has no handler registered",
                        String::from_utf8_lossy(pattern)
                    )));
                }
            }
        }
        loop {
            match self.next_message(Some(Duration::from_secs(1))).await {
                // handler subscriptions were dispatched on arrival; stream
                // items here are acknowledgments and pongs
                Ok(_) => {}
                Err(e) => match exception_handler {
                    Some(ref handler) => handler(&e),
                    None => return Err(e),
                },
            }
            tokio::task::yield_now().await;
        }
    }

    /// Unsubscribes implicitly by disconnecting, clears all subscription
    /// state, and gives the connection up.
    pub async fn reset(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.disconnect().await;
            // dropping the guard destroys the broken connection
        }
        let mut state = self.core.lock_state();
        state.channels.clear();
        state.patterns.clear();
        state.pending_unsubscribe_channels.clear();
        state.pending_unsubscribe_patterns.clear();
        state.health_sentinel = None;
    }

    /// Alias of [`reset`](PubSub::reset).
    pub async fn close(&mut self) {
        self.reset().await;
    }

    async fn subscribe_entries(
        &mut self,
        entries: Vec<(Vec<u8>, Option<MessageHandler>)>,
        is_pattern: bool,
    ) -> RedisResult<()> {
        if entries.is_empty() {
            return Err(RedisError::Usage("subscribe requires at least one name"));
        }
        let conn = self.ensure_conn().await?;
        // flip into push dispatch before the write so that the
        // acknowledgments are never paired with pending requests
        conn.enter_subscribed_mode(self.core.self_weak.clone());
        let mut cmd = Command::new(if is_pattern { "PSUBSCRIBE" } else { "SUBSCRIBE" });
        for (name, _) in &entries {
            cmd = cmd.arg(name.as_slice())?;
        }
        self.send_pubsub(&conn, &cmd).await?;
        // update the maps after the send; the reconnect hook would
        // otherwise subscribe twice
        let mut state = self.core.lock_state();
        for (name, handler) in entries {
            if is_pattern {
                state.pending_unsubscribe_patterns.remove(&name);
                state.patterns.insert(name, handler.map(DebugIgnore));
            } else {
                state.pending_unsubscribe_channels.remove(&name);
                state.channels.insert(name, handler.map(DebugIgnore));
            }
        }
        Ok(())
    }

    async fn unsubscribe_entries(
        &mut self,
        names: Vec<Vec<u8>>,
        is_pattern: bool,
    ) -> RedisResult<()> {
        let Some(guard) = self.conn.as_ref() else {
            return Ok(());
        };
        if guard.status() != ConnectionStatus::Subscribed {
            // nothing is subscribed on the wire; the server would not
            // push acknowledgments we could reconcile
            return Ok(());
        }
        {
            let mut state = self.core.lock_state();
            if is_pattern {
                let pending = if names.is_empty() {
                    state.patterns.keys().cloned().collect::<Vec<Vec<u8>>>()
                } else {
                    names.clone()
                };
                state.pending_unsubscribe_patterns.extend(pending);
            } else {
                let pending = if names.is_empty() {
                    state.channels.keys().cloned().collect::<Vec<Vec<u8>>>()
                } else {
                    names.clone()
                };
                state.pending_unsubscribe_channels.extend(pending);
            }
        }
        let conn = self.held_connection();
        let mut cmd = Command::new(if is_pattern {
            "PUNSUBSCRIBE"
        } else {
            "UNSUBSCRIBE"
        });
        for name in &names {
            cmd = cmd.arg(name.as_slice())?;
        }
        self.send_pubsub(&conn, &cmd).await
    }

    // Sends a pub/sub command; on a lost connection, reconnects (the
    // hook re-subscribes the registered state) and repeats the command
    // once.
    async fn send_pubsub(&self, conn: &Connection, cmd: &Command) -> RedisResult<()> {
        match conn.send_push_command(cmd).await {
            Err(e) if e.is_connection_error() || e.is_timeout() => {
                debug!("pub/sub send failed ({}), reconnecting", e);
                conn.reconnect().await?;
                conn.send_push_command(cmd).await
            }
            other => other,
        }
    }

    async fn check_health(&mut self) -> RedisResult<()> {
        let Some(guard) = self.conn.as_ref() else {
            return Err(RedisError::Usage(
                "pub/sub connection not set: did you forget to subscribe?",
            ));
        };
        if guard.health_check_due() && self.subscribed() {
            let sentinel = format!("healthcheck-{:016x}", rand::random::<u64>()).into_bytes();
            self.core.lock_state().health_sentinel = Some(sentinel.clone());
            let cmd = Command::new("PING").arg(sentinel)?;
            let conn = self.held_connection();
            self.send_pubsub(&conn, &cmd).await?;
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> RedisResult<()> {
        let conn = self.held_connection();
        conn.reconnect().await
    }

    async fn ensure_conn(&mut self) -> RedisResult<Connection> {
        if self.conn.is_none() {
            let guard = self.pool.acquire().await?;
            let core_dyn: Arc<dyn ReconnectHook> = self.core.clone();
            let hook: Weak<dyn ReconnectHook> = Arc::downgrade(&core_dyn);
            guard.register_reconnect_hook(hook);
            self.conn = Some(guard);
        }
        Ok(self.held_connection())
    }

    fn held_connection(&self) -> Connection {
        match self.conn {
            Some(ref guard) => (**guard).clone(),
            None => unreachable!("pub/sub without a held connection"),
        }
    }
}

fn pubsub_error<S: Into<String>>(reason: S) -> RedisError {
    RedisError::PubSub {
        reason: reason.into(),
    }
}

fn next_bytes(items: &mut std::vec::IntoIter<Value>) -> RedisResult<Vec<u8>> {
    items
        .next()
        .ok_or_else(|| pubsub_error("truncated push frame"))?
        .into_bytes()
        .map_err(|_| pubsub_error("unexpected element type in push frame"))
}

fn next_count(items: &mut std::vec::IntoIter<Value>) -> RedisResult<i64> {
    items
        .next()
        .and_then(|v| v.as_integer())
        .ok_or_else(|| pubsub_error("push frame without a subscription count"))
}
