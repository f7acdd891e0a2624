// The bounded connection pool: amortizes connection cost, bounds
// concurrency, provides fair FIFO waiting under contention.

use crate::{
    conn::cp_url,
    pipeline::Pipeline,
    protocol::{Arg, CommandOptions, Value},
    pubsub::PubSub,
    ConnectParams, Connection, ConnectionConfiguration, ConnectionStatus, IntoConnectParams,
    RedisError, RedisResult,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::oneshot;

// docu is written at the re-export in lib.rs
#[derive(Debug, Clone)]
pub struct PoolConfiguration {
    min_size: usize,
    max_size: usize,
    acquire_timeout: Option<Duration>,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            min_size: Self::DEFAULT_MIN_SIZE,
            max_size: Self::DEFAULT_MAX_SIZE,
            acquire_timeout: None,
        }
    }
}

impl PoolConfiguration {
    /// Default number of connections the pool establishes eagerly.
    pub const DEFAULT_MIN_SIZE: usize = 1;

    /// Default upper bound on the number of connections.
    pub const DEFAULT_MAX_SIZE: usize = 10;

    /// Returns the number of connections the pool establishes eagerly
    /// and tries to keep around.
    #[must_use]
    pub fn min_size(&self) -> usize {
        self.min_size
    }
    /// Sets the number of connections the pool establishes eagerly.
    pub fn set_min_size(&mut self, min_size: usize) {
        self.min_size = min_size;
    }
    /// Builder-method for setting the number of connections the pool
    /// establishes eagerly.
    #[must_use]
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Returns the upper bound on the number of connections.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }
    /// Sets the upper bound on the number of connections.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }
    /// Builder-method for setting the upper bound on the number of
    /// connections.
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Returns the deadline for waiting on an exhausted pool.
    #[must_use]
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout
    }
    /// Sets the deadline for waiting on an exhausted pool; `None` waits
    /// indefinitely.
    pub fn set_acquire_timeout(&mut self, t: Option<Duration>) {
        self.acquire_timeout = t;
    }
    /// Builder-method for setting the deadline for waiting on an
    /// exhausted pool.
    #[must_use]
    pub fn with_acquire_timeout(mut self, t: Option<Duration>) -> Self {
        self.acquire_timeout = t;
        self
    }
}

// What a blocked acquirer receives from a release: either a connection
// that is ready to use, or the permission to construct a new one.
#[derive(Debug)]
enum WaiterGift {
    Ready(PooledConnection),
    Slot,
}

#[derive(Debug)]
struct PoolState {
    free: VecDeque<Connection>,
    in_use: usize,
    // constructed connections whose disconnect has not yet completed
    live: usize,
    waiters: VecDeque<oneshot::Sender<WaiterGift>>,
    closed: bool,
}

struct PoolInner {
    params: ConnectParams,
    config: ConnectionConfiguration,
    pool_config: PoolConfiguration,
    state: Mutex<PoolState>,
    drained: tokio::sync::Notify,
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PoolInner")
            .field("params", &self.params)
            .field("pool_config", &self.pool_config)
            .finish_non_exhaustive()
    }
}

/// A bounded set of [`Connection`]s to one server.
///
/// `acquire` hands out an idle connection, creates a new one while the
/// pool is below its maximum size, and otherwise blocks in FIFO order
/// until a connection is released. Cheap to clone; clones share the pool.
#[derive(Clone, Debug)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Creates a pool and eagerly establishes `min_size` connections.
    ///
    /// # Errors
    ///
    /// `RedisError::Usage` for inconsistent bounds; any connect error of
    /// the eager connections.
    pub async fn new<P: IntoConnectParams>(
        p: P,
        config: ConnectionConfiguration,
        pool_config: PoolConfiguration,
    ) -> RedisResult<Pool> {
        let params = p.into_connect_params()?;
        if pool_config.max_size() == 0 || pool_config.min_size() > pool_config.max_size() {
            return Err(RedisError::Usage(
                "pool bounds must satisfy 0 < max_size and min_size <= max_size",
            ));
        }
        let pool = Pool {
            inner: Arc::new(PoolInner {
                params,
                config,
                pool_config,
                state: Mutex::new(PoolState {
                    free: VecDeque::new(),
                    in_use: 0,
                    live: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
                drained: tokio::sync::Notify::new(),
            }),
        };
        for _ in 0..pool.inner.pool_config.min_size() {
            match Connection::connect(pool.inner.params.clone(), pool.inner.config.clone()).await {
                Ok(conn) => {
                    let mut state = pool.lock_state();
                    state.live += 1;
                    state.free.push_back(conn);
                }
                Err(e) => {
                    pool.close().await;
                    return Err(e);
                }
            }
        }
        debug!(
            "pool for {} is initialized with {} connections (max {})",
            pool.inner.params,
            pool.inner.pool_config.min_size(),
            pool.inner.pool_config.max_size()
        );
        Ok(pool)
    }

    /// Creates a pool from a connection URL (see module
    /// [`url`](crate::url)).
    ///
    /// # Errors
    ///
    /// `RedisError::ConnParams` for malformed URLs; any connect error of
    /// the eager connections.
    pub async fn from_url<S: AsRef<str>>(url: S) -> RedisResult<Pool> {
        let parsed = cp_url::parse_url(url.as_ref())?;
        Self::new(parsed.params, parsed.config, parsed.pool).await
    }

    /// The parameters the pool's connections are created with.
    #[must_use]
    pub fn connect_params(&self) -> &ConnectParams {
        &self.inner.params
    }

    /// The per-connection configuration.
    #[must_use]
    pub fn connection_configuration(&self) -> &ConnectionConfiguration {
        &self.inner.config
    }

    /// Number of idle connections.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.lock_state().free.len()
    }

    /// Number of connections currently handed out.
    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.lock_state().in_use
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Obtains a connection: an idle one if available, a new one while
    /// the pool is below `max_size`, otherwise blocks in FIFO order until
    /// a connection is released.
    ///
    /// # Errors
    ///
    /// `RedisError::PoolClosed` on a closed pool, `RedisError::PoolTimeout`
    /// when the configured `acquire_timeout` expires, any connect error
    /// when a new connection has to be established.
    pub async fn acquire(&self) -> RedisResult<PooledConnection> {
        self.acquire_with_hint(None).await
    }

    /// Like [`acquire`](Pool::acquire), with an opaque routing hint.
    ///
    /// The hint is reserved for sharding layers built on top of this
    /// pool; the core pool ignores it.
    ///
    /// # Errors
    ///
    /// See [`acquire`](Pool::acquire).
    pub async fn acquire_with_hint(&self, hint: Option<&str>) -> RedisResult<PooledConnection> {
        if let Some(hint) = hint {
            trace!("acquire hint {:?} is ignored by the core pool", hint);
        }
        match self.inner.pool_config.acquire_timeout() {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.acquire_inner()).await {
                    Ok(acquired) => acquired,
                    Err(_elapsed) => Err(RedisError::PoolTimeout),
                }
            }
            None => self.acquire_inner().await,
        }
    }

    async fn acquire_inner(&self) -> RedisResult<PooledConnection> {
        enum Plan {
            Reuse(Connection),
            Create,
            Wait(oneshot::Receiver<WaiterGift>),
        }
        loop {
            let plan = {
                let mut state = self.lock_state();
                if state.closed {
                    return Err(RedisError::PoolClosed);
                }
                if let Some(conn) = state.free.pop_front() {
                    state.in_use += 1;
                    Plan::Reuse(conn)
                } else if state.free.len() + state.in_use < self.inner.pool_config.max_size() {
                    state.in_use += 1;
                    Plan::Create
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Plan::Wait(rx)
                }
            };
            match plan {
                Plan::Reuse(conn) => {
                    if conn.is_broken() {
                        self.destroy(conn);
                        continue;
                    }
                    if conn.health_check_due() {
                        if let Err(e) = conn.ping_probe().await {
                            debug!("health check failed, discarding connection: {}", e);
                            self.destroy(conn);
                            continue;
                        }
                    }
                    conn.mark_acquired();
                    return Ok(PooledConnection::new(self.clone(), conn));
                }
                Plan::Create => return self.create_for_slot().await,
                Plan::Wait(rx) => match rx.await {
                    Ok(WaiterGift::Ready(guard)) => return Ok(guard),
                    Ok(WaiterGift::Slot) => return self.create_for_slot().await,
                    // the pool was closed while waiting
                    Err(_) => return Err(RedisError::PoolClosed),
                },
            }
        }
    }

    // The caller owns one capacity slot (already counted as in_use).
    async fn create_for_slot(&self) -> RedisResult<PooledConnection> {
        match Connection::connect(self.inner.params.clone(), self.inner.config.clone()).await {
            Ok(conn) => {
                self.lock_state().live += 1;
                conn.mark_acquired();
                Ok(PooledConnection::new(self.clone(), conn))
            }
            Err(e) => {
                self.forfeit_slot();
                Err(e)
            }
        }
    }

    // A connection left the pool for good via `into_inner`.
    fn note_detached(&self) {
        let mut state = self.lock_state();
        state.in_use -= 1;
        state.live -= 1;
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(WaiterGift::Slot).is_ok() {
                state.in_use += 1;
                break;
            }
        }
        drop(state);
        self.inner.drained.notify_waiters();
    }

    // Gives the capacity slot back, handing it to the oldest live waiter
    // if there is one.
    fn forfeit_slot(&self) {
        let mut state = self.lock_state();
        state.in_use -= 1;
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(WaiterGift::Slot).is_ok() {
                state.in_use += 1;
                return;
            }
        }
        drop(state);
        self.inner.drained.notify_waiters();
    }

    /// Returns a connection to the pool.
    ///
    /// Dropping the [`PooledConnection`] guard has the same effect; this
    /// method exists to make the release explicit.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    // Invoked by the guard: refile the connection, or destroy it if it is
    // in an unrecoverable state.
    fn release_inner(&self, conn: Connection) {
        conn.mark_released();
        let destroy = {
            let state = self.lock_state();
            state.closed || conn.is_broken() || conn.status() == ConnectionStatus::Subscribed
        };
        if destroy {
            self.destroy(conn);
            return;
        }
        let mut state = self.lock_state();
        // hand the connection to the oldest live waiter; in_use stays
        // constant, ownership transfers
        while let Some(waiter) = state.waiters.pop_front() {
            conn.mark_acquired();
            let gift = PooledConnection::new(self.clone(), conn.clone());
            match waiter.send(WaiterGift::Ready(gift)) {
                Ok(()) => return,
                Err(returned) => {
                    // the waiter is gone; disarm the returned guard so it
                    // does not re-release under the lock we hold
                    if let WaiterGift::Ready(guard) = returned {
                        guard.disarm();
                    }
                }
            }
        }
        // undo the acquired-marking of failed gift attempts
        conn.mark_released();
        state.in_use -= 1;
        state.free.push_back(conn);
        drop(state);
        self.inner.drained.notify_waiters();
    }

    // Destroys a handed-out connection: frees its capacity slot and
    // disconnects in the background.
    fn destroy(&self, conn: Connection) {
        trace!("destroying connection to {}", self.inner.params);
        {
            let mut state = self.lock_state();
            state.in_use -= 1;
            while let Some(waiter) = state.waiters.pop_front() {
                if waiter.send(WaiterGift::Slot).is_ok() {
                    state.in_use += 1;
                    break;
                }
            }
        }
        self.retire(conn);
        self.maybe_replenish();
    }

    // Disconnects in the background and completes the drain bookkeeping.
    fn retire(&self, conn: Connection) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            conn.disconnect().await;
            inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .live -= 1;
            inner.drained.notify_waiters();
        });
    }

    // Keeps the pool at min_size after a connection was destroyed.
    fn maybe_replenish(&self) {
        let needed = {
            let state = self.lock_state();
            !state.closed
                && state.waiters.is_empty()
                && state.free.len() + state.in_use < self.inner.pool_config.min_size()
        };
        if needed {
            let pool = self.clone();
            tokio::spawn(async move {
                match Connection::connect(pool.inner.params.clone(), pool.inner.config.clone())
                    .await
                {
                    Ok(conn) => {
                        let mut state = pool.lock_state();
                        if state.closed {
                            drop(state);
                            pool.retire_unpooled(conn);
                        } else {
                            state.live += 1;
                            state.free.push_back(conn);
                        }
                    }
                    Err(e) => warn!("replenishing the pool failed: {}", e),
                }
            });
        }
    }

    // Disconnect a connection that was never counted as live.
    fn retire_unpooled(&self, conn: Connection) {
        tokio::spawn(async move {
            conn.disconnect().await;
        });
    }

    /// Convenience: acquire, send one command, release.
    ///
    /// The release happens after the reply arrived (or failed).
    ///
    /// # Errors
    ///
    /// See [`acquire`](Pool::acquire) and
    /// [`Connection::send_command`](crate::Connection::send_command).
    pub async fn execute<S: AsRef<str>>(
        &self,
        name: S,
        args: Vec<Arg>,
        options: CommandOptions,
    ) -> RedisResult<Value> {
        let conn = self.acquire().await?;
        conn.execute(name, args, options).await
    }

    /// Creates a pipeline over this pool.
    ///
    /// With `transactional` set, the batch is wrapped in `MULTI`/`EXEC`
    /// on execute.
    #[must_use]
    pub fn pipeline(&self, transactional: bool) -> Pipeline {
        Pipeline::new(self.clone(), transactional)
    }

    /// Creates a pub/sub multiplexer over this pool.
    #[must_use]
    pub fn pubsub(&self) -> PubSub {
        PubSub::new(self.clone())
    }

    /// Marks the pool terminal: disconnects all idle connections, fails
    /// every waiter with `RedisError::PoolClosed`. Connections currently
    /// handed out are destroyed on release. Idempotent.
    pub async fn close(&self) {
        debug!("closing pool for {}", self.inner.params);
        let (free, waiters) = {
            let mut state = self.lock_state();
            state.closed = true;
            (
                state.free.drain(..).collect::<Vec<Connection>>(),
                state.waiters.drain(..).collect::<Vec<oneshot::Sender<WaiterGift>>>(),
            )
        };
        // dropping the senders fails the waiters
        drop(waiters);
        for conn in free {
            self.retire(conn);
        }
        self.inner.drained.notify_waiters();
    }

    /// Resolves when the pool is closed and all its connections have
    /// fully drained.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.inner.drained.notified();
            {
                let state = self.lock_state();
                if state.closed && state.live == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A connection handed out by a [`Pool`].
///
/// Dereferences to [`Connection`]; dropping the guard returns the
/// connection to the pool (or destroys it if it is broken or still in
/// subscribe mode).
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Pool,
}

impl PooledConnection {
    fn new(pool: Pool, conn: Connection) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// Detaches the connection from the pool; the caller takes over the
    /// responsibility to disconnect it.
    ///
    /// The pool's capacity slot is freed.
    #[must_use]
    pub fn into_inner(self) -> Connection {
        let (conn, pool) = self.disarm();
        pool.note_detached();
        conn
    }

    // Takes the connection out without any pool bookkeeping.
    fn disarm(mut self) -> (Connection, Pool) {
        let pool = self.pool.clone();
        match self.conn.take() {
            Some(conn) => (conn, pool),
            None => unreachable!("guard without connection"),
        }
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        match self.conn {
            Some(ref conn) => conn,
            None => unreachable!("guard without connection"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release_inner(conn);
        }
    }
}
