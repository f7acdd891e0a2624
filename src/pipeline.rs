// The pipeline / transaction engine: batches commands on one connection,
// collects their replies in order, and optionally wraps the batch in
// MULTI/EXEC while honoring WATCH optimistic locking.

use crate::{
    pool::{Pool, PooledConnection},
    protocol::{Arg, Command, CommandOptions, Value},
    Connection, RedisError, RedisResult,
};
use sha1::{Digest, Sha1};

/// A Lua script with its precomputed SHA-1 digest.
///
/// Register scripts on a [`Pipeline`] to have them preloaded into the
/// server's script cache before the batch is flushed, or invoke them
/// directly with [`Script::eval`].
#[derive(Clone, Debug)]
pub struct Script {
    body: String,
    sha: String,
}

impl Script {
    /// Creates a script and computes its SHA-1 digest.
    #[must_use]
    pub fn new<S: AsRef<str>>(body: S) -> Self {
        let body = body.as_ref().to_string();
        let sha = sha1_hex(body.as_bytes());
        Self { body, sha }
    }

    /// The script source.
    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }

    /// The lowercase hex SHA-1 under which the server caches the script.
    #[must_use]
    pub fn sha(&self) -> &str {
        &self.sha
    }

    /// Invokes the script via `EVALSHA`; when the server reports the
    /// script as unknown, loads it with `SCRIPT LOAD` and retries once.
    ///
    /// # Errors
    ///
    /// See [`Connection::send_command`](crate::Connection::send_command).
    pub async fn eval(
        &self,
        conn: &Connection,
        keys: &[&str],
        args: Vec<Arg>,
    ) -> RedisResult<Value> {
        match conn
            .send_command(self.evalsha_command(keys, args.clone())?, CommandOptions::default())
            .await
        {
            Err(RedisError::NoScript { .. }) => {
                debug!("script {} is not cached, loading it", self.sha);
                conn.send_command(
                    Command::new("SCRIPT LOAD").arg(self.body.as_str())?,
                    CommandOptions::default().with_decode(false),
                )
                .await?;
                conn.send_command(self.evalsha_command(keys, args)?, CommandOptions::default())
                    .await
            }
            other => other,
        }
    }

    fn evalsha_command(
        &self,
        keys: &[&str],
        args: Vec<Arg>,
    ) -> RedisResult<Command> {
        let mut cmd = Command::new("EVALSHA")
            .arg(self.sha.as_str())?
            .arg(keys.len())?;
        for key in keys {
            cmd = cmd.arg(*key)?;
        }
        for arg in args {
            cmd = cmd.arg(arg)?;
        }
        Ok(cmd)
    }
}

fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(40);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// The explicit states of the pipeline's MULTI/EXEC mini-protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    /// Commands are appended to the buffer.
    Buffering,
    /// `WATCH` was issued; commands execute immediately on the held
    /// connection until [`multi`](Pipeline::multi) is called.
    Watching,
    /// `multi()` was called; commands are buffered for the transaction.
    Queuing,
}

/// Buffers a command sequence and flushes it as one contiguous write.
///
/// In transactional mode the batch is wrapped in `MULTI`/`EXEC`; the
/// `WATCH` → reads → `multi()` → writes → `execute()` sequence implements
/// the optimistic-locking recipe. A pipeline holds its connection
/// exclusively from the first immediate command until `execute` completes
/// or the pipeline is reset.
#[derive(Debug)]
pub struct Pipeline {
    pool: Pool,
    transactional: bool,
    state: PipelineState,
    // WATCH is in effect on the server until EXEC/UNWATCH/DISCARD, also
    // while queuing
    watching: bool,
    buffer: Vec<(Command, CommandOptions)>,
    scripts: Vec<Script>,
    conn: Option<PooledConnection>,
}

impl Pipeline {
    pub(crate) fn new(pool: Pool, transactional: bool) -> Self {
        Self {
            pool,
            transactional,
            state: PipelineState::Buffering,
            watching: false,
            buffer: Vec::new(),
            scripts: Vec::new(),
            conn: None,
        }
    }

    /// The current state of the MULTI/EXEC mini-protocol.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Whether a `WATCH` is in effect on the held connection.
    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.watching
    }

    /// Number of buffered commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether no commands are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Issues a command through the pipeline.
    ///
    /// The command is buffered (returning `None`) unless the pipeline is
    /// in the watching state and `multi()` has not been called; then it
    /// executes immediately against the held connection and its reply is
    /// returned.
    ///
    /// # Errors
    ///
    /// In immediate mode, any command error; `RedisError::Watch` if the
    /// connection fails while a `WATCH` is in effect.
    pub async fn command(
        &mut self,
        cmd: Command,
        options: CommandOptions,
    ) -> RedisResult<Option<Value>> {
        if self.state == PipelineState::Watching {
            self.immediate(cmd, options).await.map(Some)
        } else {
            self.buffer.push((cmd, options));
            Ok(None)
        }
    }

    /// Watches the given keys for the optimistic lock.
    ///
    /// Must be called before `multi()`. Promotes the pipeline to the
    /// watching state: subsequent commands execute immediately on the
    /// held connection until `multi()` resumes buffering.
    ///
    /// # Errors
    ///
    /// `RedisError::Usage` after `multi()`;
    /// `RedisError::Watch` if the connection fails.
    pub async fn watch<S: AsRef<str>>(&mut self, keys: &[S]) -> RedisResult<()> {
        if self.state == PipelineState::Queuing {
            return Err(RedisError::Usage("cannot issue WATCH after MULTI"));
        }
        if keys.is_empty() {
            return Err(RedisError::Usage("WATCH requires at least one key"));
        }
        let mut cmd = Command::new("WATCH");
        for key in keys {
            cmd = cmd.arg(key.as_ref())?;
        }
        self.immediate(cmd, CommandOptions::default()).await?;
        Ok(())
    }

    /// Clears the optimistic lock on the server and leaves the watching
    /// state.
    ///
    /// # Errors
    ///
    /// Any command error.
    pub async fn unwatch(&mut self) -> RedisResult<()> {
        if self.watching {
            self.immediate(Command::new("UNWATCH"), CommandOptions::default())
                .await?;
        }
        Ok(())
    }

    /// Begins the transactional buffering block after `WATCH` commands
    /// were issued. End the block with [`execute`](Pipeline::execute).
    ///
    /// # Errors
    ///
    /// `RedisError::Usage` on nested calls, or when commands were
    /// buffered without an initial `WATCH`.
    pub fn multi(&mut self) -> RedisResult<()> {
        match self.state {
            PipelineState::Queuing => Err(RedisError::Usage("cannot issue nested calls to MULTI")),
            PipelineState::Buffering if !self.buffer.is_empty() => Err(RedisError::Usage(
                "commands without an initial WATCH have already been buffered",
            )),
            PipelineState::Buffering | PipelineState::Watching => {
                self.state = PipelineState::Queuing;
                Ok(())
            }
        }
    }

    /// Registers a script that must be present in the server's script
    /// cache before the batch is flushed.
    ///
    /// Before `execute` flushes the buffer, the pipeline issues
    /// `SCRIPT EXISTS` and loads every absent script with `SCRIPT LOAD`
    /// (these cache-management commands bypass the transaction).
    pub fn register_script(&mut self, script: &Script) {
        self.scripts.push(script.clone());
    }

    /// Flushes the buffer as one write, collects the replies in order,
    /// and resets the pipeline.
    ///
    /// In transactional mode the server's `EXEC` reply determines the
    /// outcome: an array is paired with the buffered commands, nil means
    /// the optimistic lock was broken (`RedisError::Watch`), and an abort
    /// surfaces as the first queueing error.
    ///
    /// With `raise_on_error`, the first server error in the result list
    /// fails the call; otherwise errors are returned in-band as list
    /// elements.
    ///
    /// # Errors
    ///
    /// `RedisError::Watch`, `RedisError::ExecAbort`, connection errors,
    /// and (with `raise_on_error`) the first in-band server error.
    pub async fn execute(&mut self, raise_on_error: bool) -> RedisResult<Vec<RedisResult<Value>>> {
        if self.buffer.is_empty() && !self.watching {
            return Ok(Vec::new());
        }
        let outcome = self.execute_with_retry(raise_on_error).await;
        self.reset().await;
        outcome
    }

    /// Clears the buffer and the registered scripts, unwatches if
    /// necessary, and releases the held connection back to the pool.
    pub async fn reset(&mut self) {
        self.buffer.clear();
        self.scripts.clear();
        if self.watching {
            if let Some(conn) = self.conn.as_ref() {
                match conn
                    .send_once(&Command::new("UNWATCH"), &CommandOptions::default())
                    .await
                {
                    Ok(_) => {}
                    Err(e) => {
                        debug!("UNWATCH on reset failed, disconnecting: {}", e);
                        conn.disconnect().await;
                    }
                }
            }
        }
        self.watching = false;
        self.state = PipelineState::Buffering;
        // the guard returns the connection to the pool
        self.conn = None;
    }

    async fn execute_with_retry(
        &mut self,
        raise_on_error: bool,
    ) -> RedisResult<Vec<RedisResult<Value>>> {
        self.load_scripts().await?;
        self.ensure_conn().await?;
        let transactional = self.transactional || self.state == PipelineState::Queuing;
        let first = self.run(transactional, raise_on_error).await;
        match first {
            Err(e) if e.is_connection_error() || e.is_timeout() => {
                if let Some(conn) = self.conn.as_ref() {
                    conn.disconnect().await;
                }
                if self.watching {
                    // the watch died with the connection; the caller must
                    // retry the whole transaction
                    self.watching = false;
                    return Err(RedisError::Watch);
                }
                if e.is_timeout()
                    && self
                        .pool
                        .connection_configuration()
                        .is_retry_on_timeout()
                {
                    debug!("pipeline timed out, retrying once on a fresh connection");
                    self.conn = None;
                    self.ensure_conn().await?;
                    self.run(transactional, raise_on_error).await
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    async fn run(
        &mut self,
        transactional: bool,
        raise_on_error: bool,
    ) -> RedisResult<Vec<RedisResult<Value>>> {
        if transactional {
            self.run_transaction(raise_on_error).await
        } else {
            self.run_buffered(raise_on_error).await
        }
    }

    async fn run_buffered(
        &mut self,
        raise_on_error: bool,
    ) -> RedisResult<Vec<RedisResult<Value>>> {
        let commands = self.buffer.clone();
        let conn = self.held_connection();
        let receivers = conn.send_batch(&commands).await?;
        let mut results = Vec::with_capacity(commands.len());
        for (rx, (_, options)) in receivers.into_iter().zip(&commands) {
            match conn.await_reply(rx).await {
                Ok(value) => results.push(conn.postprocess(value, options.decode())),
                Err(e) if e.is_connection_error() || e.is_timeout() => return Err(e),
                // server errors stay in-band
                Err(e) => results.push(Err(e)),
            }
        }
        raise_first_if(raise_on_error, results)
    }

    async fn run_transaction(
        &mut self,
        raise_on_error: bool,
    ) -> RedisResult<Vec<RedisResult<Value>>> {
        let commands = self.buffer.clone();
        let mut batch = Vec::with_capacity(commands.len() + 2);
        batch.push((Command::new("MULTI"), CommandOptions::default()));
        batch.extend(commands.iter().cloned());
        batch.push((Command::new("EXEC"), CommandOptions::default()));
        let conn = self.held_connection();
        let receivers = conn.send_batch(&batch).await?;
        // the reply stream must hold exactly 2 + N responses
        let mut replies = receivers.into_iter();
        let Some(multi_rx) = replies.next() else {
            return Err(RedisError::protocol("empty transaction batch"));
        };

        let mut queueing_errors: Vec<(usize, RedisError)> = Vec::new();
        match conn.await_reply(multi_rx).await {
            Ok(_) => {}
            Err(e) if e.is_connection_error() || e.is_timeout() => return Err(e),
            Err(e) => queueing_errors.push((0, e)),
        }
        for i in 0..commands.len() {
            let Some(rx) = replies.next() else {
                return Err(RedisError::protocol("transaction batch arity mismatch"));
            };
            match conn.await_reply(rx).await {
                // each queued command acknowledges with +QUEUED
                Ok(_) => {}
                Err(e) if e.is_connection_error() || e.is_timeout() => return Err(e),
                Err(e) => queueing_errors.push((i, e)),
            }
        }
        let Some(exec_rx) = replies.next() else {
            return Err(RedisError::protocol("transaction batch arity mismatch"));
        };
        let exec_reply = match conn.await_reply(exec_rx).await {
            Ok(value) => value,
            Err(RedisError::ExecAbort { message }) => {
                self.watching = false;
                return match queueing_errors.into_iter().next() {
                    Some((_, first)) => Err(first),
                    None => Err(RedisError::ExecAbort { message }),
                };
            }
            Err(e) => return Err(e),
        };
        // EXEC clears any watched keys
        self.watching = false;
        let results = match exec_reply {
            Value::Nil => return Err(RedisError::Watch),
            Value::Array(results) => results,
            other => {
                return Err(RedisError::protocol(format!(
                    "unexpected EXEC reply {other:?}"
                )));
            }
        };
        if results.len() + queueing_errors.len() != commands.len() {
            conn.disconnect().await;
            return Err(RedisError::protocol(
                "wrong number of response items from transaction",
            ));
        }
        let mut merged = Vec::with_capacity(commands.len());
        let mut exec_results = results.into_iter();
        let mut queueing_errors = queueing_errors.into_iter().peekable();
        for (i, (_, options)) in commands.iter().enumerate() {
            if queueing_errors.peek().map(|(idx, _)| *idx) == Some(i) {
                match queueing_errors.next() {
                    Some((_, e)) => merged.push(Err(e)),
                    None => unreachable!("peeked queueing error vanished"),
                }
                continue;
            }
            match exec_results.next() {
                Some(Value::Error { kind, message }) => {
                    merged.push(Err(RedisError::from_server(&kind, &message)));
                }
                Some(value) => merged.push(conn.postprocess(value, options.decode())),
                None => unreachable!("transaction result count was verified"),
            }
        }
        raise_first_if(raise_on_error, merged)
    }

    // Ensures the server's script cache holds every registered script.
    // These preload commands go out eagerly, outside the transaction.
    async fn load_scripts(&mut self) -> RedisResult<()> {
        if self.scripts.is_empty() {
            return Ok(());
        }
        self.ensure_conn().await?;
        let Some(conn) = self.conn.as_ref() else {
            unreachable!("connection was just ensured")
        };
        let mut cmd = Command::new("SCRIPT EXISTS");
        for script in &self.scripts {
            cmd = cmd.arg(script.sha())?;
        }
        let flags = conn
            .send_once(&cmd, &CommandOptions::default())
            .await?
            .into_array()?;
        if flags.len() != self.scripts.len() {
            return Err(RedisError::protocol("SCRIPT EXISTS arity mismatch"));
        }
        for (script, flag) in self.scripts.iter_mut().zip(flags) {
            if flag.as_integer() == Some(0) {
                debug!("preloading script {}", script.sha);
                let loaded = conn
                    .send_once(
                        &Command::new("SCRIPT LOAD").arg(script.body.as_str())?,
                        &CommandOptions::default().with_decode(false),
                    )
                    .await?
                    .into_string()?;
                if !loaded.eq_ignore_ascii_case(&script.sha) {
                    warn!(
                        "server cached script under {} instead of {}",
                        loaded, script.sha
                    );
                }
                script.sha = loaded.to_lowercase();
            }
        }
        Ok(())
    }

    // Executes one command immediately on the held connection (the
    // WATCH -> reads -> MULTI recipe); acquires the connection on first
    // use and keeps it until reset.
    async fn immediate(&mut self, cmd: Command, options: CommandOptions) -> RedisResult<Value> {
        self.ensure_conn().await?;
        let name = cmd.name().to_string();
        let conn = self.held_connection();
        match conn.send_once(&cmd, &options).await {
            Ok(value) => {
                self.note_watch_effect(&name);
                Ok(value)
            }
            Err(e) if e.is_connection_error() || e.is_timeout() => {
                conn.disconnect().await;
                if self.watching {
                    // the watch is no longer valid; the caller should
                    // retry the whole transaction
                    self.reset().await;
                    return Err(RedisError::Watch);
                }
                if e.is_timeout()
                    && self
                        .pool
                        .connection_configuration()
                        .is_retry_on_timeout()
                {
                    self.conn = None;
                    self.ensure_conn().await?;
                    let conn = self.held_connection();
                    let retried = conn.send_once(&cmd, &options).await;
                    if retried.is_ok() {
                        self.note_watch_effect(&name);
                    }
                    return retried;
                }
                self.reset().await;
                Err(e)
            }
            Err(e) => {
                self.note_watch_effect(&name);
                Err(e)
            }
        }
    }

    fn note_watch_effect(&mut self, command_name: &str) {
        match command_name {
            "WATCH" => {
                self.watching = true;
                if self.state == PipelineState::Buffering {
                    self.state = PipelineState::Watching;
                }
            }
            "UNWATCH" | "DISCARD" | "EXEC" => {
                self.watching = false;
                if self.state == PipelineState::Watching {
                    self.state = PipelineState::Buffering;
                }
            }
            _ => {}
        }
    }

    async fn ensure_conn(&mut self) -> RedisResult<()> {
        if self.conn.is_none() {
            self.conn = Some(self.pool.acquire().await?);
        }
        Ok(())
    }

    // An owned handle to the held connection; clones share the
    // underlying transport, so this sidesteps borrowing `self`.
    fn held_connection(&self) -> Connection {
        match self.conn {
            Some(ref guard) => (**guard).clone(),
            None => unreachable!("pipeline without a held connection"),
        }
    }
}

fn raise_first_if(
    raise_on_error: bool,
    mut results: Vec<RedisResult<Value>>,
) -> RedisResult<Vec<RedisResult<Value>>> {
    if raise_on_error {
        if let Some(pos) = results.iter().position(Result::is_err) {
            return match results.swap_remove(pos) {
                Err(e) => Err(e),
                Ok(_) => unreachable!("position() found an error"),
            };
        }
    }
    Ok(results)
}
