//! # Command Executor
//!
//! Purpose: Run one logical command on a pooled connection, interpreting
//! the reply and deciding whether the connection goes back to the pool.
//!
//! ## Design Principles
//! 1. **One Lease Per Call**: A call borrows once; the NOSCRIPT fallback
//!    reuses the same connection.
//! 2. **Invalidate on Transport Errors**: Broken connections never return
//!    to the idle set.
//! 3. **Bounded Recovery**: NOSCRIPT is recovered at most once per call.
//!
//! ## Script Execution
//!
//! ```text
//! state(hash) == AssumedLoaded ──► EVALSHA ──► ok ─────────────► reply
//!        │                            │
//!        │                            └─ NOSCRIPT ─► demote ─┐
//!        ▼                                                   ▼
//!     Unknown ──────────────────────────────────────────► EVAL ─► ok ─► promote, reply
//!                                                            └─ error ─► surfaced
//! ```

use std::sync::Arc;

use pkv_common::{
    Command, CommandArguments, FlushMode, Keyword, Params, PkvError, PkvResult,
};

use crate::connection::ConnectionFactory;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::resp::RespValue;
use crate::script::{Script, ScriptCache, ScriptHash, ScriptState};

/// Executes commands against a pool, sharing one script cache.
pub struct CommandExecutor<F: ConnectionFactory> {
    pool: ConnectionPool<F>,
    scripts: Arc<ScriptCache>,
}

impl<F: ConnectionFactory> Clone for CommandExecutor<F> {
    fn clone(&self) -> Self {
        CommandExecutor {
            pool: self.pool.clone(),
            scripts: Arc::clone(&self.scripts),
        }
    }
}

impl<F: ConnectionFactory> CommandExecutor<F> {
    /// Binds `scripts` to `pool`: per-connection entries go away with their
    /// connection, however the pool destroys it.
    pub fn new(pool: ConnectionPool<F>, scripts: Arc<ScriptCache>) -> Self {
        let cache = Arc::clone(&scripts);
        pool.on_destroy(move |id| cache.forget_connection(id));
        CommandExecutor { pool, scripts }
    }

    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.pool
    }

    pub fn scripts(&self) -> &Arc<ScriptCache> {
        &self.scripts
    }

    /// Sends one command and converts error replies into `PkvError::Server`.
    pub fn execute(&self, args: &CommandArguments) -> PkvResult<RespValue> {
        self.with_connection(|conn| conn.send(args)?.into_result())
    }

    /// Runs `op` on a borrowed connection, invalidating it if it broke.
    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut PooledConnection<F>) -> PkvResult<T>,
    ) -> PkvResult<T> {
        let mut conn = self.pool.borrow()?;
        let result = op(&mut conn);
        if conn.is_broken() {
            self.pool.invalidate(conn);
        } else {
            self.pool.return_connection(conn);
        }
        result
    }

    /// Runs a script, preferring EVALSHA when the body is believed cached.
    pub fn eval(&self, script: &Script, keys: &[&[u8]], args: &[&[u8]]) -> PkvResult<RespValue> {
        let hash = script.hash();
        self.with_connection(|conn| {
            let scope = conn.id();
            if self.scripts.state(scope, hash) == ScriptState::AssumedLoaded {
                let reply = conn.send(&script_call(Command::EvalSha, hash.to_hex(), keys, args))?;
                if !reply.is_noscript() {
                    return reply.into_result();
                }
                tracing::debug!(%hash, conn = scope, "script not cached on server, falling back to EVAL");
                self.scripts.mark_unknown(scope, hash);
            }

            // Single fallback: a NOSCRIPT here is surfaced as a server error.
            let reply = conn
                .send(&script_call(Command::Eval, script.body().clone(), keys, args))?
                .into_result()?;
            self.scripts.mark_loaded(scope, hash);
            Ok(reply)
        })
    }

    /// Runs a script by hash only. NOSCRIPT demotes the entry and is surfaced.
    pub fn eval_sha(&self, hash: ScriptHash, keys: &[&[u8]], args: &[&[u8]]) -> PkvResult<RespValue> {
        self.with_connection(|conn| {
            let scope = conn.id();
            let reply = conn.send(&script_call(Command::EvalSha, hash.to_hex(), keys, args))?;
            if reply.is_noscript() {
                self.scripts.mark_unknown(scope, hash);
            } else if !matches!(reply, RespValue::Error(_)) {
                self.scripts.mark_loaded(scope, hash);
            }
            reply.into_result()
        })
    }

    /// `SCRIPT LOAD`: pre-warms the server and marks the hash loaded.
    pub fn script_load(&self, script: &Script) -> PkvResult<ScriptHash> {
        self.with_connection(|conn| {
            let scope = conn.id();
            let mut cmd = CommandArguments::new(Command::Script);
            cmd.add(Keyword::Load).add(script.body().clone());

            let loaded = conn.send(&cmd).and_then(|reply| match reply.into_result()? {
                RespValue::Bulk(Some(digest)) | RespValue::Simple(digest) => {
                    ScriptHash::from_hex(&digest).ok_or(PkvError::UnexpectedResponse)
                }
                _ => Err(PkvError::UnexpectedResponse),
            });

            match loaded {
                Ok(hash) => {
                    if hash != script.hash() {
                        tracing::warn!(local = %script.hash(), server = %hash, "server script hash differs");
                    }
                    self.scripts.mark_loaded(scope, hash);
                    Ok(hash)
                }
                Err(err) => {
                    self.scripts.mark_unknown(scope, script.hash());
                    Err(err)
                }
            }
        })
    }

    /// `SCRIPT EXISTS`: asks the server and folds the answers into the cache.
    pub fn script_exists(&self, hashes: &[ScriptHash]) -> PkvResult<Vec<bool>> {
        // The server rejects a bare `SCRIPT EXISTS` as an arity error.
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        self.with_connection(|conn| {
            let scope = conn.id();
            let mut cmd = CommandArguments::new(Command::Script);
            cmd.add(Keyword::Exists);
            cmd.add_all(hashes.iter().map(ScriptHash::to_hex));

            let items = match conn.send(&cmd)?.into_result()? {
                RespValue::Array(items) if items.len() == hashes.len() => items,
                _ => return Err(PkvError::UnexpectedResponse),
            };

            let mut exists = Vec::with_capacity(items.len());
            for (hash, item) in hashes.iter().zip(items) {
                let present = match item {
                    RespValue::Integer(flag) => flag == 1,
                    _ => return Err(PkvError::UnexpectedResponse),
                };
                if present {
                    self.scripts.mark_loaded(scope, *hash);
                } else {
                    self.scripts.mark_unknown(scope, *hash);
                }
                exists.push(present);
            }
            Ok(exists)
        })
    }

    /// `SCRIPT FLUSH`. The local cache is reset even if the server refuses.
    pub fn script_flush(&self, mode: Option<FlushMode>) -> PkvResult<()> {
        self.scripts.flush();
        let mut cmd = CommandArguments::new(Command::Script);
        cmd.add(Keyword::Flush);
        if let Some(mode) = mode {
            cmd.add(mode);
        }
        expect_ok(self.execute(&cmd)?)
    }

    /// `SCRIPT KILL`.
    pub fn script_kill(&self) -> PkvResult<()> {
        let mut cmd = CommandArguments::new(Command::Script);
        cmd.add(Keyword::Kill);
        expect_ok(self.execute(&cmd)?)
    }

    /// Sends `command key value [params]`, used by the parameterized commands.
    pub fn execute_with_params<P: Params>(
        &self,
        command: Command,
        key: &[u8],
        value: impl pkv_common::IntoArg,
        params: P,
    ) -> PkvResult<RespValue> {
        let mut cmd = CommandArguments::new(command);
        cmd.add(key).add(value).add_params(params);
        self.execute(&cmd)
    }
}

fn script_call(
    command: Command,
    script: impl pkv_common::IntoArg,
    keys: &[&[u8]],
    args: &[&[u8]],
) -> CommandArguments {
    let mut cmd = CommandArguments::new(command);
    cmd.add(script)
        .add(keys.len())
        .add_all(keys.iter().copied())
        .add_all(args.iter().copied());
    cmd
}

fn expect_ok(reply: RespValue) -> PkvResult<()> {
    if reply.is_ok() {
        Ok(())
    } else {
        Err(PkvError::UnexpectedResponse)
    }
}
