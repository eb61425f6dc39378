//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API over the pool, script cache, and
//! executor, speaking RESP2 to a Redis-compatible server.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KvClient` hides pooling, script caching, and
//!    protocol details.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **Fail Fast**: Protocol violations surface immediately as errors.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use pkv_common::{
    Command, CommandArguments, FlushMode, PkvError, PkvResult, SetParams, TsIncrByParams,
};

use crate::connection::{ConnectionFactory, TcpConfig, TcpConnectionFactory};
use crate::executor::CommandExecutor;
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::resp::RespValue;
use crate::script::{Script, ScriptCache, ScriptHash, ScriptScope};

/// Configuration for the synchronous client and its pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    pub pool: PoolConfig,
    /// Optional TCP read timeout.
    pub read_timeout_millis: Option<u64>,
    /// Optional TCP write timeout.
    pub write_timeout_millis: Option<u64>,
    /// Optional TCP connect timeout.
    pub connect_timeout_millis: Option<u64>,
    pub script_scope: ScriptScope,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:6379".to_string(),
            pool: PoolConfig::default(),
            read_timeout_millis: None,
            write_timeout_millis: None,
            connect_timeout_millis: None,
            script_scope: ScriptScope::default(),
        }
    }
}

impl ClientConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> PkvResult<Self> {
        let config: ClientConfig =
            serde_json::from_str(text).map_err(|err| PkvError::Config(err.to_string()))?;
        config.pool.validate()?;
        Ok(config)
    }

    fn tcp_config(&self) -> PkvResult<TcpConfig> {
        let addr = self.addr.parse().map_err(|_| PkvError::InvalidAddress)?;
        Ok(TcpConfig {
            addr,
            read_timeout: self.read_timeout_millis.map(Duration::from_millis),
            write_timeout: self.write_timeout_millis.map(Duration::from_millis),
            connect_timeout: self.connect_timeout_millis.map(Duration::from_millis),
        })
    }
}

/// Synchronous client with connection pooling and script caching.
///
/// Each call borrows a connection, executes one command (two for a
/// NOSCRIPT fallback), and returns the connection to the pool.
pub struct KvClient<F: ConnectionFactory = TcpConnectionFactory> {
    executor: CommandExecutor<F>,
}

impl KvClient<TcpConnectionFactory> {
    /// Creates a client with default configuration.
    pub fn connect(addr: impl Into<String>) -> PkvResult<Self> {
        let config = ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        };
        Self::with_config(config)
    }

    /// Creates a client with a custom configuration.
    pub fn with_config(config: ClientConfig) -> PkvResult<Self> {
        let factory = TcpConnectionFactory::new(config.tcp_config()?);
        Self::with_factory(config.pool, config.script_scope, factory)
    }
}

impl<F: ConnectionFactory> KvClient<F> {
    /// Builds a client over any connection factory.
    pub fn with_factory(pool: PoolConfig, scope: ScriptScope, factory: F) -> PkvResult<Self> {
        let pool = ConnectionPool::new(pool, factory)?;
        let scripts = Arc::new(ScriptCache::new(scope));
        Ok(KvClient {
            executor: CommandExecutor::new(pool, scripts),
        })
    }

    pub fn executor(&self) -> &CommandExecutor<F> {
        &self.executor
    }

    pub fn scripts(&self) -> &Arc<ScriptCache> {
        self.executor.scripts()
    }

    pub fn stats(&self) -> PoolStats {
        self.executor.pool().stats()
    }

    /// Closes the pool. Later calls fail with `PoolClosed`.
    pub fn close(&self) {
        self.executor.pool().close();
    }

    /// Pings the server. Returns the raw response payload.
    pub fn ping(&self, payload: Option<&[u8]>) -> PkvResult<Vec<u8>> {
        let mut cmd = CommandArguments::new(Command::Ping);
        if let Some(data) = payload {
            cmd.add(data);
        }
        match self.executor.execute(&cmd)? {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(Some(data)) => Ok(data),
            _ => Err(PkvError::UnexpectedResponse),
        }
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &[u8]) -> PkvResult<Option<Vec<u8>>> {
        let mut cmd = CommandArguments::new(Command::Get);
        cmd.add(key);
        match self.executor.execute(&cmd)? {
            RespValue::Bulk(data) => Ok(data),
            _ => Err(PkvError::UnexpectedResponse),
        }
    }

    /// Sets a value for a key without options.
    pub fn set(&self, key: &[u8], value: &[u8]) -> PkvResult<()> {
        if self.set_with(key, value, SetParams::new())? {
            Ok(())
        } else {
            Err(PkvError::UnexpectedResponse)
        }
    }

    /// Sets a value with `SET` options.
    ///
    /// Returns false when an NX/XX condition prevented the write. With
    /// `GET` in `params`, use `set_and_get` instead.
    pub fn set_with(&self, key: &[u8], value: &[u8], params: SetParams) -> PkvResult<bool> {
        match self
            .executor
            .execute_with_params(Command::Set, key, value, params)?
        {
            RespValue::Simple(text) if text == b"OK" => Ok(true),
            RespValue::Bulk(None) => Ok(false),
            _ => Err(PkvError::UnexpectedResponse),
        }
    }

    /// `SET ... GET`: stores the value and returns the previous one.
    pub fn set_and_get(
        &self,
        key: &[u8],
        value: &[u8],
        params: SetParams,
    ) -> PkvResult<Option<Vec<u8>>> {
        match self
            .executor
            .execute_with_params(Command::Set, key, value, params.get())?
        {
            RespValue::Bulk(previous) => Ok(previous),
            _ => Err(PkvError::UnexpectedResponse),
        }
    }

    /// Deletes keys. Returns how many were removed.
    pub fn del(&self, keys: &[&[u8]]) -> PkvResult<u64> {
        let mut cmd = CommandArguments::new(Command::Del);
        cmd.add_all(keys.iter().copied());
        match self.executor.execute(&cmd)? {
            RespValue::Integer(count) if count >= 0 => Ok(count as u64),
            _ => Err(PkvError::UnexpectedResponse),
        }
    }

    /// Runs a script, sending only its hash once the server has it.
    pub fn eval(&self, script: &Script, keys: &[&[u8]], args: &[&[u8]]) -> PkvResult<RespValue> {
        self.executor.eval(script, keys, args)
    }

    /// Runs a script the caller knows only by hash.
    pub fn eval_sha(&self, hash: ScriptHash, keys: &[&[u8]], args: &[&[u8]]) -> PkvResult<RespValue> {
        self.executor.eval_sha(hash, keys, args)
    }

    pub fn script_load(&self, script: &Script) -> PkvResult<ScriptHash> {
        self.executor.script_load(script)
    }

    pub fn script_exists(&self, hashes: &[ScriptHash]) -> PkvResult<Vec<bool>> {
        self.executor.script_exists(hashes)
    }

    pub fn script_flush(&self, mode: Option<FlushMode>) -> PkvResult<()> {
        self.executor.script_flush(mode)
    }

    pub fn script_kill(&self) -> PkvResult<()> {
        self.executor.script_kill()
    }

    /// `TS.INCRBY`. Returns the timestamp of the upserted sample.
    pub fn ts_incr_by(&self, key: &[u8], value: f64, params: TsIncrByParams) -> PkvResult<i64> {
        self.ts_add(Command::TsIncrBy, key, value, params)
    }

    /// `TS.DECRBY`. Returns the timestamp of the upserted sample.
    pub fn ts_decr_by(&self, key: &[u8], value: f64, params: TsIncrByParams) -> PkvResult<i64> {
        self.ts_add(Command::TsDecrBy, key, value, params)
    }

    fn ts_add(&self, command: Command, key: &[u8], value: f64, params: TsIncrByParams) -> PkvResult<i64> {
        match self.executor.execute_with_params(command, key, value, params)? {
            RespValue::Integer(timestamp) => Ok(timestamp),
            _ => Err(PkvError::UnexpectedResponse),
        }
    }
}
