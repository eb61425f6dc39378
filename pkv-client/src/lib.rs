//! # PoolKV Sync Client
//!
//! Purpose: Provide a synchronous Redis-compatible client runtime: a
//! bounded connection pool, a script cache that prefers EVALSHA, and a
//! command executor that recovers from NOSCRIPT once.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse connections to avoid repeated connects.
//! 2. **Composition**: The pool is generic over a `ConnectionFactory`.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.

mod client;
mod connection;
mod executor;
mod pool;
mod resp;
mod script;

#[cfg(test)]
mod testing;

pub use client::{ClientConfig, KvClient};
pub use connection::{Connection, ConnectionFactory, TcpConfig, TcpConnection, TcpConnectionFactory};
pub use executor::CommandExecutor;
pub use pool::{CancelToken, ConnectionInfo, ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use resp::RespValue;
pub use script::{Script, ScriptCache, ScriptHash, ScriptScope, ScriptState};

pub use pkv_common::{
    CommandArguments, FlushMode, PkvError, PkvResult, SetCondition, SetExpiry, SetParams,
    TsIncrByParams,
};
