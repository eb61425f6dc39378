//! # Connections and Factories
//!
//! Purpose: Define the transport seam the pool manages and provide the
//! blocking TCP implementation used by `KvClient`.
//!
//! ## Design Principles
//! 1. **Composition over Inheritance**: The pool holds a `ConnectionFactory`
//!    that knows how to create, validate, and destroy connections.
//! 2. **Buffer Reuse**: Each TCP connection owns its read/write buffers.
//! 3. **Fail Fast**: IO and framing errors surface immediately so the caller
//!    can invalidate the connection.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use pkv_common::{Command, CommandArguments, PkvError, PkvResult};

use crate::resp::{encode_command, read_response, RespValue};

/// A single request/response channel to the server.
pub trait Connection: Send {
    /// Sends one command and reads its reply.
    ///
    /// Server error replies come back as `Ok(RespValue::Error)`; `Err` means
    /// the transport itself failed.
    fn send(&mut self, args: &CommandArguments) -> PkvResult<RespValue>;

    /// Releases the underlying transport. Called at most once.
    fn close(&mut self) {}
}

/// Creates, validates, and destroys connections on behalf of the pool.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection + 'static;

    fn create(&self) -> PkvResult<Self::Connection>;

    /// Liveness check. Defaults to `PING` expecting `PONG`.
    fn validate(&self, conn: &mut Self::Connection) -> bool {
        match conn.send(&CommandArguments::new(Command::Ping)) {
            Ok(RespValue::Simple(text)) => text == b"PONG",
            _ => false,
        }
    }

    fn destroy(&self, mut conn: Self::Connection) {
        conn.close();
    }
}

/// Socket settings for TCP connections.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub addr: SocketAddr,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

/// Single TCP connection with reusable buffers.
///
/// The buffers are stored on the connection to avoid per-call allocations.
pub struct TcpConnection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl TcpConnection {
    pub fn connect(config: &TcpConfig) -> PkvResult<Self> {
        let stream = match config.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&config.addr, timeout)?,
            None => TcpStream::connect(config.addr)?,
        };
        if let Some(timeout) = config.read_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }
        if let Some(timeout) = config.write_timeout {
            stream.set_write_timeout(Some(timeout))?;
        }
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        Ok(TcpConnection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
        })
    }
}

impl Connection for TcpConnection {
    fn send(&mut self, args: &CommandArguments) -> PkvResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        read_response(&mut self.reader, &mut self.line_buf)
    }

    fn close(&mut self) {
        let _ = self.reader.get_ref().shutdown(std::net::Shutdown::Both);
    }
}

/// Factory producing `TcpConnection`s to one server address.
#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    config: TcpConfig,
}

impl TcpConnectionFactory {
    pub fn new(config: TcpConfig) -> Self {
        TcpConnectionFactory { config }
    }

    /// Parses `addr` (e.g. "127.0.0.1:6379") and builds a factory without timeouts.
    pub fn from_addr(addr: &str) -> PkvResult<Self> {
        let addr: SocketAddr = addr.parse().map_err(|_| PkvError::InvalidAddress)?;
        Ok(TcpConnectionFactory::new(TcpConfig {
            addr,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
        }))
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    type Connection = TcpConnection;

    fn create(&self) -> PkvResult<TcpConnection> {
        let conn = TcpConnection::connect(&self.config)?;
        tracing::debug!(addr = %self.config.addr, "opened tcp connection");
        Ok(conn)
    }
}
