//! In-memory connection factory for unit tests.
//!
//! `FakeFactory` clones share one `FakeServer`, so a test can flip health or
//! script-cache state while the pool holds the connections.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use pkv_common::{CommandArguments, PkvError, PkvResult, NOSCRIPT_PREFIX};

use crate::connection::{Connection, ConnectionFactory};
use crate::resp::RespValue;
use crate::script::ScriptHash;

/// Installs a test-writer subscriber once; later calls are no-ops.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct FakeServer {
    created: usize,
    destroyed: usize,
    break_next_send: bool,
    unhealthy: bool,
    noscript_on_eval: bool,
    reject_load: bool,
    scripts: HashSet<ScriptHash>,
    strings: HashMap<Vec<u8>, Vec<u8>>,
    log: Vec<Vec<String>>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeFactory {
    server: Arc<Mutex<FakeServer>>,
}

impl FakeFactory {
    pub(crate) fn created(&self) -> usize {
        self.server.lock().created
    }

    pub(crate) fn destroyed(&self) -> usize {
        self.server.lock().destroyed
    }

    /// The next `send` on any connection fails with a reset.
    pub(crate) fn break_next_send(&self) {
        self.server.lock().break_next_send = true;
    }

    /// Unhealthy connections answer PING with an error.
    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.server.lock().unhealthy = !healthy;
    }

    pub(crate) fn set_noscript_on_eval(&self, enabled: bool) {
        self.server.lock().noscript_on_eval = enabled;
    }

    pub(crate) fn set_reject_load(&self, enabled: bool) {
        self.server.lock().reject_load = enabled;
    }

    /// Simulates a server restart or an external `SCRIPT FLUSH`.
    pub(crate) fn forget_scripts(&self) {
        self.server.lock().scripts.clear();
    }

    /// Command names in the order they were sent.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.server
            .lock()
            .log
            .iter()
            .filter_map(|tokens| tokens.first().cloned())
            .collect()
    }

    pub(crate) fn last_command(&self) -> Vec<String> {
        self.server.lock().log.last().cloned().unwrap_or_default()
    }

    pub(crate) fn clear_log(&self) {
        self.server.lock().log.clear();
    }
}

impl ConnectionFactory for FakeFactory {
    type Connection = FakeConnection;

    fn create(&self) -> PkvResult<FakeConnection> {
        self.server.lock().created += 1;
        Ok(FakeConnection {
            server: Arc::clone(&self.server),
        })
    }

    fn destroy(&self, _conn: FakeConnection) {
        self.server.lock().destroyed += 1;
    }
}

pub(crate) struct FakeConnection {
    server: Arc<Mutex<FakeServer>>,
}

impl Connection for FakeConnection {
    fn send(&mut self, args: &CommandArguments) -> PkvResult<RespValue> {
        let mut server = self.server.lock();
        if std::mem::take(&mut server.break_next_send) {
            return Err(PkvError::ConnectionBroken(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by fake server",
            )));
        }

        let tokens: Vec<Vec<u8>> = args.iter().map(<[u8]>::to_vec).collect();
        let name = String::from_utf8_lossy(&tokens[0]).to_ascii_uppercase();
        // Health checks are not part of the command log.
        if name != "PING" {
            server.log.push(
                tokens
                    .iter()
                    .map(|token| String::from_utf8_lossy(token).into_owned())
                    .collect(),
            );
        }
        Ok(server.reply(&name, &tokens[1..]))
    }
}

impl FakeServer {
    fn reply(&mut self, name: &str, args: &[Vec<u8>]) -> RespValue {
        match name {
            "PING" if self.unhealthy => error("ERR server is shutting down"),
            "PING" => match args.first() {
                Some(echo) => RespValue::Bulk(Some(echo.clone())),
                None => RespValue::Simple(b"PONG".to_vec()),
            },
            "GET" => RespValue::Bulk(self.strings.get(&args[0]).cloned()),
            "SET" => {
                let previous = self.strings.insert(args[0].clone(), args[1].clone());
                if args[2..].iter().any(|arg| arg == b"GET") {
                    RespValue::Bulk(previous)
                } else {
                    ok()
                }
            }
            "DEL" => {
                let removed = args.iter().filter(|key| self.strings.remove(*key).is_some()).count();
                RespValue::Integer(removed as i64)
            }
            "EVAL" => {
                if self.noscript_on_eval {
                    return noscript();
                }
                if args[0] == b"error" {
                    return error("ERR user script failed");
                }
                self.scripts.insert(ScriptHash::of(&args[0]));
                RespValue::Bulk(Some(b"ran".to_vec()))
            }
            "EVALSHA" => match ScriptHash::from_hex(&args[0]) {
                Some(hash) if self.scripts.contains(&hash) => RespValue::Bulk(Some(b"ran".to_vec())),
                _ => noscript(),
            },
            "SCRIPT" => self.script(args),
            "TS.INCRBY" | "TS.DECRBY" => {
                let timestamp = args
                    .iter()
                    .position(|arg| arg == b"TIMESTAMP")
                    .and_then(|pos| args.get(pos + 1))
                    .and_then(|raw| std::str::from_utf8(raw).ok()?.parse().ok())
                    .unwrap_or(1);
                RespValue::Integer(timestamp)
            }
            _ => error("ERR unknown command"),
        }
    }

    fn script(&mut self, args: &[Vec<u8>]) -> RespValue {
        match args[0].as_slice() {
            b"LOAD" if self.reject_load => error("ERR Error compiling script"),
            b"LOAD" => {
                let hash = ScriptHash::of(&args[1]);
                self.scripts.insert(hash);
                RespValue::Bulk(Some(hash.to_hex().into_bytes()))
            }
            b"EXISTS" => RespValue::Array(
                args[1..]
                    .iter()
                    .map(|raw| {
                        let known = ScriptHash::from_hex(raw)
                            .map_or(false, |hash| self.scripts.contains(&hash));
                        RespValue::Integer(known as i64)
                    })
                    .collect(),
            ),
            b"FLUSH" => {
                self.scripts.clear();
                ok()
            }
            b"KILL" => error("NOTBUSY No scripts in execution right now."),
            _ => error("ERR unknown subcommand"),
        }
    }
}

fn ok() -> RespValue {
    RespValue::Simple(b"OK".to_vec())
}

fn error(message: &str) -> RespValue {
    RespValue::Error(message.as_bytes().to_vec())
}

fn noscript() -> RespValue {
    error(&format!("{} No matching script. Please use EVAL.", NOSCRIPT_PREFIX))
}
