//! # RESP2 Framing
//!
//! Purpose: Frame `CommandArguments` as RESP2 arrays of bulk strings and
//! decode server replies into `RespValue`.
//!
//! ## Design Principles
//! 1. **Untrusted Lengths**: Declared sizes are bounded before anything is
//!    allocated; a bad header is a `Protocol` error, never a panic.
//! 2. **Bounded Nesting**: Aggregate depth is capped so a hostile stream
//!    cannot exhaust the stack.
//! 3. **Buffer Reuse**: The caller owns the line buffer.
//! 4. **Binary-Safe**: Bulk strings are treated as raw bytes.
//!
//! ## Reply Grammar
//!
//! ```text
//! reply   := '+' line | '-' line | ':' int | '$' len data | '*' count reply*
//! len     := -1 (null) | 0..=MAX_BULK_LEN
//! count   := -1 (null, decoded as empty) | 0..
//! ```

use std::io::{self, BufRead, Read, Write};

use pkv_common::{is_noscript_message, CommandArguments, PkvError, PkvResult};

/// Largest bulk string accepted, matching the server's default
/// `proto-max-bulk-len`.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Deepest aggregate nesting accepted in one reply.
pub const MAX_DEPTH: usize = 32;

/// Upper bound on speculative pre-allocation for bulk data and arrays.
const PREALLOC_LIMIT: usize = 64 * 1024;

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style replies.
    Simple(Vec<u8>),
    /// -ERR ... replies.
    Error(Vec<u8>),
    /// :123 replies.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Converts an error reply into `PkvError::Server`, passing other values through.
    pub fn into_result(self) -> PkvResult<RespValue> {
        match self {
            RespValue::Error(message) => Err(PkvError::server(&message)),
            other => Ok(other),
        }
    }

    /// True for an error reply carrying the NOSCRIPT prefix.
    pub fn is_noscript(&self) -> bool {
        matches!(self, RespValue::Error(message) if is_noscript_message(message))
    }

    /// True for `+OK`.
    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::Simple(text) if text == b"OK")
    }
}

/// Appends the RESP2 framing of `args` to `out`.
pub fn encode_command(args: &CommandArguments, out: &mut Vec<u8>) {
    out.reserve(args.payload_len() + args.len() * 16 + 16);
    // Writing into a Vec cannot fail.
    let _ = write!(out, "*{}\r\n", args.len());
    for token in args.iter() {
        let _ = write!(out, "${}\r\n", token.len());
        out.extend_from_slice(token);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one complete reply from `reader`.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> PkvResult<RespValue> {
    Decoder { reader, line: line_buf }.reply(0)
}

struct Decoder<'a, R> {
    reader: &'a mut R,
    line: &'a mut Vec<u8>,
}

impl<R: BufRead> Decoder<'_, R> {
    fn reply(&mut self, depth: usize) -> PkvResult<RespValue> {
        self.next_line()?;
        let (&marker, body) = self
            .line
            .split_first()
            .ok_or_else(|| protocol("empty reply line"))?;

        match marker {
            b'+' => Ok(RespValue::Simple(body.to_vec())),
            b'-' => Ok(RespValue::Error(body.to_vec())),
            b':' => Ok(RespValue::Integer(parse_int(body)?)),
            b'$' => {
                let len = parse_int(body)?;
                self.bulk(len)
            }
            b'*' => {
                let count = parse_int(body)?;
                self.array(count, depth)
            }
            other => Err(PkvError::Protocol(format!(
                "unknown reply type byte 0x{:02x}",
                other
            ))),
        }
    }

    fn bulk(&mut self, len: i64) -> PkvResult<RespValue> {
        let len = match len {
            -1 => return Ok(RespValue::Bulk(None)),
            len if len < 0 => return Err(protocol("negative bulk length")),
            len => usize::try_from(len)
                .ok()
                .filter(|len| *len <= MAX_BULK_LEN)
                .ok_or_else(|| PkvError::Protocol(format!("bulk length {} exceeds limit", len)))?,
        };

        // Grow with the bytes actually received instead of trusting `len`.
        let mut data = Vec::with_capacity(len.min(PREALLOC_LIMIT));
        let received = (&mut *self.reader).take(len as u64).read_to_end(&mut data)?;
        if received < len {
            return Err(eof());
        }

        let mut crlf = [0u8; 2];
        self.reader.read_exact(&mut crlf)?;
        if crlf != *b"\r\n" {
            return Err(protocol("bulk string missing CRLF"));
        }
        Ok(RespValue::Bulk(Some(data)))
    }

    fn array(&mut self, count: i64, depth: usize) -> PkvResult<RespValue> {
        if count < -1 {
            return Err(protocol("negative array length"));
        }
        if count <= 0 {
            return Ok(RespValue::Array(Vec::new()));
        }
        if depth >= MAX_DEPTH {
            return Err(protocol("reply nested too deeply"));
        }

        let count = usize::try_from(count).map_err(|_| protocol("array length out of range"))?;
        let mut items = Vec::with_capacity(count.min(PREALLOC_LIMIT));
        for _ in 0..count {
            items.push(self.reply(depth + 1)?);
        }
        Ok(RespValue::Array(items))
    }

    fn next_line(&mut self) -> PkvResult<()> {
        self.line.clear();
        if self.reader.read_until(b'\n', self.line)? == 0 {
            return Err(eof());
        }
        match self.line.strip_suffix(b"\r\n") {
            Some(stripped) => {
                let len = stripped.len();
                self.line.truncate(len);
                Ok(())
            }
            None => Err(protocol("line missing CRLF")),
        }
    }
}

fn parse_int(text: &[u8]) -> PkvResult<i64> {
    std::str::from_utf8(text)
        .ok()
        .filter(|text| !text.starts_with('+'))
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| protocol("invalid integer"))
}

fn protocol(message: &str) -> PkvError {
    PkvError::Protocol(message.to_string())
}

fn eof() -> PkvError {
    PkvError::ConnectionBroken(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "server closed the connection",
    ))
}
