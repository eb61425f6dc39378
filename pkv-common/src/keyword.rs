//! # Protocol Keywords
//!
//! Static byte spellings for the commands and option keywords this runtime
//! emits. Keeping them in enums means every token on the wire comes from a
//! single table instead of scattered string literals.

/// Top-level command names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Ping,
    Get,
    Set,
    Del,
    Eval,
    EvalSha,
    Script,
    TsIncrBy,
    TsDecrBy,
}

impl Command {
    /// Returns the wire spelling of the command.
    pub const fn as_bytes(self) -> &'static [u8] {
        match self {
            Command::Ping => b"PING",
            Command::Get => b"GET",
            Command::Set => b"SET",
            Command::Del => b"DEL",
            Command::Eval => b"EVAL",
            Command::EvalSha => b"EVALSHA",
            Command::Script => b"SCRIPT",
            Command::TsIncrBy => b"TS.INCRBY",
            Command::TsDecrBy => b"TS.DECRBY",
        }
    }
}

/// Subcommands and option keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    // SCRIPT subcommands
    Load,
    Exists,
    Flush,
    Kill,
    // SCRIPT FLUSH modes
    Sync,
    Async,
    // SET options
    Nx,
    Xx,
    Get,
    Ex,
    Px,
    ExAt,
    PxAt,
    KeepTtl,
    // Time-series options
    Timestamp,
    Retention,
    Encoding,
    ChunkSize,
    DuplicatePolicy,
    Ignore,
    Labels,
}

impl Keyword {
    /// Returns the wire spelling of the keyword.
    pub const fn as_bytes(self) -> &'static [u8] {
        match self {
            Keyword::Load => b"LOAD",
            Keyword::Exists => b"EXISTS",
            Keyword::Flush => b"FLUSH",
            Keyword::Kill => b"KILL",
            Keyword::Sync => b"SYNC",
            Keyword::Async => b"ASYNC",
            Keyword::Nx => b"NX",
            Keyword::Xx => b"XX",
            Keyword::Get => b"GET",
            Keyword::Ex => b"EX",
            Keyword::Px => b"PX",
            Keyword::ExAt => b"EXAT",
            Keyword::PxAt => b"PXAT",
            Keyword::KeepTtl => b"KEEPTTL",
            Keyword::Timestamp => b"TIMESTAMP",
            Keyword::Retention => b"RETENTION",
            Keyword::Encoding => b"ENCODING",
            Keyword::ChunkSize => b"CHUNK_SIZE",
            Keyword::DuplicatePolicy => b"DUPLICATE_POLICY",
            Keyword::Ignore => b"IGNORE",
            Keyword::Labels => b"LABELS",
        }
    }
}

/// Mode for `SCRIPT FLUSH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    Sync,
    Async,
}

impl FlushMode {
    pub const fn keyword(self) -> Keyword {
        match self {
            FlushMode::Sync => Keyword::Sync,
            FlushMode::Async => Keyword::Async,
        }
    }
}
