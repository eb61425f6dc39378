// pkv-common - Shared types for the PoolKV client runtime
//
// Error taxonomy, protocol keywords, and the command-argument encoder.

pub mod args;
pub mod error;
pub mod keyword;
pub mod params;

// Re-export for convenience
pub use args::{encode, CommandArguments, IntoArg, Params};
pub use error::{is_noscript_message, PkvError, PkvResult, NOSCRIPT_PREFIX};
pub use keyword::{Command, FlushMode, Keyword};
pub use params::{DuplicatePolicy, EncodingFormat, SetCondition, SetExpiry, SetParams, TsIncrByParams};
