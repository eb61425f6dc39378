//! # Command Arguments
//!
//! Purpose: Hold the ordered token sequence for one command and turn typed
//! values into their canonical wire bytes.
//!
//! ## Design Principles
//! 1. **Append-Only**: Tokens are only ever pushed; nothing is reordered.
//! 2. **Canonical Numbers**: Integers and floats use locale-free decimal text.
//! 3. **Cheap Clones**: Tokens are `Bytes`, so static keywords never allocate.
//! 4. **Consume-Once Params**: Parameter objects are moved into the encoder.

use std::fmt;

use bytes::Bytes;

use crate::keyword::{Command, FlushMode, Keyword};

/// Converts a value into a single wire token.
pub trait IntoArg {
    fn into_arg(self) -> Bytes;
}

impl IntoArg for Bytes {
    fn into_arg(self) -> Bytes {
        self
    }
}

impl IntoArg for Vec<u8> {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &[u8] {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl<const N: usize> IntoArg for &[u8; N] {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl IntoArg for &str {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for String {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &String {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for Command {
    fn into_arg(self) -> Bytes {
        Bytes::from_static(self.as_bytes())
    }
}

impl IntoArg for Keyword {
    fn into_arg(self) -> Bytes {
        Bytes::from_static(self.as_bytes())
    }
}

impl IntoArg for FlushMode {
    fn into_arg(self) -> Bytes {
        self.keyword().into_arg()
    }
}

macro_rules! int_into_arg {
    ($($ty:ty),*) => {
        $(
            impl IntoArg for $ty {
                fn into_arg(self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

int_into_arg!(i32, i64, u32, u64, usize);

impl IntoArg for f64 {
    fn into_arg(self) -> Bytes {
        if self == f64::INFINITY {
            Bytes::from_static(b"+inf")
        } else if self == f64::NEG_INFINITY {
            Bytes::from_static(b"-inf")
        } else {
            // `Display` for f64 is the shortest round-trip form and never
            // uses exponent notation or locale separators.
            Bytes::from(self.to_string())
        }
    }
}

/// Optional-argument record that appends its present fields to a command.
///
/// `add_params` takes `self` by value: a parameter object is encoded exactly
/// once and cannot be mutated afterwards.
pub trait Params {
    fn add_params(self, args: &mut CommandArguments);
}

/// Ordered token sequence for a single command.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CommandArguments {
    tokens: Vec<Bytes>,
}

impl CommandArguments {
    /// Starts a new argument list with the command token.
    pub fn new(command: impl IntoArg) -> Self {
        CommandArguments {
            tokens: vec![command.into_arg()],
        }
    }

    /// Appends one token.
    pub fn add(&mut self, arg: impl IntoArg) -> &mut Self {
        self.tokens.push(arg.into_arg());
        self
    }

    /// Appends every token from `args` in iteration order.
    pub fn add_all<I>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: IntoArg,
    {
        self.tokens.extend(args.into_iter().map(IntoArg::into_arg));
        self
    }

    /// Appends the tokens of a parameter object, consuming it.
    pub fn add_params<P: Params>(&mut self, params: P) -> &mut Self {
        params.add_params(self);
        self
    }

    /// Returns the first token (the command name), if any.
    pub fn command(&self) -> Option<&[u8]> {
        self.tokens.first().map(|token| token.as_ref())
    }

    /// Returns all tokens in wire order.
    pub fn tokens(&self) -> &[Bytes] {
        &self.tokens
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.tokens.iter().map(|token| token.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Total payload bytes across all tokens (excluding framing).
    pub fn payload_len(&self) -> usize {
        self.tokens.iter().map(Bytes::len).sum()
    }
}

impl fmt::Debug for CommandArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.tokens.iter().map(|token| String::from_utf8_lossy(token)))
            .finish()
    }
}

/// Encodes a parameter object into a fresh token sequence.
pub fn encode<P: Params>(params: P) -> CommandArguments {
    let mut args = CommandArguments::default();
    params.add_params(&mut args);
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_strings(args: &CommandArguments) -> Vec<String> {
        args.iter()
            .map(|token| String::from_utf8_lossy(token).into_owned())
            .collect()
    }

    #[test]
    fn builds_tokens_in_append_order() {
        let mut args = CommandArguments::new(Command::Set);
        args.add(b"key").add("value").add(Keyword::Ex).add(10u64);
        assert_eq!(as_strings(&args), ["SET", "key", "value", "EX", "10"]);
        assert_eq!(args.command(), Some(&b"SET"[..]));
    }

    #[test]
    fn numbers_use_canonical_text() {
        let mut args = CommandArguments::default();
        args.add(-42i64)
            .add(0u64)
            .add(1.5f64)
            .add(2.0f64)
            .add(f64::INFINITY)
            .add(f64::NEG_INFINITY)
            .add(0.1f64);
        assert_eq!(as_strings(&args), ["-42", "0", "1.5", "2", "+inf", "-inf", "0.1"]);
    }

    #[test]
    fn add_all_preserves_iteration_order() {
        let mut args = CommandArguments::new(Command::Del);
        args.add_all([&b"a"[..], &b"b"[..], &b"c"[..]]);
        assert_eq!(as_strings(&args), ["DEL", "a", "b", "c"]);
        assert_eq!(args.payload_len(), 6);
    }

    #[test]
    fn flush_mode_maps_to_keyword() {
        let mut args = CommandArguments::new(Command::Script);
        args.add(Keyword::Flush).add(FlushMode::Async);
        assert_eq!(as_strings(&args), ["SCRIPT", "FLUSH", "ASYNC"]);
    }
}
