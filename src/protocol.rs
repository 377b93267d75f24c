//! Counter text protocol encoder and parser.
//!
//! A single command exists:
//!
//! ```text
//! INC <amount>
//! ```
//!
//! `<amount>` is a signed 64-bit decimal integer. One datagram carries exactly
//! one command; no line terminator is required and no response is sent.

use bytes::BytesMut;
use std::fmt::Write;
use std::str;

/// Opcode of the increment command.
pub const INC: &str = "INC";

/// Maximum payload size of a single command datagram.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// A decoded increment command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementCommand {
    pub amount: i64,
}

impl IncrementCommand {
    pub fn new(amount: i64) -> Self {
        Self { amount }
    }

    /// Encode this command into its wire form.
    pub fn encode(&self) -> BytesMut {
        encode(self.amount)
    }
}

/// Reasons a datagram could not be turned into a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload is empty or whitespace only
    Empty,
    /// Payload is not valid UTF-8
    InvalidUtf8,
    /// First token is not `INC`
    UnknownCommand(String),
    /// `INC` without an amount
    MissingAmount,
    /// Amount is not a valid integer
    InvalidNumber(String),
    /// More than two tokens
    TrailingTokens(usize),
    /// Payload longer than the accepted datagram size
    TooLarge { limit: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "Empty command"),
            DecodeError::InvalidUtf8 => write!(f, "Command is not valid UTF-8"),
            DecodeError::UnknownCommand(cmd) => write!(f, "Unknown command: {}", cmd),
            DecodeError::MissingAmount => write!(f, "Missing amount for INC"),
            DecodeError::InvalidNumber(token) => write!(f, "Invalid number: {}", token),
            DecodeError::TrailingTokens(n) => write!(f, "Unexpected {} trailing token(s)", n),
            DecodeError::TooLarge { limit } => write!(f, "Datagram exceeds {} bytes", limit),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encode an increment of `amount` as `INC <amount>`.
pub fn encode(amount: i64) -> BytesMut {
    // "INC " + sign + 19 digits
    let mut buf = BytesMut::with_capacity(24);
    // Writing into BytesMut cannot fail.
    let _ = write!(buf, "{} {}", INC, amount);
    buf
}

/// Decode one datagram payload.
pub fn decode(payload: &[u8]) -> Result<IncrementCommand, DecodeError> {
    decode_with_limit(payload, MAX_DATAGRAM_SIZE)
}

/// Decode one datagram payload no longer than `limit` bytes.
pub fn decode_with_limit(payload: &[u8], limit: usize) -> Result<IncrementCommand, DecodeError> {
    if payload.len() > limit {
        return Err(DecodeError::TooLarge { limit });
    }

    let text = str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8)?;
    let mut parts = text.split_whitespace();

    let opcode = parts.next().ok_or(DecodeError::Empty)?;
    if opcode != INC {
        return Err(DecodeError::UnknownCommand(opcode.to_string()));
    }

    let token = parts.next().ok_or(DecodeError::MissingAmount)?;
    let amount = token
        .parse::<i64>()
        .map_err(|_| DecodeError::InvalidNumber(token.to_string()))?;

    let extra = parts.count();
    if extra > 0 {
        return Err(DecodeError::TrailingTokens(extra));
    }

    Ok(IncrementCommand { amount })
}
