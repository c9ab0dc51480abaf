use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Maximum size of a single protocol line (1MB), including a pending partial line
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Value of `type` that marks an authentication message
pub const AUTH_MESSAGE_TYPE: &str = "auth";

/// Command name reported in the envelope acknowledging a successful `auth`
pub const AUTH_COMMAND: &str = "auth";

/// Error codes carried in the `code` field of failure envelopes.
///
/// Handlers may attach codes of their own (e.g. `NotFound`); these are the
/// ones the connection layer itself produces.
pub mod codes {
    pub const FORBIDDEN: &str = "forbidden";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const BAD_REQUEST: &str = "bad_request";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const NOT_FOUND: &str = "NotFound";
    pub const INVALID_PATH: &str = "InvalidPath";
}

/// Message sent from a client to the agent.
///
/// The same shape carries both authentication (`type: "auth"`, `token`) and
/// command requests (`cmd`, `args`). `id` is an opaque correlation value echoed
/// back in the response. `type`, `token` and `cmd` holding anything other
/// than a string read as absent, so a well-formed object always yields a
/// message whose `id` can be echoed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub id: Value,
    #[serde(
        default,
        rename = "type",
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub token: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_str().map(str::to_string))
}

impl ClientMessage {
    /// Build an authentication message
    pub fn auth(id: impl Into<Value>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: Some(AUTH_MESSAGE_TYPE.to_string()),
            token: Some(token.into()),
            ..Default::default()
        }
    }

    /// Build a command request
    pub fn command(id: impl Into<Value>, cmd: impl Into<String>, args: Option<Value>) -> Self {
        Self {
            id: id.into(),
            cmd: Some(cmd.into()),
            args,
            ..Default::default()
        }
    }

    pub fn is_auth(&self) -> bool {
        self.kind.as_deref() == Some(AUTH_MESSAGE_TYPE)
    }
}

/// Envelope sent from the agent for every processed line.
///
/// Success: `{id, ok: true, command, content}`.
/// Failure: `{id, ok: false, code, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Value,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Create a success envelope
    pub fn ok(id: Value, command: impl Into<String>, content: Value) -> Self {
        Response {
            id,
            ok: true,
            command: Some(command.into()),
            content: Some(content),
            code: None,
            error: None,
        }
    }

    /// Create a failure envelope
    pub fn error(id: Value, code: impl Into<String>, message: impl Into<String>) -> Self {
        Response {
            id,
            ok: false,
            command: None,
            content: None,
            code: Some(code.into()),
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Error code of a failure envelope, `None` on success
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

/// Result of parsing one protocol line
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// Empty or whitespace-only line, silently skipped
    Empty,
    /// The line is not a JSON object
    Malformed(String),
    Message(ClientMessage),
}

/// Parse one line (without its `\n` terminator) into a client message.
///
/// A single trailing `\r` is tolerated. Empty lines are distinguished from
/// malformed ones so the caller can skip the former silently.
pub fn parse_line(line: &[u8]) -> ParsedLine {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => return ParsedLine::Malformed(ProtocolError::from(e).to_string()),
    };
    if text.trim().is_empty() {
        return ParsedLine::Empty;
    }

    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return ParsedLine::Malformed(ProtocolError::Decode(e).to_string()),
    };
    if !value.is_object() {
        return ParsedLine::Malformed("expected a JSON object".to_string());
    }

    match serde_json::from_value(value) {
        Ok(message) => ParsedLine::Message(message),
        Err(e) => ParsedLine::Malformed(ProtocolError::Decode(e).to_string()),
    }
}

/// Encode a response as one newline-terminated JSON line
pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(response).map_err(ProtocolError::Encode)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Encode a success envelope
pub fn encode_ok(id: Value, command: &str, content: Value) -> Result<Vec<u8>> {
    encode_response(&Response::ok(id, command, content))
}

/// Encode a failure envelope
pub fn encode_error(id: Value, code: &str, message: &str) -> Result<Vec<u8>> {
    encode_response(&Response::error(id, code, message))
}

/// Encode a client message as one newline-terminated JSON line
pub fn encode_message(message: &ClientMessage) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message).map_err(ProtocolError::Encode)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode a response line received from the agent
pub fn decode_response(line: &[u8]) -> Result<Response> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = std::str::from_utf8(line)?;
    serde_json::from_str(text).map_err(ProtocolError::Decode)
}

/// Output of one [`LineFramer::push`]
#[derive(Debug, Default)]
pub struct Frames {
    /// Complete lines in arrival order
    pub lines: Vec<Vec<u8>>,
    /// Set when a line exceeded the limit; the stream cannot be resynchronised
    pub overflow: Option<ProtocolError>,
}

/// Splits a byte stream into `\n`-terminated lines.
///
/// Bytes after the last newline are held back and prefixed to the next
/// chunk, so a line may arrive across any number of reads.
#[derive(Debug)]
pub struct LineFramer {
    pending: Vec<u8>,
    max_line: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_limit(MAX_LINE_SIZE)
    }

    pub fn with_limit(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
        }
    }

    /// Feed a chunk and return every line it completes, without terminators.
    ///
    /// Lines that precede an oversized one are still returned, with
    /// [`ProtocolError::LineTooLong`] in [`Frames::overflow`]. Everything from
    /// the oversized line on is discarded and the framer is reset.
    pub fn push(&mut self, chunk: &[u8]) -> Frames {
        self.pending.extend_from_slice(chunk);

        let mut frames = Frames::default();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if end - start > self.max_line {
                return self.overflow(frames);
            }
            frames.lines.push(self.pending[start..end].to_vec());
            start = end + 1;
        }
        self.pending.drain(..start);

        if self.pending.len() > self.max_line {
            return self.overflow(frames);
        }
        frames
    }

    fn overflow(&mut self, mut frames: Frames) -> Frames {
        self.pending.clear();
        frames.overflow = Some(ProtocolError::LineTooLong { limit: self.max_line });
        frames
    }

    /// Number of buffered bytes not yet terminated by a newline
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
