//! Text wire protocol and incremental command parser.
//!
//! This is plumbing the original spec leaves opaque (an "opaque parser
//! collaborator" satisfying `Parse`/`Build`/`Reset`) — a concrete,
//! memcached-inspired grammar is needed for a buildable crate, but its
//! exact grammar is not itself a tested property beyond basic framing.
//!
//! ```text
//! GET <key>\r\n
//! PUT <key> <len>\r\n<bytes>\r\n
//! PUTIFABSENT <key> <len>\r\n<bytes>\r\n
//! SET <key> <len>\r\n<bytes>\r\n
//! DELETE <key>\r\n
//! ```
//!
//! Keys are at most [`MAX_KEY_LEN`] bytes and must not contain whitespace.

use crate::store::LRUStore;

/// Maximum key length accepted by the wire protocol.
pub const MAX_KEY_LEN: usize = 250;

/// A fully parsed command, ready to apply against an [`LRUStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: Vec<u8> },
    Put { key: Vec<u8>, value: Vec<u8> },
    PutIfAbsent { key: Vec<u8>, value: Vec<u8> },
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Command {
    /// Applies this command to `store`, returning the line(s) to write
    /// back to the client (already `\r\n`-terminated).
    pub fn execute(&self, store: &mut LRUStore) -> Vec<u8> {
        match self {
            Command::Get { key } => match store.get(key) {
                Some(value) => {
                    let mut out = Vec::with_capacity(value.len() + 16);
                    out.extend_from_slice(b"VALUE ");
                    out.extend_from_slice(&value.len().to_string().into_bytes());
                    out.extend_from_slice(b"\r\n");
                    out.extend_from_slice(&value);
                    out.extend_from_slice(b"\r\nEND\r\n");
                    out
                }
                None => b"NOT_FOUND\r\n".to_vec(),
            },
            Command::Put { key, value } => {
                if store.put(key, value) {
                    b"STORED\r\n".to_vec()
                } else {
                    b"TOO_LARGE\r\n".to_vec()
                }
            }
            Command::PutIfAbsent { key, value } => {
                if store.put_if_absent(key, value) {
                    b"STORED\r\n".to_vec()
                } else if key.len() + value.len() > store.max_bytes() {
                    b"TOO_LARGE\r\n".to_vec()
                } else {
                    b"EXISTS\r\n".to_vec()
                }
            }
            Command::Set { key, value } => {
                if store.set(key, value) {
                    b"STORED\r\n".to_vec()
                } else if key.len() + value.len() > store.max_bytes() {
                    b"TOO_LARGE\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                }
            }
            Command::Delete { key } => {
                if store.delete(key) {
                    b"DELETED\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                }
            }
        }
    }
}

/// Result of feeding one more chunk of bytes to the parser.
pub enum ParseOutcome {
    /// Not enough bytes buffered yet for a complete command; caller
    /// should read more and call `parse` again.
    NeedMoreData,
    /// A full command was parsed; `consumed` bytes should be dropped
    /// from the front of the caller's read buffer.
    Complete { command: Command, consumed: usize },
    /// The buffered bytes do not form a valid command.
    Invalid { consumed: usize, message: String },
}

/// Incremental parser state for one connection. Feeds bytes from a
/// growing read buffer and reports either a completed command, a parse
/// error, or a request for more data — never blocking, never assuming
/// the buffer holds a whole command.
#[derive(Default)]
pub struct CommandParser {
    state: ParseState,
}

#[derive(Default)]
enum ParseState {
    #[default]
    AwaitingLine,
    AwaitingBody {
        header_len: usize,
        kind: BodyKind,
        key: Vec<u8>,
        body_len: usize,
    },
}

#[derive(Clone, Copy)]
enum BodyKind {
    Put,
    PutIfAbsent,
    Set,
}

impl CommandParser {
    /// Creates a fresh parser, equivalent to one immediately after
    /// [`reset`](Self::reset).
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets parser state, discarding any partially parsed command.
    /// Used after a fatal parse error to resynchronize on the next line.
    pub fn reset(&mut self) {
        self.state = ParseState::AwaitingLine;
    }

    /// Attempts to parse one command out of the front of `buf`. Does not
    /// mutate `buf` — the caller is expected to drop `consumed` bytes
    /// from the front of its buffer after a `Complete` or `Invalid`
    /// result.
    pub fn parse(&mut self, buf: &[u8]) -> ParseOutcome {
        match &self.state {
            ParseState::AwaitingLine => self.parse_line(buf),
            ParseState::AwaitingBody {
                header_len,
                kind,
                key,
                body_len,
            } => {
                let needed = *header_len + *body_len + 2;
                if buf.len() < needed {
                    return ParseOutcome::NeedMoreData;
                }
                let body = &buf[*header_len..*header_len + *body_len];
                let terminator = &buf[*header_len + *body_len..needed];
                let kind = *kind;
                let key = key.clone();
                self.state = ParseState::AwaitingLine;
                if terminator != b"\r\n" {
                    return ParseOutcome::Invalid {
                        consumed: needed,
                        message: "expected CRLF after value body".to_string(),
                    };
                }
                let value = body.to_vec();
                let command = match kind {
                    BodyKind::Put => Command::Put { key, value },
                    BodyKind::PutIfAbsent => Command::PutIfAbsent { key, value },
                    BodyKind::Set => Command::Set { key, value },
                };
                ParseOutcome::Complete {
                    command,
                    consumed: needed,
                }
            }
        }
    }

    fn parse_line(&mut self, buf: &[u8]) -> ParseOutcome {
        let Some(eol) = find_crlf(buf) else {
            if buf.len() > 4096 {
                return ParseOutcome::Invalid {
                    consumed: buf.len(),
                    message: "line too long without CRLF".to_string(),
                };
            }
            return ParseOutcome::NeedMoreData;
        };
        let header_len = eol + 2;
        let line = &buf[..eol];
        let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());

        let Some(verb) = parts.next() else {
            return ParseOutcome::Invalid {
                consumed: header_len,
                message: "empty command line".to_string(),
            };
        };

        match verb.to_ascii_uppercase().as_slice() {
            b"GET" => {
                let Some(key) = parts.next() else {
                    return invalid_line(header_len, "GET requires a key");
                };
                match validate_key(key) {
                    Ok(key) => ParseOutcome::Complete {
                        command: Command::Get { key },
                        consumed: header_len,
                    },
                    Err(message) => ParseOutcome::Invalid {
                        consumed: header_len,
                        message,
                    },
                }
            }
            b"DELETE" => {
                let Some(key) = parts.next() else {
                    return invalid_line(header_len, "DELETE requires a key");
                };
                match validate_key(key) {
                    Ok(key) => ParseOutcome::Complete {
                        command: Command::Delete { key },
                        consumed: header_len,
                    },
                    Err(message) => ParseOutcome::Invalid {
                        consumed: header_len,
                        message,
                    },
                }
            }
            verb @ (b"PUT" | b"PUTIFABSENT" | b"SET") => {
                let Some(key) = parts.next() else {
                    return invalid_line(header_len, "missing key");
                };
                let key = match validate_key(key) {
                    Ok(key) => key,
                    Err(message) => {
                        return ParseOutcome::Invalid {
                            consumed: header_len,
                            message,
                        }
                    }
                };
                let Some(len_bytes) = parts.next() else {
                    return invalid_line(header_len, "missing length");
                };
                let Ok(len_str) = std::str::from_utf8(len_bytes) else {
                    return invalid_line(header_len, "length is not valid UTF-8");
                };
                let Ok(body_len) = len_str.parse::<usize>() else {
                    return invalid_line(header_len, "length is not a valid integer");
                };

                let kind = match verb {
                    b"PUT" => BodyKind::Put,
                    b"PUTIFABSENT" => BodyKind::PutIfAbsent,
                    _ => BodyKind::Set,
                };
                self.state = ParseState::AwaitingBody {
                    header_len,
                    kind,
                    key,
                    body_len,
                };
                self.parse(buf)
            }
            _ => invalid_line(header_len, "unknown command"),
        }
    }
}

fn invalid_line(consumed: usize, message: &str) -> ParseOutcome {
    ParseOutcome::Invalid {
        consumed,
        message: message.to_string(),
    }
}

fn validate_key(key: &[u8]) -> Result<Vec<u8>, String> {
    if key.is_empty() {
        return Err("key must not be empty".to_string());
    }
    if key.len() > MAX_KEY_LEN {
        return Err(format!("key exceeds {MAX_KEY_LEN} bytes"));
    }
    Ok(key.to_vec())
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
