//! Content-Length-framed JSON codec for the client-facing DAP channel.
//!
//! The Debug Adapter Protocol frames every message with an HTTP-style
//! `Content-Length: N\r\n\r\n` header followed by exactly `N` bytes of
//! UTF-8 JSON. This module accumulates raw bytes from the client
//! transport (stdio or a TCP socket) and yields parsed [`serde_json::Value`]
//! messages one at a time, the same incremental-state-machine shape as
//! the teacher's DAP byte parser, adapted to this protocol's specific
//! framing (`Content-Length` header rather than bare newline-delimited
//! JSON).

use std::collections::VecDeque;
use std::error::Error;
use std::fmt::Display;

use serde_json::Value;

const CONTENT_LENGTH_HEADER: &str = "Content-Length: ";

enum ParserState {
    ParsingHeader,
    ParsingContent,
}

/// Errors that can occur while decoding a framed DAP message.
#[derive(Debug)]
pub enum DapFrameError {
    MissingContentLengthHeader(String),
    InvalidContentLength(String),
    Json(serde_json::Error),
}

impl Display for DapFrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingContentLengthHeader(line) => {
                write!(f, "expected '{CONTENT_LENGTH_HEADER}' header, got: {line:?}")
            }
            Self::InvalidContentLength(val) => {
                write!(f, "invalid Content-Length value: {val:?}")
            }
            Self::Json(e) => write!(f, "malformed DAP message body: {e}"),
        }
    }
}

impl Error for DapFrameError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

/// Incremental decoder: feed it raw bytes as they arrive, pull out
/// complete DAP messages as they become available.
pub struct DapReader {
    buffer: VecDeque<u8>,
    state: ParserState,
    header_acc: Vec<u8>,
    body_acc: Vec<u8>,
    remaining: usize,
}

impl Default for DapReader {
    fn default() -> Self {
        Self::new()
    }
}

impl DapReader {
    pub fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            state: ParserState::ParsingHeader,
            header_acc: Vec::new(),
            body_acc: Vec::new(),
            remaining: 0,
        }
    }

    /// Appends freshly-read bytes to the internal buffer.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes);
    }

    /// Pulls the next complete message out of the buffer, if one is
    /// fully available. Returns `None` when more bytes are needed.
    pub fn next_message(&mut self) -> Option<Result<Value, DapFrameError>> {
        loop {
            match self.state {
                ParserState::ParsingHeader => {
                    let byte = self.buffer.pop_front()?;
                    self.header_acc.push(byte);

                    if !self.header_acc.ends_with(b"\r\n\r\n") {
                        continue;
                    }

                    let header = self.header_acc[..self.header_acc.len() - 4].to_vec();
                    self.header_acc.clear();

                    let header_str = String::from_utf8_lossy(&header).into_owned();
                    // There can be multiple header lines; only Content-Length matters.
                    let content_length_line = header_str
                        .lines()
                        .find(|line| line.starts_with(CONTENT_LENGTH_HEADER));

                    let Some(line) = content_length_line else {
                        return Some(Err(DapFrameError::MissingContentLengthHeader(header_str)));
                    };

                    let len_str = &line[CONTENT_LENGTH_HEADER.len()..];
                    match len_str.trim().parse::<usize>() {
                        Ok(n) => {
                            self.remaining = n;
                            self.state = ParserState::ParsingContent;
                        }
                        Err(_) => {
                            return Some(Err(DapFrameError::InvalidContentLength(
                                len_str.to_string(),
                            )));
                        }
                    }
                }
                ParserState::ParsingContent => {
                    if self.remaining == 0 {
                        let body = std::mem::take(&mut self.body_acc);
                        self.state = ParserState::ParsingHeader;
                        return Some(
                            serde_json::from_slice::<Value>(&body).map_err(DapFrameError::Json),
                        );
                    }

                    let byte = self.buffer.pop_front()?;
                    self.body_acc.push(byte);
                    self.remaining -= 1;
                }
            }
        }
    }
}

/// Encodes a DAP message value into its wire representation
/// (`Content-Length` header + body).
pub fn encode(message: &Value) -> Vec<u8> {
    let body = message.to_string();
    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(CONTENT_LENGTH_HEADER.as_bytes());
    out.extend_from_slice(body.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
    out.extend_from_slice(body.as_bytes());
    out
}
