//! Wire framing for the MCP stdio transport.
//!
//! Two framings exist in the wild: LSP-style `Content-Length` headers and
//! newline-delimited JSON. The encoder always writes the framing declared
//! for a server; the decoder accepts both opportunistically, so a channel
//! survives a server that mixes or misidentifies its framing.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// On-the-wire message framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    ContentLength,
    Ndjson,
}

/// Serialize a message and frame it for the wire.
pub fn encode<T: Serialize>(message: &T, framing: Framing) -> Result<Vec<u8>> {
    let json = serde_json::to_string(message)?;
    Ok(frame(&json, framing))
}

/// Frame an already-serialized JSON payload.
pub fn frame(json: &str, framing: Framing) -> Vec<u8> {
    match framing {
        Framing::ContentLength => {
            let mut out = format!("Content-Length: {}\r\n\r\n", json.len()).into_bytes();
            out.extend_from_slice(json.as_bytes());
            out
        }
        Framing::Ndjson => {
            let mut out = json.as_bytes().to_vec();
            out.push(b'\n');
            out
        }
    }
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^content-length:\s*(\d+)\s*$").unwrap())
}

fn content_length(header: &str) -> Option<usize> {
    let caps = header_re().captures(header)?;
    caps.get(1)?.as_str().parse().ok()
}

enum Step {
    /// A complete message was extracted.
    Msg(Value),
    /// Bytes were consumed but produced no message (blank or garbage line).
    Skip,
    /// Nothing more can be extracted until more bytes arrive.
    Stall,
}

/// Incremental decoder over an accumulating byte buffer.
///
/// Each pass tries content-length framing first, then falls back to taking
/// one newline-delimited line. Malformed JSON is skipped without affecting
/// later messages.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Extract every complete message currently in the buffer.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        loop {
            match self.step() {
                Step::Msg(msg) => out.push(msg),
                Step::Skip => continue,
                Step::Stall => break,
            }
        }
        out
    }

    /// Bytes waiting for completion (incomplete frame, if any).
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    fn step(&mut self) -> Step {
        if let Some((header_end, sep_len)) = self.find_header_sep() {
            let header = String::from_utf8_lossy(&self.buf[..header_end]).into_owned();
            if let Some(len) = content_length(&header) {
                let total = header_end + sep_len + len;
                if self.buf.len() < total {
                    return Step::Stall;
                }
                let consumed: Vec<u8> = self.buf.drain(..total).collect();
                let body = &consumed[header_end + sep_len..];
                return match serde_json::from_slice(body) {
                    Ok(msg) => Step::Msg(msg),
                    Err(_) => Step::Skip,
                };
            }
            // Separator present but no valid header before it; let the line
            // scanner chew through it.
        }

        let Some(nl) = self.buf.iter().position(|&b| b == b'\n') else {
            return Step::Stall;
        };
        let line = String::from_utf8_lossy(&self.buf[..nl]).into_owned();
        let trimmed = line.trim();
        // A lone line matching the content-length header is the front of a
        // frame whose separator and body have not arrived yet; consuming it
        // would corrupt the frame.
        if content_length(trimmed).is_some() {
            return Step::Stall;
        }
        let parsed = if trimmed.starts_with('{') && trimmed.ends_with('}') {
            serde_json::from_str(trimmed).ok()
        } else {
            None
        };
        self.buf.drain(..=nl);
        match parsed {
            Some(msg) => Step::Msg(msg),
            None => Step::Skip,
        }
    }

    /// First header/body separator: CRLFCRLF or LFLF, whichever comes first.
    fn find_header_sep(&self) -> Option<(usize, usize)> {
        let crlf = find(&self.buf, b"\r\n\r\n");
        let lf = find(&self.buf, b"\n\n");
        match (crlf, lf) {
            (Some(c), Some(l)) if c < l => Some((c, 4)),
            (Some(c), None) => Some((c, 4)),
            (_, Some(l)) => Some((l, 2)),
            (None, None) => None,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
