//! Streaming parser for CGI response output
//!
//! The interpreter writes a header block terminated by an empty line and then
//! the body. Stdout is buffered until the `\r\n\r\n` boundary shows up; at that
//! point the status line and headers are emitted once and everything after the
//! boundary is forwarded as body. Stderr is forwarded untouched.

use crate::error::CgiError;
use hyper::body::Bytes;

const BOUNDARY: &[u8] = b"\r\n\r\n";
const LINE_END: &str = "\r\n";

/// Events produced while decoding one run's output
#[derive(Debug)]
pub enum CgiEvent {
    /// Status code from the first line of the header block
    Status(u16),
    /// One header line; duplicates are emitted as they appear
    Header(String, String),
    /// All headers have been emitted
    BodyStart,
    /// A chunk of response body
    Body(Bytes),
    /// A chunk of diagnostic output
    Stderr(Bytes),
    /// The process finished
    End,
    /// The run failed
    Error(CgiError),
}

enum ParseState {
    /// Accumulating the header block; `scanned` is how far the boundary search got
    Headers { buf: Vec<u8>, scanned: usize },
    Body,
}

/// Incremental decoder for one process's stdout and stderr
pub struct ResponseParser {
    state: ParseState,
    completed: bool,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Headers {
                buf: Vec::new(),
                scanned: 0,
            },
            completed: false,
        }
    }

    /// Whether `End` or `Error` has been emitted
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Whether the header boundary has been found
    pub fn in_body(&self) -> bool {
        matches!(self.state, ParseState::Body)
    }

    /// Feed a chunk of primary output
    pub fn push_stdout(&mut self, chunk: &[u8]) -> Vec<CgiEvent> {
        if self.completed {
            return Vec::new();
        }

        let (buf, scanned) = match &mut self.state {
            ParseState::Body => return vec![CgiEvent::Body(Bytes::copy_from_slice(chunk))],
            ParseState::Headers { buf, scanned } => {
                buf.extend_from_slice(chunk);
                (buf, scanned)
            }
        };

        let Some(offset) = find_boundary(buf, *scanned) else {
            // The next search only needs to overlap the last few bytes
            *scanned = buf.len().saturating_sub(BOUNDARY.len() - 1);
            return Vec::new();
        };

        let buf = std::mem::take(buf);
        self.state = ParseState::Body;

        let head = String::from_utf8_lossy(&buf[..offset]);
        let mut lines = head.split(LINE_END);
        let status_line = lines.next().unwrap_or("");
        let status = match parse_status(status_line) {
            Ok(status) => status,
            Err(e) => {
                self.completed = true;
                return vec![CgiEvent::Error(e)];
            }
        };

        let mut events = vec![CgiEvent::Status(status)];
        for line in lines {
            let (name, value) = line.split_once(':').unwrap_or((line, ""));
            events.push(CgiEvent::Header(
                name.trim().to_string(),
                value.trim().to_string(),
            ));
        }
        events.push(CgiEvent::BodyStart);
        events.push(CgiEvent::Body(Bytes::copy_from_slice(
            &buf[offset + BOUNDARY.len()..],
        )));
        events
    }

    /// Feed a chunk of diagnostic output
    pub fn push_stderr(&mut self, chunk: &[u8]) -> Vec<CgiEvent> {
        if self.completed {
            return Vec::new();
        }
        vec![CgiEvent::Stderr(Bytes::copy_from_slice(chunk))]
    }

    /// Report a clean process exit
    pub fn finish(&mut self) -> Option<CgiEvent> {
        if self.completed {
            return None;
        }
        self.completed = true;
        Some(CgiEvent::End)
    }

    /// Report a process failure. The already-exited race counts as a clean end.
    pub fn fail(&mut self, err: CgiError) -> Option<CgiEvent> {
        if err.is_already_exited() {
            return self.finish();
        }
        if self.completed {
            return None;
        }
        self.completed = true;
        Some(CgiEvent::Error(err))
    }
}

fn find_boundary(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(BOUNDARY.len())
        .position(|w| w == BOUNDARY)
        .map(|pos| pos + from)
}

/// Extract the first run of decimal digits from the status line
fn parse_status(line: &str) -> Result<u16, CgiError> {
    let line = line.trim();
    let digits: String = line
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();

    if digits.is_empty() {
        return Err(CgiError::ProtocolViolation(format!(
            "no status code in '{}'",
            line
        )));
    }

    digits.parse().map_err(|_| {
        CgiError::ProtocolViolation(format!("status code out of range in '{}'", line))
    })
}
