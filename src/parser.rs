//! incremental parser for openai-style `data:` streams.
//!
//! bytes go in as they arrive off the wire; complete lines come out as
//! [`StreamEvent`]s. frames that aren't content (comments, `event:` lines,
//! unparsable json, usage-only chunks) are dropped without ending the stream.

use bevy::log::{debug, warn};
use serde::Deserialize;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// incremental assistant text; may be empty.
    ContentDelta(String),
    /// the `[DONE]` sentinel was seen.
    Terminate,
}

#[derive(Deserialize)]
struct CompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// line-buffering parser for one response stream. not restartable: once
/// the sentinel is seen, further input yields nothing.
#[derive(Debug, Default)]
pub struct StreamParser {
    buf: Vec<u8>,
    // bytes before `start` belong to lines already yielded
    start: usize,
    // `buf[start..scanned]` is known to hold no newline
    scanned: usize,
    terminated: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// buffers `chunk` and lazily yields the events of every line it completed.
    pub fn consume(&mut self, chunk: &[u8]) -> Events<'_> {
        if !self.terminated {
            if self.start > 0 {
                self.buf.drain(..self.start);
                self.scanned -= self.start;
                self.start = 0;
            }
            self.buf.extend_from_slice(chunk);
        }
        Events { parser: self }
    }

    /// flushes a trailing line the transport closed without a newline.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.terminated || self.start == self.buf.len() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buf);
        line.drain(..self.start);
        self.start = 0;
        self.scanned = 0;
        self.parse_line(&line)
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') else {
            self.scanned = self.buf.len();
            return None;
        };
        let end = self.scanned + offset;
        let line = self.buf[self.start..end].to_vec();
        self.start = end + 1;
        self.scanned = self.start;
        Some(line)
    }

    fn parse_line(&mut self, raw: &[u8]) -> Option<StreamEvent> {
        let Ok(line) = std::str::from_utf8(raw) else {
            debug!(target: "bevy_unillm", "skipping non-utf8 frame ({} bytes)", raw.len());
            return None;
        };
        let payload = line.trim().strip_prefix(DATA_PREFIX)?.trim();

        if payload == DONE_SENTINEL {
            self.terminated = true;
            self.buf.clear();
            self.start = 0;
            self.scanned = 0;
            return Some(StreamEvent::Terminate);
        }

        match serde_json::from_str::<CompletionChunk>(payload) {
            Ok(CompletionChunk { choices }) => match choices.into_iter().next() {
                Some(ChunkChoice { delta }) => {
                    Some(StreamEvent::ContentDelta(delta.content.unwrap_or_default()))
                }
                None => {
                    debug!(target: "bevy_unillm", "skipping chunk with empty choices");
                    None
                }
            },
            Err(err) => {
                if serde_json::from_str::<serde_json::Value>(payload).is_ok() {
                    warn!(target: "bevy_unillm", "skipping non-content frame: {}", payload);
                } else {
                    debug!(target: "bevy_unillm", "skipping malformed frame: {}", err);
                }
                None
            }
        }
    }
}

/// events produced by one [`StreamParser::consume`] call.
pub struct Events<'a> {
    parser: &'a mut StreamParser,
}

impl Iterator for Events<'_> {
    type Item = StreamEvent;

    fn next(&mut self) -> Option<StreamEvent> {
        while !self.parser.terminated {
            let line = self.parser.next_line()?;
            if let Some(event) = self.parser.parse_line(&line) {
                return Some(event);
            }
        }
        None
    }
}
