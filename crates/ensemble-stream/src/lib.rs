//! Streaming thought/message splitter.
//!
//! Demultiplexes a raw token stream into `thought` events (text inside
//! `<think>...</think>` spans) and `message` events (everything else),
//! tolerating tags torn across chunk boundaries. No character is ever
//! dropped or duplicated; output order preserves input order.

use serde::{Deserialize, Serialize};

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum StreamEvent {
    Thought(String),
    Message(String),
}

impl StreamEvent {
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::Thought(text) | Self::Message(text) => text,
        }
    }
}

/// Push-based splitter state machine. Feed chunks with [`push`], then call
/// [`finish`] once the stream ends to flush whatever is still withheld.
///
/// [`push`]: ThoughtSplitter::push
/// [`finish`]: ThoughtSplitter::finish
#[derive(Debug, Default)]
pub struct ThoughtSplitter {
    in_thought: bool,
    buffer: String,
}

impl ThoughtSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        loop {
            if self.in_thought {
                if let Some(idx) = self.buffer.find(CLOSE_TAG) {
                    if idx > 0 {
                        out.push(StreamEvent::Thought(self.buffer[..idx].to_string()));
                    }
                    self.buffer.drain(..idx + CLOSE_TAG.len());
                    self.in_thought = false;
                    continue;
                }
                // Withhold the last len(tag)-1 bytes in case the closing tag
                // is split across chunk boundaries.
                let safe = self
                    .buffer
                    .floor_char_boundary(self.buffer.len().saturating_sub(CLOSE_TAG.len() - 1));
                if safe > 0 {
                    out.push(StreamEvent::Thought(self.buffer[..safe].to_string()));
                    self.buffer.drain(..safe);
                }
                break;
            }

            if let Some(idx) = self.buffer.find(OPEN_TAG) {
                if idx > 0 {
                    out.push(StreamEvent::Message(self.buffer[..idx].to_string()));
                }
                self.buffer.drain(..idx + OPEN_TAG.len());
                self.in_thought = true;
                continue;
            }

            // If the buffer ends in a prefix of the opening tag, withhold
            // exactly that prefix rather than emitting a torn tag as
            // visible content.
            if let Some(lt) = self.buffer.rfind('<') {
                let suffix = &self.buffer[lt..];
                if OPEN_TAG.starts_with(suffix) {
                    if lt > 0 {
                        out.push(StreamEvent::Message(self.buffer[..lt].to_string()));
                        self.buffer.drain(..lt);
                    }
                    break;
                }
            }

            if !self.buffer.is_empty() {
                out.push(StreamEvent::Message(std::mem::take(&mut self.buffer)));
            }
            break;
        }

        out
    }

    /// Flush remaining buffer content as whichever type is currently active.
    /// An incomplete tag at stream end is treated as literal content rather
    /// than being lost.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(if self.in_thought {
            StreamEvent::Thought(rest)
        } else {
            StreamEvent::Message(rest)
        })
    }
}

/// Split an already-complete text into `(message, thoughts)` in one call.
#[must_use]
pub fn split_complete(text: &str) -> (String, String) {
    let mut splitter = ThoughtSplitter::new();
    let mut events = splitter.push(text);
    events.extend(splitter.finish());

    let mut message = String::new();
    let mut thoughts = String::new();
    for event in events {
        match event {
            StreamEvent::Message(part) => message.push_str(&part),
            StreamEvent::Thought(part) => thoughts.push_str(&part),
        }
    }
    (message, thoughts)
}
