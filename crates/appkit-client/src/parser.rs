//! Incremental Server-Sent Events decoder.
//!
//! Bytes are accumulated until a blank line closes a frame, so a frame
//! split across network reads is only decoded once it is complete.

use appkit_types::AppKitError;

/// One `data:` line of a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    /// Last event id seen on the stream when this line was decoded.
    pub id: Option<String>,
    /// Value of the frame's `event:` line, if any.
    pub event: Option<String>,
    pub data: String,
}

impl SseMessage {
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or(appkit_types::EVENT_MESSAGE)
    }
}

pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Output of one [`SseParser::feed`] call.
#[derive(Debug, Default)]
pub struct Feed {
    pub messages: Vec<SseMessage>,
    /// Set when the partial frame outgrew the buffer limit and was dropped.
    /// Deliver `messages` first: the parser has already moved past them.
    pub overflow: Option<AppKitError>,
}

#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    max_buffer_size: usize,
    last_event_id: Option<String>,
}

impl SseParser {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer_size,
            last_event_id: None,
        }
    }

    /// Seed the resume point used before any `id:` line arrives.
    pub fn with_last_event_id(mut self, id: Option<String>) -> Self {
        self.last_event_id = id;
        self
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Bytes held back waiting for a frame boundary.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame, keeping the tracked last event id.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Feed one network read and return the messages it completed.
    ///
    /// When the undelimited remainder grows past the configured limit it is
    /// discarded and [`Feed::overflow`] is set. Frames completed earlier in
    /// the same read are still returned, since the tracked last event id
    /// already covers them.
    pub fn feed(&mut self, chunk: &[u8]) -> Feed {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut feed = Feed::default();
        while let Some(end) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
            self.decode_frame(&frame[..end], &mut feed.messages);
        }

        if self.buffer.len() > self.max_buffer_size {
            let size = self.buffer.len();
            self.buffer.clear();
            feed.overflow = Some(AppKitError::BufferOverflow {
                size,
                limit: self.max_buffer_size,
            });
        }
        feed
    }

    fn decode_frame(&mut self, frame: &[u8], messages: &mut Vec<SseMessage>) {
        let text = String::from_utf8_lossy(frame);
        let mut event = None;
        for line in text.split('\n') {
            if let Some(id) = field(line, "id") {
                self.last_event_id = Some(id.to_string());
            } else if let Some(name) = field(line, "event") {
                event = Some(name.to_string());
            } else if let Some(data) = field(line, "data") {
                messages.push(SseMessage {
                    id: self.last_event_id.clone(),
                    event: event.clone(),
                    data: data.to_string(),
                });
            }
        }
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_SIZE)
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Value of `name: value` (the space after the colon is optional).
fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}
