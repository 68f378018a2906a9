//! Line to event demultiplexing.

use tracing::{trace, warn};

use crate::decoder::LineDecoder;
use crate::event::{SkillEvent, StreamEvent};

const DATA_PREFIX: &str = "data: ";

/// Turns framed lines into typed events.
///
/// A `start` is only forwarded when it is the first since the last `end`.
/// The flag covers the whole stream, not individual result ids.
#[derive(Debug, Default)]
pub struct EventDemux {
    in_run: bool,
}

impl EventDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Event for one line, if it carries one worth dispatching.
    pub fn feed_line(&mut self, line: &str) -> Option<StreamEvent> {
        let payload = line.strip_prefix(DATA_PREFIX)?;
        let record: SkillEvent = match serde_json::from_str(payload) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, line = %payload, "skipping malformed event line");
                return None;
            }
        };
        let kind = record.event.clone();
        let Some(event) = StreamEvent::from_record(record) else {
            warn!(%kind, "skipping event of unknown kind");
            return None;
        };

        match event {
            StreamEvent::SkillStart { .. } => {
                if self.in_run {
                    trace!("suppressing repeated start");
                    return None;
                }
                self.in_run = true;
            }
            StreamEvent::SkillEnd { .. } => self.in_run = false,
            _ => {}
        }
        Some(event)
    }
}

/// Bytes in, events out: [`LineDecoder`] followed by [`EventDemux`].
#[derive(Debug, Default)]
pub struct StreamDecoder {
    lines: LineDecoder,
    demux: EventDemux,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.lines
            .push(chunk)
            .iter()
            .filter_map(|line| self.demux.feed_line(line))
            .collect()
    }

    /// Flush the trailing unterminated line at end of stream.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        let line = self.lines.finish()?;
        self.demux.feed_line(&line)
    }
}
