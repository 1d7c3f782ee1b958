//! Server-sent events framing
//!
//! Incremental decoder for `text/event-stream` bodies. Bytes are buffered
//! until a full line is available, so UTF-8 sequences split across network
//! chunks decode correctly.

use tracing::debug;
use vigil_core::domain::log::LogEntry;
use vigil_core::dto::log::{StreamEvent, TerminalEvent};

use crate::error::{ClientError, Result};

/// One dispatched SSE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, `None` means the default `message` event
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
}

/// Line-oriented SSE decoder
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the body, returning every frame it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.feed_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.event.is_none() && self.data.is_empty() {
                return None;
            }
            return Some(SseFrame {
                event: self.event.take(),
                data: std::mem::take(&mut self.data).join("\n"),
            });
        }

        // Comment, used by servers as keep-alive
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Interpret a frame of the job log stream
///
/// `log` frames carry a [`LogEntry`], `complete` frames a [`TerminalEvent`].
/// Default `message` frames may carry a tagged [`StreamEvent`]. Anything
/// else is ignored.
pub fn decode_frame(frame: &SseFrame) -> Result<Option<StreamEvent>> {
    let event = match frame.event.as_deref().unwrap_or("message") {
        "log" => StreamEvent::Log(parse::<LogEntry>(&frame.data)?),
        "complete" | "terminal" => StreamEvent::Terminal(parse::<TerminalEvent>(&frame.data)?),
        "message" if !frame.data.is_empty() => parse::<StreamEvent>(&frame.data)?,
        other => {
            debug!("Ignoring SSE frame '{}'", other);
            return Ok(None);
        }
    };
    Ok(Some(event))
}

fn parse<T: serde::de::DeserializeOwned>(data: &str) -> Result<T> {
    serde_json::from_str(data)
        .map_err(|e| ClientError::ParseError(format!("Invalid stream event payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::domain::job::JobStatus;

    #[test]
    fn test_decodes_frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();

        assert!(decoder.push(b"event: log\nda").is_empty());
        let frames = decoder.push(b"ta: {\"a\":1}\n\nevent: complete\r\ndata: x\r\n\r\n");

        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: Some("log".to_string()),
                    data: "{\"a\":1}".to_string(),
                },
                SseFrame {
                    event: Some("complete".to_string()),
                    data: "x".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_utf8_split_inside_a_character() {
        let mut decoder = SseDecoder::new();
        let text = "data: caf\u{e9}\n\n".as_bytes();
        let (head, tail) = text.split_at(10);

        assert!(decoder.push(head).is_empty());
        let frames = decoder.push(tail);
        assert_eq!(frames[0].data, "caf\u{e9}");
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keep-alive\n\ndata: one\ndata: two\nid: 4\n\n");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, None);
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn test_decode_terminal_frame() {
        let frame = SseFrame {
            event: Some("complete".to_string()),
            data: r#"{"status":"COMPLETED","message":"done"}"#.to_string(),
        };

        let event = decode_frame(&frame).unwrap();
        assert_eq!(
            event,
            Some(StreamEvent::Terminal(TerminalEvent {
                status: JobStatus::Completed,
                message: Some("done".to_string()),
            }))
        );
    }

    #[test]
    fn test_decode_ignores_unknown_events() {
        let frame = SseFrame {
            event: Some("heartbeat".to_string()),
            data: String::new(),
        };
        assert_eq!(decode_frame(&frame).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        let frame = SseFrame {
            event: Some("log".to_string()),
            data: "{not json".to_string(),
        };
        assert!(matches!(
            decode_frame(&frame),
            Err(ClientError::ParseError(_))
        ));
    }
}
