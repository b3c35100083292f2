//! Incremental decoding of `text/event-stream` bodies.

use crate::{ClientError, Result};
use bytes::BytesMut;
use genq_core::SafeTask;
use serde::Deserialize;
use tokio_util::codec::Decoder;

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Line-oriented event-stream decoder. Comment lines (heartbeats) are
/// consumed silently; an event is emitted at each blank line.
#[derive(Debug, Default)]
pub struct SseCodec {
    pending: Option<SseFrame>,
}

impl Decoder for SseCodec {
    type Item = SseFrame;
    type Error = ClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SseFrame>> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };
            let raw = src.split_to(pos + 1);
            let line = std::str::from_utf8(&raw[..pos])
                .map_err(|e| ClientError::InvalidResponse(format!("non-utf8 event line: {}", e)))?
                .trim_end_matches('\r');

            if line.is_empty() {
                if let Some(frame) = self.pending.take() {
                    return Ok(Some(frame));
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            let frame = self.pending.get_or_insert_with(SseFrame::default);
            match field {
                "event" => frame.event = Some(value.to_string()),
                "data" => {
                    if !frame.data.is_empty() {
                        frame.data.push('\n');
                    }
                    frame.data.push_str(value);
                }
                _ => {}
            }
        }
    }
}

/// Typed view of the events emitted by `/events`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected { client_id: String },
    TaskUpdate(Box<SafeTask>),
    Other { event: Option<String>, data: String },
}

impl StreamEvent {
    pub fn task(&self) -> Option<&SafeTask> {
        match self {
            StreamEvent::TaskUpdate(task) => Some(task),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedPayload {
    client_id: String,
}

impl TryFrom<SseFrame> for StreamEvent {
    type Error = ClientError;

    fn try_from(frame: SseFrame) -> Result<Self> {
        let invalid = |e: serde_json::Error| ClientError::InvalidResponse(e.to_string());
        match frame.event.as_deref() {
            Some("connected") => {
                let payload: ConnectedPayload = serde_json::from_str(&frame.data).map_err(invalid)?;
                Ok(StreamEvent::Connected {
                    client_id: payload.client_id,
                })
            }
            Some("task_update") => Ok(StreamEvent::TaskUpdate(Box::new(
                serde_json::from_str(&frame.data).map_err(invalid)?,
            ))),
            _ => Ok(StreamEvent::Other {
                event: frame.event,
                data: frame.data,
            }),
        }
    }
}
