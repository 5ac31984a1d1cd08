use std::pin::Pin;

use async_stream::try_stream;
use futures::Stream;
use serde_json::Value;

use crate::error::{classify_error_object, truncate_for_error, ProviderError};
use crate::transport::Connection;

/// One incremental update of a chat completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Text {
        role: Option<String>,
        content: Option<String>,
    },
    /// Raw `tool_calls` fragment array, merged structurally by the accumulator.
    ToolCalls(Value),
}

/// Splits an SSE byte stream into lines and decodes `data:` frames.
///
/// Bytes are buffered until a newline arrives, so frames split across network
/// reads (including inside a multi-byte character) decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` once the `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Delta>, ProviderError> {
        self.buffer.extend_from_slice(bytes);
        let mut deltas = Vec::new();
        while !self.done {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&line, &mut deltas)?;
        }
        Ok(deltas)
    }

    /// Decodes a trailing line left without a newline at end of body.
    pub fn finish(&mut self) -> Result<Vec<Delta>, ProviderError> {
        let mut deltas = Vec::new();
        if !self.done && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&line, &mut deltas)?;
        }
        self.buffer.clear();
        Ok(deltas)
    }

    fn decode_line(&mut self, raw: &[u8], out: &mut Vec<Delta>) -> Result<(), ProviderError> {
        let line = std::str::from_utf8(raw).map_err(|err| ProviderError::MalformedFrame {
            detail: format!("invalid utf-8 in stream: {err}"),
        })?;
        let line = line.trim_end_matches(['\n', '\r']);
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(());
        };
        if line.trim_end().ends_with("[DONE]") {
            self.done = true;
            return Ok(());
        }
        let data = data.trim();
        if data.is_empty() {
            return Ok(());
        }
        let frame: Value =
            serde_json::from_str(data).map_err(|err| ProviderError::MalformedFrame {
                detail: format!("{err}: {}", truncate_for_error(data, 200)),
            })?;
        decode_chunk(&frame, out)
    }
}

fn decode_chunk(frame: &Value, out: &mut Vec<Delta>) -> Result<(), ProviderError> {
    if let Some(error) = frame.get("error").filter(|e| !e.is_null()) {
        return Err(classify_error_object(None, error));
    }
    let Some(delta) = frame.pointer("/choices/0/delta") else {
        return Ok(());
    };
    push_message_parts(delta, out);
    Ok(())
}

fn push_message_parts(message: &Value, out: &mut Vec<Delta>) {
    let role = message
        .get("role")
        .and_then(Value::as_str)
        .map(str::to_string);
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);
    if role.is_some() || content.is_some() {
        out.push(Delta::Text { role, content });
    }
    if let Some(calls) = message
        .get("tool_calls")
        .filter(|calls| calls.as_array().is_some_and(|c| !c.is_empty()))
    {
        out.push(Delta::ToolCalls(calls.clone()));
    }
}

/// Decodes a non-streaming `choices[0].message` body into the same deltas a
/// stream would have produced.
pub fn read_completion(body: &[u8]) -> Result<Vec<Delta>, ProviderError> {
    let value: Value = serde_json::from_slice(body).map_err(|err| ProviderError::MalformedFrame {
        detail: format!(
            "{err}: {}",
            truncate_for_error(&String::from_utf8_lossy(body), 200)
        ),
    })?;
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        return Err(classify_error_object(None, error));
    }
    let message = value
        .pointer("/choices/0/message")
        .ok_or_else(|| ProviderError::MalformedFrame {
            detail: format!(
                "completion has no choices[0].message: {}",
                truncate_for_error(&value.to_string(), 200)
            ),
        })?;
    let mut deltas = Vec::new();
    push_message_parts(message, &mut deltas);
    Ok(deltas)
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<Delta, ProviderError>> + Send>>;

/// Lazily decodes deltas from a live connection in arrival order. Reading stops
/// at `[DONE]`; the connection is closed when the stream ends, before a decode
/// error is yielded, or when the stream is dropped.
pub fn delta_stream(connection: Connection) -> DeltaStream {
    Box::pin(decode_connection(connection))
}

fn decode_connection(
    mut connection: Connection,
) -> impl Stream<Item = Result<Delta, ProviderError>> + Send {
    try_stream! {
        let mut decoder = SseDecoder::new();
        let mut exhausted = false;
        while !exhausted && !decoder.is_done() {
            let decoded = match connection.next_chunk().await {
                Some(Ok(bytes)) => decoder.push(&bytes),
                Some(Err(err)) => Err(err),
                None => {
                    exhausted = true;
                    decoder.finish()
                }
            };
            if decoded.is_err() {
                connection.close();
            }
            for delta in decoded? {
                yield delta;
            }
        }
        connection.close();
    }
}
