use std::fmt::Display;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};

use crate::error::ProviderError;

/// Splits a server-sent-events body into the `data` of each event.
///
/// Lines are buffered as bytes so multi-byte characters split across chunks survive.
/// Consecutive `data:` lines of one event are joined with `\n`; a blank line ends the
/// event. A `[DONE]` payload ends the stream.
pub(crate) fn data_payloads<S, B, E>(chunks: S) -> impl Stream<Item = Result<String, ProviderError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    try_stream! {
        let mut chunks = Box::pin(chunks);
        let mut buffer: Vec<u8> = Vec::new();
        let mut event = EventData::default();
        let mut finished = false;

        'read: while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|err| ProviderError::Stream(err.to_string()))?;
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(newline_index) = buffer.iter().position(|byte| *byte == b'\n') {
                let line = buffer.drain(..=newline_index).collect::<Vec<u8>>();
                let Some(payload) = event.push_line(&String::from_utf8_lossy(&line)) else {
                    continue;
                };
                if payload == "[DONE]" {
                    finished = true;
                    break 'read;
                }
                yield payload;
            }
        }

        if !finished {
            if !buffer.is_empty() {
                event.push_line(&String::from_utf8_lossy(&buffer));
            }
            if let Some(payload) = event.take() {
                if payload != "[DONE]" {
                    yield payload;
                }
            }
        }
    }
}

#[derive(Default)]
struct EventData {
    lines: Vec<String>,
}

impl EventData {
    /// Feeds one line; returns the event's data once a blank line ends it.
    fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return self.take();
        }

        // `event:`, `id:` and `:` comment lines carry nothing the providers read.
        if let Some(value) = line.strip_prefix("data:") {
            self.lines
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        None
    }

    fn take(&mut self) -> Option<String> {
        let data = std::mem::take(&mut self.lines).join("\n");
        if data.trim().is_empty() {
            None
        } else {
            Some(data)
        }
    }
}
