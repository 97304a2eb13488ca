//! Minimal server-sent-events support: a bounded `data:` parser for upstream
//! streams and the matching encoder for the events this proxy emits.

use bytes::Bytes;
use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

use crate::{ProxyError, Result};

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Encodes one `data: <payload>\n\n` event.
pub fn encode_data_event(payload: &str) -> Bytes {
    let mut out = String::with_capacity(payload.len() + 8);
    out.push_str("data: ");
    out.push_str(payload);
    out.push_str("\n\n");
    Bytes::from(out)
}

async fn read_line_limited<R>(reader: &mut R, out: &mut Vec<u8>, max_bytes: usize) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    out.clear();

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }

        let newline_pos = buf.iter().position(|b| *b == b'\n');
        let take_len = newline_pos.map(|pos| pos + 1).unwrap_or(buf.len());

        if out.len().saturating_add(take_len) > max_bytes {
            return Err(ProxyError::InvalidResponse(format!(
                "SSE line exceeds max_line_bytes={max_bytes}"
            )));
        }

        out.extend_from_slice(&buf[..take_len]);
        reader.consume(take_len);

        if newline_pos.is_some() {
            return Ok(true);
        }
    }
}

/// Reads the next event's joined `data:` payload. `None` at end of input or at `[DONE]`.
async fn read_next_data<R>(
    reader: &mut R,
    line_bytes: &mut Vec<u8>,
    buffer: &mut String,
    limits: SseLimits,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buffer.clear();

    loop {
        let has_line = read_line_limited(reader, line_bytes, limits.max_line_bytes.max(1)).await?;
        if !has_line {
            if buffer.is_empty() || buffer == DONE_SENTINEL {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        let line = std::str::from_utf8(line_bytes)
            .map_err(|err| ProxyError::InvalidResponse(format!("invalid SSE UTF-8: {err}")))?;
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            if buffer.is_empty() {
                continue;
            }
            if buffer == DONE_SENTINEL {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        let rest = rest.trim_start();
        let separator_bytes = usize::from(!buffer.is_empty());
        if buffer
            .len()
            .saturating_add(separator_bytes)
            .saturating_add(rest.len())
            > limits.max_event_bytes
        {
            return Err(ProxyError::InvalidResponse(format!(
                "SSE event exceeds max_event_bytes={}",
                limits.max_event_bytes
            )));
        }
        if separator_bytes == 1 {
            buffer.push('\n');
        }
        buffer.push_str(rest);
    }
}

pub fn sse_data_stream_from_reader<R>(
    reader: R,
    limits: SseLimits,
) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        (reader, Vec::<u8>::new(), String::new()),
        move |(mut reader, mut line_bytes, mut buffer)| async move {
            match read_next_data(&mut reader, &mut line_bytes, &mut buffer, limits).await? {
                Some(data) => Ok(Some((data, (reader, line_bytes, buffer)))),
                None => Ok(None),
            }
        },
    ))
}

pub fn sse_data_stream_from_response(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String>> {
    let byte_stream = response.bytes_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(byte_stream);
    sse_data_stream_from_reader(tokio::io::BufReader::new(reader), SseLimits::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn reader_for(raw: String) -> tokio::io::BufReader<impl AsyncBufRead + Unpin + Send> {
        let stream = stream::iter([Ok::<_, std::io::Error>(Bytes::from(raw))]);
        tokio::io::BufReader::new(StreamReader::new(stream))
    }

    #[tokio::test]
    async fn parses_data_lines_and_stops_at_done() -> crate::Result<()> {
        let sse = concat!(
            ": keep-alive\n",
            "data: {\"id\":1}\n\n",
            "data: line1\r\n",
            "data: line2\r\n\r\n",
            "data: [DONE]\n\n",
            "data: {\"id\":\"after-done\"}\n\n",
        );

        let mut out = Vec::new();
        let mut data =
            sse_data_stream_from_reader(reader_for(sse.to_owned()), SseLimits::default());
        while let Some(item) = data.next().await {
            out.push(item?);
        }

        assert_eq!(out, vec!["{\"id\":1}", "line1\nline2"]);
        Ok(())
    }

    #[tokio::test]
    async fn trailing_event_without_blank_line_is_emitted() -> crate::Result<()> {
        let mut data =
            sse_data_stream_from_reader(reader_for("data: tail".to_owned()), SseLimits::default());
        assert_eq!(data.next().await.transpose()?.as_deref(), Some("tail"));
        assert!(data.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn rejects_lines_over_limit() {
        let sse = format!("data: {}\n\n", "x".repeat(1024));
        let mut data = sse_data_stream_from_reader(
            reader_for(sse),
            SseLimits {
                max_line_bytes: 64,
                max_event_bytes: 4096,
            },
        );

        let err = data.next().await.and_then(|item| item.err());
        assert!(err.is_some_and(|err| err.to_string().contains("max_line_bytes")));
    }

    #[test]
    fn encodes_data_event() {
        assert_eq!(encode_data_event("[DONE]"), Bytes::from_static(b"data: [DONE]\n\n"));
    }
}
