//! `Content-Length` framing for JSON-RPC over a child's stdio.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::backend::BackendError;

/// Upper bound on a single message body (16 MiB).
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct MessageReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Returns `Ok(None)` when the stream ends cleanly between messages.
    pub async fn read(&mut self) -> Result<Option<Value>, BackendError> {
        let Some(length) = self.content_length().await? else {
            return Ok(None);
        };
        if length > MAX_BODY_BYTES {
            return Err(BackendError::Frame(format!(
                "body of {length} bytes exceeds {MAX_BODY_BYTES}"
            )));
        }

        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).await?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn content_length(&mut self) -> Result<Option<usize>, BackendError> {
        let mut length = None;
        let mut line = String::new();
        let mut in_headers = false;

        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                if in_headers {
                    return Err(BackendError::Frame("stream ended inside headers".into()));
                }
                return Ok(None);
            }
            in_headers = true;

            let header = line.trim();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                if name.trim().eq_ignore_ascii_case("Content-Length") {
                    let parsed = value.trim().parse::<usize>().map_err(|e| {
                        BackendError::Frame(format!("bad Content-Length {value:?}: {e}"))
                    })?;
                    length = Some(parsed);
                }
            }
        }

        length
            .map(Some)
            .ok_or_else(|| BackendError::Frame("missing Content-Length".into()))
    }
}

pub struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write(&mut self, message: &Value) -> Result<(), BackendError> {
        let body = serde_json::to_vec(message)?;
        self.writer
            .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
            .await?;
        self.writer.write_all(&body).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
