//! Concrete transports for the relay: tokio readers and writers at the
//! ends, line and JSON transforms in between.

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use sluice_core::{Chunk, StreamError};
use sluice_streams::{Emit, Fetch, Fetched, Pusher, Transform};

/// Upper bound for a single read, whatever the buffer has room for.
const MAX_READ: usize = 64 * 1024;

// ── Ends ──────────────────────────────────────────────────────────────────

pub struct ReaderFetch<R> {
    reader: R,
}

impl<R> ReaderFetch<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: AsyncRead + Unpin + Send + 'static> Fetch<Bytes> for ReaderFetch<R> {
    fn fetch(&mut self, size_hint: usize) -> BoxFuture<'_, Result<Fetched<Bytes>, StreamError>> {
        Box::pin(async move {
            let mut buf = BytesMut::with_capacity(size_hint.clamp(1, MAX_READ));
            let n = self.reader.read_buf(&mut buf).await?;
            if n == 0 {
                return Ok(Fetched::End);
            }
            tracing::trace!(bytes = n, "read");
            Ok(Fetched::Chunks(vec![buf.freeze()]))
        })
    }
}

pub struct WriterEmit<W> {
    writer: W,
}

impl<W> WriterEmit<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W, T> Emit<T> for WriterEmit<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
    T: Chunk + AsRef<[u8]>,
{
    fn emit(&mut self, chunk: T) -> BoxFuture<'_, Result<(), StreamError>> {
        Box::pin(async move {
            self.writer.write_all(chunk.as_ref()).await?;
            Ok(())
        })
    }

    fn batching(&self) -> bool {
        true
    }

    fn emit_batch(&mut self, chunks: Vec<T>) -> BoxFuture<'_, Result<(), StreamError>> {
        Box::pin(async move {
            for chunk in &chunks {
                self.writer.write_all(chunk.as_ref()).await?;
            }
            tracing::trace!(chunks = chunks.len(), "batch written");
            Ok(())
        })
    }

    fn finalize(&mut self) -> BoxFuture<'_, Result<(), StreamError>> {
        Box::pin(async move {
            self.writer.flush().await?;
            Ok(())
        })
    }
}

// ── Transforms ────────────────────────────────────────────────────────────

/// Bytes in, one `String` per line out (newline stripped). A trailing line
/// without a newline is emitted on flush.
#[derive(Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    fn take_line(bytes: Vec<u8>) -> Result<String, StreamError> {
        let mut line = String::from_utf8(bytes).map_err(StreamError::transport)?;
        if line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}

impl Transform<Bytes, String> for LineSplitter {
    fn transform(
        &mut self,
        chunk: Bytes,
        out: Pusher<String>,
    ) -> BoxFuture<'_, Result<(), StreamError>> {
        let mut result = Ok(());
        let mut rest = &chunk[..];
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];
            match Self::take_line(std::mem::take(&mut self.partial)) {
                Ok(line) => {
                    out.push(line);
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        if result.is_ok() {
            self.partial.extend_from_slice(rest);
        }
        Box::pin(async move { result })
    }

    fn flush(&mut self, out: Pusher<String>) -> BoxFuture<'_, Result<(), StreamError>> {
        let result = if self.partial.is_empty() {
            Ok(())
        } else {
            Self::take_line(std::mem::take(&mut self.partial)).map(|line| {
                out.push(line);
            })
        };
        Box::pin(async move { result })
    }
}

/// Re-serializes each non-blank line as compact JSON, newline-terminated.
pub struct JsonNormaliser;

impl Transform<String, String> for JsonNormaliser {
    fn transform(
        &mut self,
        line: String,
        out: Pusher<String>,
    ) -> BoxFuture<'_, Result<(), StreamError>> {
        let result = if line.trim().is_empty() {
            Ok(())
        } else {
            serde_json::from_str::<serde_json::Value>(&line)
                .and_then(|value| serde_json::to_string(&value))
                .map(|mut compact| {
                    compact.push('\n');
                    out.push(compact);
                })
                .map_err(StreamError::transport)
        };
        Box::pin(async move { result })
    }
}
