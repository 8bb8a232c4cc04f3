//! Newline-delimited JSON framing
//!
//! [`FrameReader`] pulls fixed-size chunks off a byte stream and reassembles
//! them into complete frames, so a frame may span any number of reads.
//! [`FrameWriter`] serializes one [`Command`] per line behind a lock, so
//! concurrent senders on one connection never interleave partial writes.

use crate::{Command, MAX_FRAME_LEN, READ_CHUNK_SIZE};
use log::debug;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid command: {0}")]
    InvalidCommand(serde_json::Error),
    #[error("frame exceeds {limit} bytes without a newline")]
    Oversized { limit: usize },
    #[error("stream ended inside a frame ({pending} bytes pending)")]
    Truncated { pending: usize },
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// True for framing violations by the peer. I/O failures and well-formed
    /// frames that are not a valid command are not protocol errors.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            FrameError::Malformed(_) | FrameError::Oversized { .. } | FrameError::Truncated { .. }
        )
    }
}

/// Encodes a command as one wire frame, newline included.
pub fn encode(command: &Command) -> Result<Vec<u8>, FrameError> {
    let mut frame = serde_json::to_vec(command)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decodes the contents of one frame (without its newline).
///
/// Text that is not JSON is `Malformed`. Valid JSON that does not describe a
/// command is `InvalidCommand`, and the stream stays usable after it.
pub fn decode(frame: &[u8]) -> Result<Command, FrameError> {
    let value: serde_json::Value = serde_json::from_slice(frame)?;
    Command::deserialize(value).map_err(FrameError::InvalidCommand)
}

pub struct FrameReader<R> {
    inner: R,
    buffer: Vec<u8>,
    chunk_size: usize,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limits(inner, READ_CHUNK_SIZE, MAX_FRAME_LEN)
    }

    pub fn with_limits(inner: R, chunk_size: usize, max_frame_len: usize) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            chunk_size: chunk_size.max(1),
            max_frame_len,
        }
    }

    /// Returns the next command, or `None` once the peer closes the stream on
    /// a frame boundary.
    ///
    /// Cancel safe: bytes already read stay buffered if the future is dropped.
    pub async fn next_command(&mut self) -> Result<Option<Command>, FrameError> {
        let mut chunk = vec![0u8; self.chunk_size];

        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                if pos > self.max_frame_len {
                    return Err(FrameError::Oversized {
                        limit: self.max_frame_len,
                    });
                }
                let frame: Vec<u8> = self.buffer.drain(..=pos).collect();
                let body = &frame[..frame.len() - 1];
                debug!("frame in: {}", String::from_utf8_lossy(body));
                return decode(body).map(Some);
            }

            if self.buffer.len() > self.max_frame_len {
                return Err(FrameError::Oversized {
                    limit: self.max_frame_len,
                });
            }

            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                if self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
                    self.buffer.clear();
                    return Ok(None);
                }
                return Err(FrameError::Truncated {
                    pending: self.buffer.len(),
                });
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

pub struct FrameWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Writes one frame. The whole frame goes out under the writer lock.
    pub async fn send(&self, command: &Command) -> Result<(), FrameError> {
        let frame = encode(command)?;
        let mut writer = self.inner.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), FrameError> {
        let mut writer = self.inner.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}
