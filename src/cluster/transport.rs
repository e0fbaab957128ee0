//! Newline-delimited framing over any async byte stream (TCP, duplex pipes).

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};

use crate::cluster::protocol::{decode, encode, Message};
use crate::error::{Result, SwarmError};

/// Frames longer than this are rejected rather than buffered.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_frame: usize,
    /// Inside an oversize frame that was already reported; skip to its end.
    discarding: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_FRAME_BYTES)
    }

    pub fn with_limit(reader: R, max_frame: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
            max_frame,
            discarding: false,
        }
    }

    /// Next message, or `None` once the peer closed the stream.
    ///
    /// A bad frame (undecodable, not UTF-8, or over the size limit) yields
    /// `Err(ProtocolViolation)` and leaves the reader positioned at the
    /// following frame, so the caller may keep reading. At most
    /// `max_frame + 1` bytes of one frame are ever buffered.
    ///
    /// Cancel safe: bytes of a partially read frame are kept for the next call.
    pub async fn next(&mut self) -> Result<Option<Message>> {
        loop {
            let room = (self.max_frame + 1).saturating_sub(self.buf.len()) as u64;
            let n = (&mut self.inner).take(room).read_until(b'\n', &mut self.buf).await?;
            let complete = self.buf.last() == Some(&b'\n');

            if !complete {
                if self.buf.len() > self.max_frame {
                    self.buf.clear();
                    if !self.discarding {
                        self.discarding = true;
                        return Err(SwarmError::ProtocolViolation(format!(
                            "frame exceeds {} bytes",
                            self.max_frame
                        )));
                    }
                    continue;
                }
                if n > 0 {
                    continue;
                }
                // eof
                if self.buf.is_empty() || self.discarding {
                    self.buf.clear();
                    return Ok(None);
                }
            }

            let frame = std::mem::take(&mut self.buf);
            if std::mem::replace(&mut self.discarding, false) {
                // tail of an oversize frame
                continue;
            }
            let text = std::str::from_utf8(&frame)
                .map_err(|_| SwarmError::ProtocolViolation("frame is not valid UTF-8".into()))?;
            if text.trim().is_empty() {
                continue;
            }
            return decode(text).map(Some);
        }
    }
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let mut frame = encode(message)?;
        frame.push('\n');
        self.inner.write_all(frame.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

pub fn split<S>(stream: S) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    (FrameReader::new(read), FrameWriter::new(write))
}
