use capsules_js_exec::{decode_frame, Frame, ProtocolError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Reads newline-delimited frames from a worker's stdout.
///
/// Reads are capped one byte past the frame limit, so a worker that never
/// writes a newline cannot make the supervisor buffer without bound.
pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
            line: Vec::new(),
        }
    }

    /// Next frame, or `None` on a clean end of stream.
    ///
    /// Cancel safe only between frames; the supervisor never drops a pending
    /// call and then reads again.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        self.line.clear();
        let limit = self.max_frame_bytes as u64 + 1;
        let read = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.line)
            .await?;

        if read == 0 {
            return Ok(None);
        }
        if self.line.len() > self.max_frame_bytes {
            return Err(ProtocolError::Oversized {
                limit: self.max_frame_bytes,
            });
        }
        if self.line.last() != Some(&b'\n') {
            return Err(ProtocolError::Truncated);
        }
        decode_frame(&self.line).map(Some)
    }
}
