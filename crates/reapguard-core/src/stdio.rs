use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_stream::StreamExt;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};

/// Shared text accumulator for a child's stdout or stderr.
///
/// Text past `limit` bytes is dropped and the buffer is marked as overflowed.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<BufferState>>,
}

#[derive(Debug, Default)]
struct BufferState {
    text: String,
    limit: usize,
    overflowed: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufferState {
                limit,
                ..Default::default()
            })),
        }
    }

    pub fn push_str(&self, chunk: &str) {
        let mut state = self.inner.lock();
        let room = state.limit.saturating_sub(state.text.len());
        if chunk.len() <= room {
            state.text.push_str(chunk);
            return;
        }

        let mut cut = room;
        while !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        state.text.push_str(&chunk[..cut]);
        state.overflowed = true;
    }

    pub fn contents(&self) -> String {
        self.inner.lock().text.clone()
    }

    pub fn overflowed(&self) -> bool {
        self.inner.lock().overflowed
    }

    pub fn limit(&self) -> usize {
        self.inner.lock().limit
    }
}

/// Decodes arbitrary byte chunks into UTF-8 text without splitting a
/// multi-byte sequence across frames
struct Utf8Codec;

impl Decoder for Utf8Codec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        match std::str::from_utf8(src) {
            Ok(s) => {
                let out = s.to_owned();
                src.clear();
                Ok(Some(out))
            }
            // Incomplete trailing sequence: emit the valid prefix, keep the rest
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                if valid == 0 {
                    return Ok(None);
                }

                let out = String::from_utf8_lossy(&src[..valid]).into_owned();
                src.advance(valid);
                Ok(Some(out))
            }
            // Invalid bytes are replaced rather than failing the whole stream
            Err(e) => {
                let end = e.valid_up_to() + e.error_len().unwrap_or(1);
                let out = String::from_utf8_lossy(&src[..end]).into_owned();
                src.advance(end);
                Ok(Some(out))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let out = String::from_utf8_lossy(src).into_owned();
                src.clear();
                Ok(Some(out))
            }
        }
    }
}

/// Copy everything from `io` into `out` until EOF
pub async fn stream<R: AsyncRead + Unpin>(io: R, out: OutputBuffer) -> std::io::Result<()> {
    let mut frames = FramedRead::with_capacity(io, Utf8Codec, 1024);
    while let Some(frame) = frames.next().await {
        out.push_str(&frame?);
    }
    Ok(())
}
