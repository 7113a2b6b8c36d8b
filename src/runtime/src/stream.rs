//! Blocking writer feeding an async response body.

use std::io::{self, Write};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Bytes buffered before a chunk is handed to the body.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Chunks in flight between the composer and the client.
pub const CHANNEL_DEPTH: usize = 16;

/// Stream of body chunks produced by a [`ChannelWriter`].
pub type BodyStream = ReceiverStream<io::Result<Bytes>>;

/// Create a writer and the body stream it feeds.
pub fn body_channel() -> (ChannelWriter, BodyStream) {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    (ChannelWriter::new(tx), ReceiverStream::new(rx))
}

/// `std::io::Write` over a bounded channel of `Bytes`.
///
/// Writes block while the channel is full, so a slow client throttles the
/// producer. Must only be used from a blocking thread.
pub struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: BytesMut,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            buf: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }

    fn send(&mut self, chunk: Bytes) -> io::Result<()> {
        self.tx.blocking_send(Ok(chunk)).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "response body receiver dropped")
        })
    }

    fn flush_buf(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.send(chunk)
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.tx.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "response body receiver dropped",
            ));
        }
        let room = CHUNK_SIZE - self.buf.len();
        let n = data.len().min(room);
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= CHUNK_SIZE {
            self.flush_buf()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buf()
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        let _ = self.flush_buf();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bytes_arrive_in_order() {
        let (mut writer, stream) = body_channel();
        let producer = tokio::task::spawn_blocking(move || {
            let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
            writer.write_all(&payload).unwrap();
            writer.flush().unwrap();
            payload
        });

        let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;
        let expected = producer.await.unwrap();
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_SIZE));
        assert_eq!(chunks.concat(), expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drop_flushes_tail() {
        let (writer, stream) = body_channel();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            writer.write_all(b"tail").unwrap();
        })
        .await
        .unwrap();

        let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.concat(), b"tail");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropped_receiver_is_broken_pipe() {
        let (mut writer, stream) = body_channel();
        drop(stream);

        let err = tokio::task::spawn_blocking(move || writer.write_all(b"data").unwrap_err())
            .await
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
