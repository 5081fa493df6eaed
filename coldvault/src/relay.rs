//! A bounded pipe which bridges async producers and blocking consumers.
//!
//! Source objects are downloaded with async code, but the compressor operates on the synchronous
//! `Read` and `Write` traits and runs on a blocking worker thread.  The relay connects the two:
//! the download side pushes chunks into the [`RelayWriter`] while the compressor pulls bytes out
//! of the [`RelayReader`].  At most `depth` chunks are in flight; once the relay is full the
//! writer waits until the reader has caught up, so a whole object is never buffered in memory.

use bytes::{buf::Reader, Buf, Bytes};
use std::io::Read;
use tokio::sync::mpsc;

/// Create a relay which buffers at most `depth` chunks.
pub(crate) fn relay(depth: usize) -> (RelayWriter, RelayReader) {
    let (sender, receiver) = mpsc::channel(depth.max(1));

    (
        RelayWriter { sender },
        RelayReader {
            buffer: None,
            receiver,
        },
    )
}

/// The async write end of a relay.
///
/// Dropping the writer signals EOF to the reader.
#[derive(Debug)]
pub(crate) struct RelayWriter {
    sender: mpsc::Sender<std::io::Result<Bytes>>,
}

impl RelayWriter {
    /// Push a chunk into the relay, waiting for space if the relay is full.
    ///
    /// Returns `false` if the reader has been dropped, in which case nobody will ever read this
    /// chunk and the producer should stop.
    pub async fn send(&self, chunk: Bytes) -> bool {
        self.sender.send(Ok(chunk)).await.is_ok()
    }

    /// Terminate the relay with an error instead of EOF.
    ///
    /// The reader will fail its next read with this error once it has drained the chunks sent
    /// before it, so that whatever consumes the data can't mistake a truncated stream for a
    /// complete one.
    pub async fn fail(self, error: std::io::Error) {
        // If the reader is already gone there is nobody left to tell
        let _ = self.sender.send(Err(error)).await;
    }
}

/// The blocking read end of a relay.
///
/// NOTE: The [`Read`] implementation will panic if any of its `read_*` methods are called from an
/// async context.  Blocking reads must be performed in a blocking worker thread, using
/// [`tokio::task::spawn_blocking`].
#[derive(Debug)]
pub(crate) struct RelayReader {
    buffer: Option<Reader<Bytes>>,
    receiver: mpsc::Receiver<std::io::Result<Bytes>>,
}

impl Read for RelayReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // If there's an existing buffer of data left over from a prior read, try to satisfy the
        // read request that way
        if let Some(mut buffer) = self.buffer.take() {
            if buffer.get_ref().remaining() > 0 {
                // It's possible that `buf` is bigger than the available bytes in the buffer, but
                // `Read` doesn't require us to fill it completely and this keeps the code simpler.
                let bytes_read = buffer.read(buf)?;

                if buffer.get_ref().remaining() > 0 {
                    self.buffer = Some(buffer);
                }

                return Ok(bytes_read);
            }
        }

        // Skip over empty chunks; a zero-byte read must only ever mean EOF
        loop {
            match self.receiver.blocking_recv() {
                None => {
                    // The writer was dropped.  That means EOF as far as the reader is concerned
                    return Ok(0);
                }
                Some(Err(e)) => {
                    return Err(e);
                }
                Some(Ok(bytes)) if bytes.is_empty() => continue,
                Some(Ok(bytes)) => {
                    let mut buffer = bytes.reader();

                    let bytes_read = buffer.read(buf)?;

                    if buffer.get_ref().remaining() > 0 {
                        self.buffer = Some(buffer);
                    }

                    return Ok(bytes_read);
                }
            }
        }
    }
}
