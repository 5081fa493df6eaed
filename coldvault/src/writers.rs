//! Helpers which construct destination writers with commit-on-close semantics.
//!
//! A destination writer is a [`DuplexStream`] whose other end is drained by an upload task
//! belonging to the [`crate::DestinationStorage`] implementation.  The upload task buffers or
//! uploads the data as it arrives, but it doesn't make the object visible until it is told to by
//! [`PendingObject::commit`].  Every other outcome, including simply dropping the
//! [`PendingObject`], discards the upload.
use crate::{ColdVaultError, Result};
use bytes::{Bytes, BytesMut};
use std::future::Future;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Capacity of the in-memory pipe between whoever writes an object and the upload task
const WRITER_PIPE_CAPACITY: usize = 256 * 1024;

/// What the upload task should do once the writer has been closed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadDecision {
    /// Make the uploaded data visible as the object
    Commit,

    /// Discard everything that was uploaded
    Abort,
}

/// Handle to an object upload that has not been committed yet.
///
/// Obtained from [`crate::DestinationStorage::open_object_writer`] together with the stream the
/// object data are written to.
#[derive(Debug)]
pub struct PendingObject {
    bucket: String,
    key: String,
    decision_sender: oneshot::Sender<UploadDecision>,
    result_receiver: oneshot::Receiver<Result<u64>>,
}

impl PendingObject {
    /// Make the object visible at the destination.
    ///
    /// The writer stream must have been dropped (or shut down) before calling this, otherwise the
    /// upload task is still waiting for more data and this will never complete.
    ///
    /// Returns the number of bytes committed.
    pub async fn commit(self) -> Result<u64> {
        // If the upload task already exited with an error it won't receive this, which is fine;
        // the error is waiting in the result channel
        let _ = self.decision_sender.send(UploadDecision::Commit);

        match self.result_receiver.await {
            Ok(result) => result,
            Err(_) => crate::error::UploadAbandonedSnafu {
                bucket: self.bucket,
                key: self.key,
            }
            .fail(),
        }
    }

    /// Discard the upload.
    ///
    /// If the upload task had already failed by itself, that failure is returned so the caller
    /// can report it.
    pub async fn abort(self) -> Option<ColdVaultError> {
        let _ = self.decision_sender.send(UploadDecision::Abort);

        match self.result_receiver.await {
            Ok(Err(e)) => Some(e),
            Ok(Ok(_)) => None,
            Err(_) => {
                warn!(bucket = %self.bucket, key = %self.key, "upload task exited without reporting a result");
                None
            }
        }
    }
}

/// Construct an object writer whose data are consumed by `upload`.
///
/// `upload` is run in a new async task.  It receives the read end of the pipe, and a receiver
/// which yields the caller's [`UploadDecision`] once the caller has decided.  If the caller drops
/// the [`PendingObject`] without deciding, the receiver yields an error which the upload task
/// must treat as [`UploadDecision::Abort`]; [`await_decision`] does exactly that.
pub(crate) fn object_writer<F, Fut>(
    bucket: &str,
    key: &str,
    upload: F,
) -> (DuplexStream, PendingObject)
where
    F: FnOnce(DuplexStream, oneshot::Receiver<UploadDecision>) -> Fut,
    Fut: Future<Output = Result<u64>> + Send + 'static,
{
    let (bytes_writer, bytes_reader) = tokio::io::duplex(WRITER_PIPE_CAPACITY);
    let (decision_sender, decision_receiver) = oneshot::channel();
    let (result_sender, result_receiver) = oneshot::channel();

    let upload_fut = upload(bytes_reader, decision_receiver);
    tokio::spawn(async move {
        // If sending fails the `PendingObject` was dropped, so nobody cares about the result
        if result_sender.send(upload_fut.await).is_err() {
            debug!("pending object was dropped; upload result discarded");
        }
    });

    (
        bytes_writer,
        PendingObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            decision_sender,
            result_receiver,
        },
    )
}

/// Wait for the owner of the [`PendingObject`] to decide what to do with the upload.
pub(crate) async fn await_decision(receiver: oneshot::Receiver<UploadDecision>) -> UploadDecision {
    receiver.await.unwrap_or_else(|_| {
        debug!("pending object dropped without a decision; treating as abort");
        UploadDecision::Abort
    })
}

/// Read from the pipe until `chunk_size` bytes have been read, or until the writer end has been
/// closed.
///
/// Returns an empty buffer only when there are no more data at all.
pub(crate) async fn read_chunk(
    reader: &mut DuplexStream,
    chunk_size: usize,
) -> std::io::Result<Bytes> {
    let mut buffer = BytesMut::with_capacity(chunk_size);

    // Read until the buffer is full, or until a 0 byte read indicates that this is the end of the
    // data coming over the duplex.  Unlike `read_buf` on its own, this never reads past
    // `chunk_size`.
    while buffer.len() < chunk_size {
        let mut limited = (&mut *reader).take((chunk_size - buffer.len()) as u64);
        let bytes_read = limited.read_buf(&mut buffer).await?;

        if bytes_read == 0 {
            // EOF.  Whatever we've read in `buffer` up to this point is the final chunk
            break;
        }
    }

    Ok(buffer.freeze())
}
