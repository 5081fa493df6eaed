//! The bounded-concurrency transfer pipeline which copies objects from the source store to the
//! destination store, compressing them on the way.
//!
//! Every object is copied by its own task, but at most `Config::max_concurrent_transfers` of
//! them hold a transfer slot, and only a task holding a slot performs any I/O.  Within a
//! transfer, the object is never held in memory as a whole:
//!
//! ```text
//!   source stream --(async pump)--> relay --(blocking gzip)--> duplex --(upload task)--> destination
//! ```
//!
//! Each stage has a bounded buffer, so a slow destination slows down the reads from the source
//! rather than growing memory usage.
use crate::failures::TransferFailures;
use crate::objstore::{AuthToken, DestinationStorage, ObjectByteStream, SourceStorage};
use crate::progress::{BackupProgressCallback, ProgressCounter};
use crate::relay::{relay, RelayReader, RelayWriter};
use crate::{ColdVaultError, Config, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::{FutureExt, StreamExt};
use snafu::IntoError;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// What a successful transfer moved
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Bytes read from the source object
    pub bytes_read: u64,

    /// Compressed bytes committed at the destination
    pub bytes_written: u64,
}

/// The result of transferring one object.  A failed transfer carries exactly one error.
pub type TransferOutcome = Result<TransferStats>;

/// The combined result of transferring every object in a container
#[derive(Debug, Default)]
pub struct ContainerTransfer {
    /// The objects that failed, in the order they failed
    pub failures: TransferFailures,

    /// How many transfers completed, successfully or not
    pub completed: usize,

    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Copies objects from a source store into a destination store
#[derive(Clone, Debug)]
pub struct TransferPipeline {
    source: Box<dyn SourceStorage>,
    destination: Box<dyn DestinationStorage>,
    token: AuthToken,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    relay_depth: usize,
    compression_level: u32,
    progress_interval: usize,
}

impl TransferPipeline {
    /// Make a new pipeline with `Config::max_concurrent_transfers` transfer slots.
    ///
    /// When `cancel` is cancelled, transfers waiting for a slot give up, transfers in progress
    /// are abandoned, and every transfer fails with [`ColdVaultError::Aborted`].
    pub fn new(
        config: &Config,
        source: Box<dyn SourceStorage>,
        destination: Box<dyn DestinationStorage>,
        token: AuthToken,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            destination,
            token,
            slots: Arc::new(Semaphore::new(config.max_concurrent_transfers.max(1))),
            cancel,
            relay_depth: config.relay_depth,
            compression_level: config.compression_level.min(9),
            progress_interval: config.progress_interval,
        }
    }

    /// Copy `object` from `container` into `bucket`, compressed with gzip, under the same name.
    ///
    /// Waits for a free transfer slot before touching either store.  The slot is released when
    /// this returns, whatever the outcome.
    ///
    /// If reading the source fails, the upload is aborted and the read error is the outcome, even
    /// if the upload failed too.  If only the upload or its commit fails, that error is the
    /// outcome.  A failed transfer never leaves a visible object behind.
    #[instrument(skip(self))]
    pub async fn transfer_and_store(
        &self,
        container: &str,
        object: &str,
        bucket: &str,
    ) -> TransferOutcome {
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => {
                return crate::error::AbortedSnafu.fail();
            }
            permit = self.slots.clone().acquire_owned() => {
                permit.expect("BUG: transfer slots are never closed")
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {
                // Dropping the copy in progress drops its `PendingObject`, which aborts the upload
                debug!("Transfer abandoned");
                crate::error::AbortedSnafu.fail()
            }
            outcome = self.copy(container, object, bucket) => outcome,
        }
    }

    async fn copy(&self, container: &str, object: &str, bucket: &str) -> TransferOutcome {
        let (writer, pending) = self.destination.open_object_writer(bucket, object).await?;

        let stream = match self
            .source
            .fetch_object_stream(&self.token, container, object)
            .await
        {
            Ok(stream) => stream,
            Err(source_error) => {
                drop(writer);
                if let Some(upload_error) = pending.abort().await {
                    debug!(error = %upload_error, "Upload also failed; reporting the source error");
                }

                return Err(source_error);
            }
        };

        let (relay_writer, relay_reader) = relay(self.relay_depth);
        let bridge = SyncIoBridge::new(writer);
        let level = self.compression_level;
        let compress =
            tokio::task::spawn_blocking(move || compress(relay_reader, bridge, level));

        let (pump_result, compress_result) = tokio::join!(pump(stream, relay_writer), compress);

        let bytes_read = match pump_result {
            Ok(bytes_read) => bytes_read,
            Err(source_error) => {
                if let Some(upload_error) = pending.abort().await {
                    debug!(error = %upload_error, "Upload also failed; reporting the source error");
                }

                return Err(source_error);
            }
        };

        let compress_error = match compress_result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(crate::error::CompressSnafu { bucket, object }.into_error(e)),
            Err(e) => Some(crate::error::CompressTaskFailedSnafu { object }.into_error(e)),
        };

        if let Some(compress_error) = compress_error {
            // The compressor usually fails because the upload failed and closed its end of the
            // pipe, in which case the upload error is the one worth reporting
            return Err(pending.abort().await.unwrap_or(compress_error));
        }

        let bytes_written = pending.commit().await?;

        debug!(bytes_read, bytes_written, "Transferred object");

        Ok(TransferStats {
            bytes_read,
            bytes_written,
        })
    }

    /// Transfer every object of `container` into `bucket`.
    ///
    /// A task is spawned for every object up front; the transfer slots limit how many of them
    /// make progress at once.  Failed transfers are recorded in the returned
    /// [`ContainerTransfer`] and don't stop the others.  Returns only once every task has
    /// finished, or fails with [`ColdVaultError::Aborted`] if the pipeline was cancelled.
    #[instrument(skip(self, objects, progress), fields(objects = objects.len()))]
    pub async fn transfer_container(
        &self,
        container: &str,
        bucket: &str,
        objects: Vec<String>,
        progress: Arc<dyn BackupProgressCallback>,
    ) -> Result<ContainerTransfer> {
        let failures = Arc::new(TransferFailures::new());
        let counter = Arc::new(ProgressCounter::new(objects.len(), self.progress_interval));
        let bytes_read = Arc::new(AtomicU64::new(0));
        let bytes_written = Arc::new(AtomicU64::new(0));

        let mut tasks = JoinSet::new();

        for object in objects {
            let pipeline = self.clone();
            let container = container.to_string();
            let bucket = bucket.to_string();
            let failures = failures.clone();
            let counter = counter.clone();
            let bytes_read = bytes_read.clone();
            let bytes_written = bytes_written.clone();
            let progress = progress.clone();
            let span = tracing::debug_span!("transfer", %object);

            tasks.spawn(
                async move {
                    let outcome =
                        AssertUnwindSafe(pipeline.transfer_and_store(&container, &object, &bucket))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                crate::error::TransferPanickedSnafu { object: &object }.fail()
                            });

                    match outcome {
                        Err(ColdVaultError::Aborted) => {
                            // Neither a success nor a failure of this object
                            return;
                        }
                        Ok(stats) => {
                            bytes_read.fetch_add(stats.bytes_read, Ordering::SeqCst);
                            bytes_written.fetch_add(stats.bytes_written, Ordering::SeqCst);
                            progress.object_transferred(
                                &container,
                                &object,
                                stats.bytes_read,
                                stats.bytes_written,
                            );
                        }
                        Err(e) => {
                            warn!(error = %e.display_chain(), "Object transfer failed");
                            progress.object_failed(&container, &object, &e);
                            failures.append(object, e);
                        }
                    }

                    if let Some(completed) = counter.increment() {
                        info!(
                            %container,
                            completed,
                            total = counter.total(),
                            "Transfer progress"
                        );
                        progress.transfers_progressed(&container, completed, counter.total());
                    }
                }
                .instrument(span),
            );
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                // Transfer panics are caught inside the task, so this can only be a panic in the
                // bookkeeping or in a progress callback
                error!(?e, "Transfer task failed");
            }
        }

        if self.cancel.is_cancelled() {
            return crate::error::AbortedSnafu.fail();
        }

        let failures = Arc::try_unwrap(failures)
            .expect("BUG: all transfer tasks have completed so nothing else holds the failures");

        Ok(ContainerTransfer {
            failures,
            completed: counter.completed(),
            bytes_read: bytes_read.load(Ordering::SeqCst),
            bytes_written: bytes_written.load(Ordering::SeqCst),
        })
    }
}

/// Push every chunk of the source stream into the relay.
///
/// Returns the number of bytes read.  If the stream fails, the relay is terminated with an error
/// so the compressor can't mistake the truncated data for a complete object, and the stream's
/// error is returned.  If the compressor stops reading, so does the pump; the compressor reports
/// what went wrong.
async fn pump(mut stream: ObjectByteStream, relay_writer: RelayWriter) -> Result<u64> {
    let mut bytes_read = 0u64;

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                bytes_read += chunk.len() as u64;

                if !relay_writer.send(chunk).await {
                    debug!(bytes_read, "Compressor stopped reading; stopping the source read");
                    break;
                }
            }
            Err(e) => {
                relay_writer
                    .fail(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "reading the source object failed",
                    ))
                    .await;

                return Err(e);
            }
        }
    }

    Ok(bytes_read)
}

/// Gzip everything read from the relay into the destination writer, then close the writer.
///
/// This blocks, so it must run in a blocking worker thread.
fn compress(
    mut reader: RelayReader,
    writer: SyncIoBridge<DuplexStream>,
    level: u32,
) -> std::io::Result<()> {
    let mut encoder = GzEncoder::new(writer, Compression::new(level));

    std::io::copy(&mut reader, &mut encoder)?;

    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer.shutdown()?;

    Ok(())
}
