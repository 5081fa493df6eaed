//! The backup run: every container of the source account is copied into its own cold-storage
//! bucket at the destination.
use crate::lister::{list_all_containers, list_all_objects};
use crate::notify::{Notifier, TraqWebhook};
use crate::objstore::{AuthToken, DestinationStorage, ObjectStorageFactory, SourceStorage};
use crate::pipeline::TransferPipeline;
use crate::progress::{BackupProgressCallback, ContainerReport, NoProgress, RunSummary};
use crate::provision::{bucket_names_for, ensure_bucket};
use crate::{Config, Result};
use chrono::Utc;
use snafu::prelude::*;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Prepares a [`BackupJob`].
#[derive(Debug)]
pub struct BackupJobBuilder {
    config: Config,
    source: Box<dyn SourceStorage>,
    destination: Box<dyn DestinationStorage>,
    notifier: Box<dyn Notifier>,
}

impl BackupJobBuilder {
    /// Initialize a new backup job builder for the Swift account, S3 endpoint and webhook named in
    /// the config, but don't yet contact any of them.
    pub async fn new(config: Config) -> Result<Self> {
        let factory = ObjectStorageFactory::new(config.clone());
        let source = factory.source()?;
        let destination = factory.destination().await;
        let notifier = TraqWebhook::from_config(&config)?;

        Ok(Self::with_storage(config, source, destination, notifier))
    }

    /// Initialize a new backup job builder which uses the given stores and notifier instead of the
    /// ones named in the config
    pub fn with_storage(
        config: Config,
        source: Box<dyn SourceStorage>,
        destination: Box<dyn DestinationStorage>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            source,
            destination,
            notifier,
        }
    }

    /// Construct the backup job (but don't run it yet).
    ///
    /// This authenticates against the source and lists every container in the account.  If the
    /// config names specific containers, only those are backed up, and naming a container which
    /// doesn't exist is an error.  Without the complete list of containers there is no backup at
    /// all.
    pub async fn build(self) -> Result<BackupJob> {
        let token = self.source.authenticate().await?;

        let listing =
            list_all_containers(&*self.source, &token, self.config.max_stalled_pages).await?;

        debug!(
            containers = listing.names.len(),
            "Listed containers in the source account"
        );

        let containers = if self.config.containers.is_empty() {
            listing.names
        } else {
            for container in &self.config.containers {
                ensure!(
                    listing.names.contains(container),
                    crate::error::UnknownContainerSnafu { container }
                );
            }

            listing
                .names
                .into_iter()
                .filter(|name| self.config.containers.contains(name))
                .collect()
        };

        info!(containers = ?containers, "Containers selected for backup");

        Ok(BackupJob {
            config: self.config,
            source: self.source,
            destination: self.destination,
            notifier: self.notifier,
            token,
            containers,
        })
    }
}

/// A job which will back up the selected containers.
#[derive(Debug)]
pub struct BackupJob {
    config: Config,
    source: Box<dyn SourceStorage>,
    destination: Box<dyn DestinationStorage>,
    notifier: Box<dyn Notifier>,
    token: AuthToken,
    containers: Vec<String>,
}

impl BackupJob {
    /// The containers which will be backed up, in order
    pub fn containers(&self) -> &[String] {
        &self.containers
    }

    /// Alternative to [`Self::run`] which doesn't require a [`BackupProgressCallback`]
    /// implementation, for callers that do not care about progress information.
    pub async fn run_without_progress(
        self,
        abort: impl Future<Output = ()>,
    ) -> Result<RunSummary> {
        self.run(abort, NoProgress).await
    }

    /// Run the job, returning only when every container has been backed up (or the run failed).
    ///
    /// All destination buckets are provisioned before any object is transferred, so a bucket whose
    /// configuration conflicts with the backup policy stops the run before any data moves.
    /// Two containers whose names map to the same bucket stop the run before any bucket is touched.
    /// Containers are then backed up one after the other.  Objects which can't be transferred are
    /// reported, but don't fail the run.
    ///
    /// If the `abort` future is completed, it's a signal that the job should be aborted.
    /// Transfers in progress are abandoned without committing anything and queued transfers are
    /// dropped, then this method returns an abort error.
    pub async fn run<Abort, Progress>(self, abort: Abort, progress: Progress) -> Result<RunSummary>
    where
        Abort: Future<Output = ()>,
        Progress: BackupProgressCallback + 'static,
    {
        let started_at = Utc::now();
        let start = Instant::now();
        let cancel = CancellationToken::new();
        let progress: Arc<dyn BackupProgressCallback> = Arc::new(progress);

        progress.containers_listed(&self.containers);

        let work = self.back_up_all(started_at.date_naive(), cancel.clone(), progress.clone());
        tokio::pin!(work);

        let reports = tokio::select! {
            result = &mut work => result?,
            _ = abort => {
                info!("Abort requested; cancelling transfers");
                cancel.cancel();

                // Let the abandoned transfers wind down so that nothing is left running
                if let Err(e) = work.await {
                    debug!(error = %e, "Backup stopped after abort");
                }

                return crate::error::AbortedSnafu.fail();
            }
        };

        let summary = RunSummary {
            started_at,
            elapsed: start.elapsed(),
            containers: reports,
        };

        info!(
            containers = summary.containers.len(),
            objects = summary.total_objects(),
            errors = summary.total_errors(),
            elapsed = ?summary.elapsed,
            "Backup completed"
        );

        progress.run_completed(&summary);

        if let Err(e) = self.notifier.post_message(&summary.format_message()).await {
            warn!(error = %e.display_chain(), "Failed to post the run summary");
        }

        Ok(summary)
    }

    async fn back_up_all(
        &self,
        run_date: chrono::NaiveDate,
        cancel: CancellationToken,
        progress: Arc<dyn BackupProgressCallback>,
    ) -> Result<Vec<ContainerReport>> {
        let policy = self.config.bucket_policy();

        let buckets = bucket_names_for(
            &self.config.bucket_name_template,
            self.containers.iter().map(String::as_str),
            run_date,
        )?;

        for (container, bucket) in self.containers.iter().zip(&buckets) {
            ensure!(!cancel.is_cancelled(), crate::error::AbortedSnafu);

            let (_, provisioned) = ensure_bucket(&*self.destination, bucket, &policy).await?;

            progress.bucket_provisioned(container, bucket, provisioned);
        }

        let pipeline = TransferPipeline::new(
            &self.config,
            self.source.clone(),
            self.destination.clone(),
            self.token.clone(),
            cancel.clone(),
        );

        let mut reports = Vec::with_capacity(self.containers.len());
        for (container, bucket) in self.containers.iter().zip(buckets) {
            ensure!(!cancel.is_cancelled(), crate::error::AbortedSnafu);

            let report = self
                .back_up_container(&pipeline, container, bucket, progress.clone())
                .await?;
            reports.push(report);
        }

        Ok(reports)
    }

    #[instrument(skip(self, pipeline, progress))]
    async fn back_up_container(
        &self,
        pipeline: &TransferPipeline,
        container: &str,
        bucket: String,
        progress: Arc<dyn BackupProgressCallback>,
    ) -> Result<ContainerReport> {
        progress.container_started(container, &bucket);

        let listing = list_all_objects(
            &*self.source,
            &self.token,
            container,
            self.config.max_stalled_pages,
        )
        .await?;
        let objects = listing.names.len();

        info!(objects, "Transferring objects");
        progress.objects_listed(container, objects);

        let transfer = pipeline
            .transfer_container(container, &bucket, listing.names, progress.clone())
            .await?;

        let report = ContainerReport {
            container: container.to_string(),
            bucket,
            objects,
            completed: transfer.completed,
            failed: transfer.failures.count(),
            bytes_read: transfer.bytes_read,
            bytes_written: transfer.bytes_written,
        };
        let failure_report = transfer.failures.report();

        if report.failed > 0 {
            warn!(
                failed = report.failed,
                "Failed to back up some objects:\n{failure_report}"
            );
        } else {
            info!(
                bytes_read = report.bytes_read,
                bytes_written = report.bytes_written,
                "Backed up every object"
            );
        }

        progress.container_completed(&report, &failure_report);

        Ok(report)
    }
}
