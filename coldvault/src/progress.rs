//! Progress reporting for backup runs.
//!
//! The library never prints anything itself.  Callers implement [`BackupProgressCallback`] to be
//! told about each stage of a run, and receive a [`RunSummary`] at the end.
use crate::provision::Provisioned;
use crate::ColdVaultError;
use chrono::{DateTime, Utc};
use std::fmt::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A trait which callers can implement to get detailed progress updates as a backup run is
/// progressing.
///
/// Every method has a no-op default.  Methods are called from multiple transfer tasks at once.
#[allow(unused_variables)]
pub trait BackupProgressCallback: Sync + Send {
    /// All containers in the source account have been listed, and these are the ones which will
    /// be backed up, in order
    fn containers_listed(&self, containers: &[String]) {}

    /// Backup of a container is starting
    fn container_started(&self, container: &str, bucket: &str) {}

    /// The destination bucket for a container was created or validated
    fn bucket_provisioned(&self, container: &str, bucket: &str, provisioned: Provisioned) {}

    /// Every object in a container has been listed
    fn objects_listed(&self, container: &str, object_count: usize) {}

    /// One object was read from the source, compressed, and committed at the destination
    fn object_transferred(
        &self,
        container: &str,
        object: &str,
        bytes_read: u64,
        bytes_written: u64,
    ) {
    }

    /// One object could not be transferred.  The failure has been recorded and the run goes on.
    fn object_failed(&self, container: &str, object: &str, error: &ColdVaultError) {}

    /// Another `Config::progress_interval` objects of a container have been completed, either
    /// successfully or not
    fn transfers_progressed(&self, container: &str, completed: usize, total: usize) {}

    /// Every transfer of a container has completed.  `failure_report` has one line per failed
    /// object and is empty if all objects were transferred
    fn container_completed(&self, report: &ContainerReport, failure_report: &str) {}

    /// All containers have been processed
    fn run_completed(&self, summary: &RunSummary) {}
}

/// Progress callback which ignores every update
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl BackupProgressCallback for NoProgress {}

/// Atomic count of the completed transfers of one container.
///
/// Every completion counts, successful or not.  Every `interval`-th completion is a milestone at
/// which progress is reported.
#[derive(Debug)]
pub struct ProgressCounter {
    completed: AtomicUsize,
    total: usize,
    interval: usize,
}

impl ProgressCounter {
    pub fn new(total: usize, interval: usize) -> Self {
        Self {
            completed: AtomicUsize::new(0),
            total,
            interval: interval.max(1),
        }
    }

    /// Count one more completed transfer.
    ///
    /// Returns the new completion count if it is a multiple of the reporting interval.
    pub fn increment(&self) -> Option<usize> {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;

        (completed % self.interval == 0).then_some(completed)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

/// Outcome of the backup of one container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerReport {
    pub container: String,
    pub bucket: String,

    /// How many objects were listed in the container
    pub objects: usize,

    /// How many transfers ran to completion, successful or not
    pub completed: usize,

    pub failed: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl ContainerReport {
    pub fn succeeded(&self) -> usize {
        self.completed.saturating_sub(self.failed)
    }
}

/// Totals of a whole backup run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub containers: Vec<ContainerReport>,
}

impl RunSummary {
    pub fn total_objects(&self) -> usize {
        self.containers.iter().map(|report| report.completed).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.containers.iter().map(|report| report.failed).sum()
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.containers.iter().map(|report| report.bytes_read).sum()
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.containers.iter().map(|report| report.bytes_written).sum()
    }

    /// Render the summary as the text of the end-of-run notification
    pub fn format_message(&self) -> String {
        let mut message = String::new();

        // Writing to a String can't fail
        let _ = writeln!(message, "### coldvault backup completed");
        let _ = writeln!(
            message,
            "started at {}, took {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            format_elapsed(self.elapsed)
        );
        let _ = writeln!(
            message,
            "{} containers, {} objects, {} errors, {} read, {} written",
            self.containers.len(),
            self.total_objects(),
            self.total_errors(),
            format_bytes(self.total_bytes_read()),
            format_bytes(self.total_bytes_written())
        );

        for report in &self.containers {
            let _ = writeln!(
                message,
                "- {} -> {}: {}/{} objects, {} errors",
                report.container,
                report.bucket,
                report.succeeded(),
                report.objects,
                report.failed
            );
        }

        message
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();

    format!(
        "{}h{:02}m{:02}s",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

fn format_bytes(bytes: u64) -> String {
    byte_unit::Byte::from_bytes(bytes as u128)
        .get_appropriate_unit(true)
        .to_string()
}
