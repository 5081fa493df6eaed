//! Implementations of progress callbacks that render progress bars
use coldvault::{ContainerReport, Provisioned, Result, RunSummary};
use std::{
    borrow::Cow,
    future::Future,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    sync::Arc,
    time::Duration,
};

/// Display a spinner while some long-running but unmeasurable task is running, then hide the
/// spinner when it finishes
pub(crate) async fn with_spinner<S, F, T>(globals: &super::Globals, message: S, task: F) -> T
where
    S: Into<Cow<'static, str>>,
    F: Future<Output = T>,
{
    let spinner = if !hide_progress(globals) {
        indicatif::ProgressBar::new_spinner()
    } else {
        indicatif::ProgressBar::hidden()
    };

    spinner.set_style(
        indicatif::ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );

    spinner.enable_steady_tick(Duration::from_millis(120));

    spinner.set_message(message);

    let result = task.await;

    spinner.finish_and_clear();

    result
}

/// Run the backup job with progress bars, until it completes or the abort future completes
pub(crate) async fn run_backup_job(
    globals: &super::Globals,
    job: coldvault::BackupJob,
    abort: impl Future<Output = ()>,
) -> Result<RunSummary> {
    let progress = BackupProgressReport::new(hide_progress(globals));

    job.run(abort, progress).await
}

/// Progress should be hidden for either of verbose mode (because there will be a flurry of log
/// messages and the progress bar rendering will be all messed up), or quiet mode (because
/// progress bars are not quiet).
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

/// Progress reporting for a backup run, which receives progress updates from the lib crate and
/// renders progress bars accordingly
#[derive(Clone)]
struct BackupProgressReport {
    /// Aggregate which groups all of the below progress bars together
    multi: indicatif::MultiProgress,

    /// Containers completed out of all containers selected for backup
    containers: indicatif::ProgressBar,

    /// Objects completed, successfully or not, out of all objects in the current container
    objects: indicatif::ProgressBar,

    /// Failures in the current container
    failed: Arc<AtomicUsize>,

    /// Bytes read from the source, and written to the destination, in the current container
    bytes_read: Arc<AtomicU64>,
    bytes_written: Arc<AtomicU64>,
}

impl BackupProgressReport {
    fn new(hide_progress: bool) -> Self {
        /// The template syntax for right alignment doesn't pad the prefix string to the left with
        /// spaces, so we have to do that ourselves
        fn pad_prefix(prefix: &'static str) -> String {
            format!("{prefix:>12}")
        }

        let multi = if !hide_progress {
            indicatif::MultiProgress::new()
        } else {
            indicatif::MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden())
        };

        let containers = multi.add(indicatif::ProgressBar::new(0));
        containers.set_style(
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {prefix}: {msg:<40!} [{bar:20.cyan/blue}] {pos}/{len} ({elapsed})",
            )
            .unwrap()
            .progress_chars("#>-"),
        );
        containers.set_prefix(pad_prefix("Containers"));

        let objects = multi.add(indicatif::ProgressBar::new(0));
        objects.set_style(
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {prefix}: {msg:<40!} [{bar:20.cyan/blue}] {pos}/{len} ({per_sec}, ETA {eta})",
            )
            .unwrap()
            .progress_chars("#>-"),
        );
        objects.set_prefix(pad_prefix("Objects"));

        Self {
            multi,
            containers,
            objects,
            failed: Arc::new(AtomicUsize::new(0)),
            bytes_read: Arc::new(AtomicU64::new(0)),
            bytes_written: Arc::new(AtomicU64::new(0)),
        }
    }

    fn update_object_message(&self) {
        let failed = self.failed.load(Ordering::Relaxed);
        let bytes_read = format_bytes(self.bytes_read.load(Ordering::Relaxed));
        let bytes_written = format_bytes(self.bytes_written.load(Ordering::Relaxed));

        self.objects
            .set_message(format!("{bytes_read} -> {bytes_written}, {failed} failed"));
    }

    fn println(&self, message: impl AsRef<str>) {
        // Only fails if the terminal is gone, in which case there's no one to tell
        let _ = self.multi.println(message);
    }
}

#[allow(unused_variables)] // so we can keep the unused progress methods with their comments
impl coldvault::BackupProgressCallback for BackupProgressReport {
    fn containers_listed(&self, containers: &[String]) {
        self.containers.set_length(containers.len() as u64);
        self.containers.set_message("Provisioning buckets...");
    }

    fn bucket_provisioned(&self, container: &str, bucket: &str, provisioned: Provisioned) {
        if provisioned == Provisioned::Created {
            self.println(format!("Created bucket {bucket} for container {container}"));
        }
    }

    fn container_started(&self, container: &str, bucket: &str) {
        self.containers.set_message(format!("{container} -> {bucket}"));

        self.failed.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);

        self.objects.reset();
        self.objects.set_length(0);
        self.objects.set_message("Listing objects...");
    }

    fn objects_listed(&self, container: &str, object_count: usize) {
        self.objects.set_length(object_count as u64);
        self.update_object_message();
    }

    fn object_transferred(
        &self,
        container: &str,
        object: &str,
        bytes_read: u64,
        bytes_written: u64,
    ) {
        self.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes_written, Ordering::Relaxed);
        self.objects.inc(1);
        self.update_object_message();
    }

    fn object_failed(&self, container: &str, object: &str, error: &coldvault::ColdVaultError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.objects.inc(1);
        self.update_object_message();
    }

    fn transfers_progressed(&self, container: &str, completed: usize, total: usize) {
        // The progress bar already shows this, but hidden progress bars don't
        if self.objects.is_hidden() {
            tracing::info!(container, completed, total, "Transfer progress");
        }
    }

    fn container_completed(&self, report: &ContainerReport, failure_report: &str) {
        self.containers.inc(1);

        let mut message = format!(
            "{} -> {}: {}/{} objects backed up ({} read, {} written)",
            report.container,
            report.bucket,
            report.succeeded(),
            report.objects,
            format_bytes(report.bytes_read),
            format_bytes(report.bytes_written)
        );
        if report.failed > 0 {
            message.push_str(&format!(
                ", {} failed:\n{}",
                report.failed,
                failure_report.trim_end()
            ));
        }
        self.println(message);
    }

    fn run_completed(&self, summary: &RunSummary) {
        self.objects.finish_and_clear();
        self.containers.finish_with_message(format!(
            "Done ({} objects, {} errors)",
            summary.total_objects(),
            summary.total_errors()
        ));
    }
}

fn format_bytes(bytes: u64) -> String {
    byte_unit::Byte::from_bytes(bytes as u128)
        .get_appropriate_unit(true)
        .to_string()
}
