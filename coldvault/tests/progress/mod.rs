//! Test helper that implements [`coldvault::BackupProgressCallback`] which keeps a record of every
//! progress update in order so we can write tests that verify progress reporting behavior.
use coldvault::{BackupProgressCallback, ColdVaultError, ContainerReport, Provisioned, RunSummary};
use more_asserts::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, strum::EnumDiscriminants)]
#[allow(dead_code)] // Not all of these are used in tests but we want to capture all fields for all events
pub(crate) enum BackupProgressEvent {
    ContainersListed {
        containers: Vec<String>,
    },

    ContainerStarted {
        container: String,
        bucket: String,
    },

    BucketProvisioned {
        container: String,
        bucket: String,
        provisioned: Provisioned,
    },

    ObjectsListed {
        container: String,
        object_count: usize,
    },

    ObjectTransferred {
        container: String,
        object: String,
        bytes_read: u64,
        bytes_written: u64,
    },

    ObjectFailed {
        container: String,
        object: String,
        error: String,
    },

    TransfersProgressed {
        container: String,
        completed: usize,
        total: usize,
    },

    ContainerCompleted {
        report: ContainerReport,
        failure_report: String,
    },

    RunCompleted {
        summary: RunSummary,
    },
}

#[derive(Clone)]
pub(crate) struct TestBackupProgressCallback {
    events: Arc<Mutex<Vec<BackupProgressEvent>>>,
}

impl TestBackupProgressCallback {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Review all updates after a run has completed successfully, validating that the updates
    /// are all consistent with each other and with the run summary.
    ///
    /// If the run didn't finish successfully then this check should not be applied.
    pub fn sanity_check_updates(&self, summary: &RunSummary) {
        let run_completed = self.filter_events(BackupProgressEventDiscriminants::RunCompleted);
        assert_eq!(1, run_completed.len(), "Exactly one run completed event");
        assert_matches::assert_matches!(
            &run_completed[0],
            BackupProgressEvent::RunCompleted { summary: reported } if reported == summary
        );

        let reports = self.container_reports();
        assert_eq!(summary.containers, reports);

        // Every container that completed was started once, and its bucket provisioned once
        assert_eq!(
            self.count(BackupProgressEventDiscriminants::ContainerStarted),
            reports.len()
        );
        assert_eq!(
            self.count(BackupProgressEventDiscriminants::BucketProvisioned),
            reports.len()
        );

        let transferred = self.transferred_per_container();
        let failed = self.failed_per_container();

        for report in &reports {
            let (successes, bytes_read, bytes_written) = transferred
                .get(&report.container)
                .copied()
                .unwrap_or_default();
            let failures = failed.get(&report.container).copied().unwrap_or_default();

            assert_eq!(report.succeeded(), successes, "{}", report.container);
            assert_eq!(report.failed, failures, "{}", report.container);
            assert_eq!(report.bytes_read, bytes_read, "{}", report.container);
            assert_eq!(report.bytes_written, bytes_written, "{}", report.container);

            // Without an abort every listed object is accounted for one way or the other
            assert_eq!(report.objects, report.completed, "{}", report.container);
            assert_le!(report.failed, report.completed);
        }

        // Each progress milestone of a container is reported once, and never past the total.
        // Milestones come from concurrent tasks so they may arrive out of order.
        for report in &reports {
            let mut milestones = self.milestones(&report.container);
            let reported = milestones.len();
            milestones.sort_unstable();
            milestones.dedup();

            assert_eq!(reported, milestones.len(), "{}", report.container);
            if let Some(last) = milestones.last() {
                assert_le!(*last, report.objects);
            }
        }
    }

    /// The container reports, in the order the containers completed
    pub fn container_reports(&self) -> Vec<ContainerReport> {
        self.filter_events(BackupProgressEventDiscriminants::ContainerCompleted)
            .into_iter()
            .filter_map(|event| match event {
                BackupProgressEvent::ContainerCompleted { report, .. } => Some(report),
                _ => None,
            })
            .collect()
    }

    /// The failure report given with the completion of `container`
    pub fn failure_report(&self, container: &str) -> Option<String> {
        self.filter_events(BackupProgressEventDiscriminants::ContainerCompleted)
            .into_iter()
            .find_map(|event| match event {
                BackupProgressEvent::ContainerCompleted {
                    report,
                    failure_report,
                } if report.container == container => Some(failure_report),
                _ => None,
            })
    }

    /// How each bucket was provisioned, by container
    pub fn provisioned(&self) -> Vec<(String, Provisioned)> {
        self.filter_events(BackupProgressEventDiscriminants::BucketProvisioned)
            .into_iter()
            .filter_map(|event| match event {
                BackupProgressEvent::BucketProvisioned {
                    container,
                    provisioned,
                    ..
                } => Some((container, provisioned)),
                _ => None,
            })
            .collect()
    }

    /// The `completed` value of every progress milestone for `container`
    pub fn milestones(&self, container: &str) -> Vec<usize> {
        self.filter_events(BackupProgressEventDiscriminants::TransfersProgressed)
            .into_iter()
            .filter_map(|event| match event {
                BackupProgressEvent::TransfersProgressed {
                    container: c,
                    completed,
                    ..
                } if c == container => Some(completed),
                _ => None,
            })
            .collect()
    }

    /// The names of the objects reported as failed
    pub fn failed_objects(&self) -> Vec<String> {
        let mut objects = self
            .filter_events(BackupProgressEventDiscriminants::ObjectFailed)
            .into_iter()
            .filter_map(|event| match event {
                BackupProgressEvent::ObjectFailed { object, .. } => Some(object),
                _ => None,
            })
            .collect::<Vec<_>>();
        objects.sort();

        objects
    }

    pub fn count(&self, discriminant: BackupProgressEventDiscriminants) -> usize {
        self.filter_events(discriminant).len()
    }

    /// Number of successful transfers, bytes read and bytes written, by container
    fn transferred_per_container(&self) -> HashMap<String, (usize, u64, u64)> {
        let mut totals = HashMap::<String, (usize, u64, u64)>::new();

        for event in self.filter_events(BackupProgressEventDiscriminants::ObjectTransferred) {
            if let BackupProgressEvent::ObjectTransferred {
                container,
                bytes_read,
                bytes_written,
                ..
            } = event
            {
                let entry = totals.entry(container).or_default();
                entry.0 += 1;
                entry.1 += bytes_read;
                entry.2 += bytes_written;
            }
        }

        totals
    }

    fn failed_per_container(&self) -> HashMap<String, usize> {
        let mut totals = HashMap::<String, usize>::new();

        for event in self.filter_events(BackupProgressEventDiscriminants::ObjectFailed) {
            if let BackupProgressEvent::ObjectFailed { container, .. } = event {
                *totals.entry(container).or_default() += 1;
            }
        }

        totals
    }

    fn filter_events(
        &self,
        discriminant: BackupProgressEventDiscriminants,
    ) -> Vec<BackupProgressEvent> {
        let events = self.events.lock().unwrap();

        events
            .iter()
            .filter(|event| BackupProgressEventDiscriminants::from(*event) == discriminant)
            .cloned()
            .collect()
    }

    fn report_event(&self, event: BackupProgressEvent) {
        let mut events = self.events.lock().unwrap();

        events.push(event)
    }
}

impl BackupProgressCallback for TestBackupProgressCallback {
    fn containers_listed(&self, containers: &[String]) {
        self.report_event(BackupProgressEvent::ContainersListed {
            containers: containers.to_vec(),
        });
    }

    fn container_started(&self, container: &str, bucket: &str) {
        self.report_event(BackupProgressEvent::ContainerStarted {
            container: container.to_string(),
            bucket: bucket.to_string(),
        });
    }

    fn bucket_provisioned(&self, container: &str, bucket: &str, provisioned: Provisioned) {
        self.report_event(BackupProgressEvent::BucketProvisioned {
            container: container.to_string(),
            bucket: bucket.to_string(),
            provisioned,
        });
    }

    fn objects_listed(&self, container: &str, object_count: usize) {
        self.report_event(BackupProgressEvent::ObjectsListed {
            container: container.to_string(),
            object_count,
        });
    }

    fn object_transferred(
        &self,
        container: &str,
        object: &str,
        bytes_read: u64,
        bytes_written: u64,
    ) {
        self.report_event(BackupProgressEvent::ObjectTransferred {
            container: container.to_string(),
            object: object.to_string(),
            bytes_read,
            bytes_written,
        });
    }

    fn object_failed(&self, container: &str, object: &str, error: &ColdVaultError) {
        self.report_event(BackupProgressEvent::ObjectFailed {
            container: container.to_string(),
            object: object.to_string(),
            error: error.display_chain(),
        });
    }

    fn transfers_progressed(&self, container: &str, completed: usize, total: usize) {
        self.report_event(BackupProgressEvent::TransfersProgressed {
            container: container.to_string(),
            completed,
            total,
        });
    }

    fn container_completed(&self, report: &ContainerReport, failure_report: &str) {
        self.report_event(BackupProgressEvent::ContainerCompleted {
            report: report.clone(),
            failure_report: failure_report.to_string(),
        });
    }

    fn run_completed(&self, summary: &RunSummary) {
        self.report_event(BackupProgressEvent::RunCompleted {
            summary: summary.clone(),
        });
    }
}
