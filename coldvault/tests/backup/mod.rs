//! Whole backup runs against the in-memory stores, and against a mocked Swift account.
//!
//! These run anywhere; nothing here needs a real object store.
use crate::progress::{BackupProgressEventDiscriminants, TestBackupProgressCallback};
use crate::Result;
use assert_matches::assert_matches;
use bytes::Bytes;
use coldvault::objstore::memory::{MemoryDestination, MemorySource};
use coldvault::objstore::Swift;
use coldvault::{
    list_all_objects, BackupJobBuilder, BucketDescriptor, BucketPolicy, ColdVaultError, Config,
    DisabledNotifier, Notifier, Provisioned, SecretString, TraqWebhook,
};
use coldvault_testing::logging::test_with_logging;
use coldvault_testing::test_data::{
    make_test_data, validate_backed_up_objects, TestObject, TestObjectWithData,
};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Config with a date-free bucket name template, so bucket names don't depend on when the test
/// runs
fn test_config() -> Config {
    Config {
        max_concurrent_transfers: 3,
        progress_interval: 5,
        bucket_name_template: "{container}-archive".to_string(),
        ..Config::default()
    }
}

/// Generate random test objects and store them in `container`
fn populate(
    source: &MemorySource,
    container: &str,
    objects: impl IntoIterator<Item = TestObject>,
) -> HashMap<String, TestObjectWithData> {
    let test_data = make_test_data(objects);

    source.add_container(container);
    for object in test_data.values() {
        source.put_object(container, &object.name, object.data.clone());
    }

    test_data
}

fn stored_objects(destination: &MemoryDestination, bucket: &str) -> Vec<(String, Bytes)> {
    destination
        .object_keys(bucket)
        .into_iter()
        .map(|key| {
            let data = destination.object(bucket, &key).unwrap();
            (key, data)
        })
        .collect()
}

fn job_builder(
    config: Config,
    source: &MemorySource,
    destination: &MemoryDestination,
    notifier: Box<dyn Notifier>,
) -> BackupJobBuilder {
    BackupJobBuilder::with_storage(
        config,
        Box::new(source.clone()),
        Box::new(destination.clone()),
        notifier,
    )
}

#[test]
fn every_container_is_backed_up() -> Result<()> {
    test_with_logging(async move {
        let source = MemorySource::new().with_page_size(7).with_chunk_size(1000);
        let photos = populate(
            &source,
            "photos",
            (0..23).map(|i| TestObject::new(format!("2024/img{i:02}.png"), "10 KiB")),
        );
        let logs = populate(
            &source,
            "logs",
            [
                TestObject::new("app.log", "100 KiB"),
                TestObject::new("empty.log", "0"),
            ],
        );
        source.add_container("scratch");
        let destination = MemoryDestination::new();

        let job = job_builder(
            test_config(),
            &source,
            &destination,
            Box::new(DisabledNotifier),
        )
        .build()
        .await?;
        assert_eq!(vec!["logs", "photos", "scratch"], job.containers());

        let progress = TestBackupProgressCallback::new();
        let summary = job.run(futures::future::pending(), progress.clone()).await?;

        progress.sanity_check_updates(&summary);

        assert_eq!(3, summary.containers.len());
        assert_eq!(25, summary.total_objects());
        assert_eq!(0, summary.total_errors());
        assert_eq!(
            23 * 10 * 1024 + 100 * 1024,
            summary.total_bytes_read() as usize
        );

        validate_backed_up_objects(
            &photos,
            stored_objects(&destination, "photos-archive"),
            photos.keys().map(String::as_str),
        )?;
        validate_backed_up_objects(
            &logs,
            stored_objects(&destination, "logs-archive"),
            ["app.log", "empty.log"],
        )?;
        assert!(destination.object_keys("scratch-archive").is_empty());

        // Every bucket was created with the backup policy
        let policy = test_config().bucket_policy();
        for bucket in ["logs-archive", "photos-archive", "scratch-archive"] {
            assert_eq!(
                Some(BucketDescriptor::from_policy(bucket, &policy)),
                destination.bucket(bucket)
            );
        }
        assert_eq!(
            vec![
                ("logs".to_string(), Provisioned::Created),
                ("photos".to_string(), Provisioned::Created),
                ("scratch".to_string(), Provisioned::Created),
            ],
            progress.provisioned()
        );

        // 23 photos at a cadence of 5
        let mut milestones = progress.milestones("photos");
        milestones.sort_unstable();
        assert_eq!(vec![5, 10, 15, 20], milestones);

        Ok(())
    })
}

#[test]
fn second_run_reuses_existing_buckets() -> Result<()> {
    test_with_logging(async move {
        let source = MemorySource::new();
        populate(&source, "photos", [TestObject::new("a.png", "1 KiB")]);
        populate(&source, "logs", [TestObject::new("app.log", "1 KiB")]);
        let destination = MemoryDestination::new();

        for _ in 0..2 {
            job_builder(
                test_config(),
                &source,
                &destination,
                Box::new(DisabledNotifier),
            )
            .build()
            .await?
            .run_without_progress(futures::future::pending())
            .await?;
        }

        assert_eq!(2, destination.create_bucket_calls());

        let progress = TestBackupProgressCallback::new();
        let summary = job_builder(
            test_config(),
            &source,
            &destination,
            Box::new(DisabledNotifier),
        )
        .build()
        .await?
        .run(futures::future::pending(), progress.clone())
        .await?;

        progress.sanity_check_updates(&summary);
        assert_eq!(
            vec![
                ("logs".to_string(), Provisioned::Validated),
                ("photos".to_string(), Provisioned::Validated),
            ],
            progress.provisioned()
        );
        assert_eq!(2, destination.create_bucket_calls());

        Ok(())
    })
}

/// An existing bucket in the standard storage class stops the run before anything is read
#[test]
fn mismatched_bucket_aborts_before_any_transfer() -> Result<()> {
    test_with_logging(async move {
        let source = MemorySource::new();
        populate(&source, "archive-2024", [TestObject::new("old.tar", "1 KiB")]);
        populate(&source, "photos", [TestObject::new("a.png", "1 KiB")]);

        let destination = MemoryDestination::new();
        destination.insert_bucket(BucketDescriptor::from_policy(
            "archive-2024",
            &BucketPolicy {
                storage_class: "STANDARD".to_string(),
                ..test_config().bucket_policy()
            },
        ));

        let config = Config {
            bucket_name_template: "{container}".to_string(),
            ..test_config()
        };

        let progress = TestBackupProgressCallback::new();
        let result = job_builder(config, &source, &destination, Box::new(DisabledNotifier))
            .build()
            .await?
            .run(futures::future::pending(), progress.clone())
            .await;

        assert_matches!(
            result,
            Err(ColdVaultError::ConfigMismatch { ref bucket, setting, .. })
                if bucket == "archive-2024" && setting == "storage class"
        );

        // Nothing was read, created or written
        assert_eq!(0, source.fetches());
        assert_eq!(0, destination.create_bucket_calls());
        assert_eq!(vec!["archive-2024"], destination.bucket_names());
        assert!(destination.object_keys("archive-2024").is_empty());
        assert_eq!(
            0,
            progress.count(BackupProgressEventDiscriminants::ContainerStarted)
        );
        assert_eq!(
            0,
            progress.count(BackupProgressEventDiscriminants::RunCompleted)
        );

        Ok(())
    })
}

#[test]
fn containers_sharing_a_bucket_name_abort_the_run() -> Result<()> {
    test_with_logging(async move {
        let source = MemorySource::new();
        populate(&source, "Photos", [TestObject::new("a.png", "1 KiB")]);
        populate(&source, "photos", [TestObject::new("a.png", "1 KiB")]);

        let destination = MemoryDestination::new();
        let config = Config {
            bucket_name_template: "{container}-bk".to_string(),
            ..test_config()
        };

        let progress = TestBackupProgressCallback::new();
        let result = job_builder(config, &source, &destination, Box::new(DisabledNotifier))
            .build()
            .await?
            .run(futures::future::pending(), progress.clone())
            .await;

        assert_matches!(
            result,
            Err(ColdVaultError::BucketNameCollision { ref bucket, ref first, ref second })
                if bucket == "photos-bk" && first == "Photos" && second == "photos"
        );

        // Detected before any bucket was provisioned or any object read
        assert_eq!(0, source.fetches());
        assert_eq!(0, destination.create_bucket_calls());
        assert!(destination.bucket_names().is_empty());
        assert_eq!(
            0,
            progress.count(BackupProgressEventDiscriminants::BucketProvisioned)
        );

        Ok(())
    })
}

#[test]
fn failed_objects_are_reported_and_the_run_succeeds() -> Result<()> {
    test_with_logging(async move {
        let source = MemorySource::new().with_chunk_size(512);
        let photos = populate(
            &source,
            "photos",
            [
                TestObject::new("a.png", "4 KiB"),
                TestObject::new("b.png", "4 KiB"),
                TestObject::new("c.png", "4 KiB"),
                TestObject::new("d.png", "4 KiB"),
            ],
        );
        source.fail_fetch("photos", "a.png");
        source.interrupt_read("photos", "c.png");
        let destination = MemoryDestination::new();

        let progress = TestBackupProgressCallback::new();
        let summary = job_builder(
            test_config(),
            &source,
            &destination,
            Box::new(DisabledNotifier),
        )
        .build()
        .await?
        .run(futures::future::pending(), progress.clone())
        .await?;

        progress.sanity_check_updates(&summary);

        assert_eq!(4, summary.total_objects());
        assert_eq!(2, summary.total_errors());
        assert_eq!(2, summary.containers[0].succeeded());
        assert_eq!(vec!["a.png", "c.png"], progress.failed_objects());

        // One line per failed object, naming the object and the cause
        let failure_report = progress.failure_report("photos").unwrap();
        let mut lines = failure_report.lines().collect::<Vec<_>>();
        lines.sort_unstable();
        assert_eq!(2, lines.len());
        assert!(lines[0].starts_with("a.png: "), "{}", lines[0]);
        assert!(lines[0].contains("500"), "{}", lines[0]);
        assert!(lines[1].starts_with("c.png: "), "{}", lines[1]);

        // Failed objects left nothing behind
        validate_backed_up_objects(
            &photos,
            stored_objects(&destination, "photos-archive"),
            ["b.png", "d.png"],
        )?;

        Ok(())
    })
}

/// 25000 objects served 10000 per page take exactly three listing requests
#[test]
fn large_container_is_listed_in_pages() -> Result<()> {
    test_with_logging(async move {
        let source = MemorySource::new().with_page_size(10_000);
        for i in 0..25_000 {
            source.put_object("photos", format!("img{i:05}.png"), Bytes::new());
        }

        let token = coldvault::objstore::SourceStorage::authenticate(&source).await?;
        let listing = list_all_objects(&source, &token, "photos", 3).await?;

        assert_eq!(25_000, listing.names.len());
        assert_eq!(25_000, listing.declared_total);
        assert_eq!(3, listing.requests);
        assert_eq!(
            vec![
                None,
                Some("img09999.png".to_string()),
                Some("img19999.png".to_string()),
            ],
            source.listing_markers("photos")
        );

        let mut unique = listing.names.clone();
        unique.dedup();
        assert_eq!(listing.names, unique);

        Ok(())
    })
}

#[test]
fn abort_stops_the_run_without_committing() -> Result<()> {
    test_with_logging(async move {
        // Each object takes at least 16 * 50ms to read
        let source = MemorySource::new()
            .with_chunk_size(1024)
            .with_chunk_delay(Duration::from_millis(50));
        populate(
            &source,
            "photos",
            (0..6).map(|i| TestObject::new(format!("{i}.png"), "16 KiB")),
        );
        let destination = MemoryDestination::new();

        let progress = TestBackupProgressCallback::new();
        let result = job_builder(
            test_config(),
            &source,
            &destination,
            Box::new(DisabledNotifier),
        )
        .build()
        .await?
        .run(tokio::time::sleep(Duration::from_millis(200)), progress.clone())
        .await;

        assert_matches!(result, Err(ColdVaultError::Aborted));

        assert!(destination.object_keys("photos-archive").is_empty());
        assert_eq!(
            0,
            progress.count(BackupProgressEventDiscriminants::ObjectTransferred)
        );
        assert_eq!(
            0,
            progress.count(BackupProgressEventDiscriminants::ObjectFailed)
        );
        assert_eq!(
            0,
            progress.count(BackupProgressEventDiscriminants::ContainerCompleted)
        );

        Ok(())
    })
}

#[test]
fn summary_is_posted_to_the_webhook() -> Result<()> {
    test_with_logging(async move {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/webhooks/hook-id"))
            .and(header("content-type", "text/plain; charset=utf-8"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let source = MemorySource::new();
        populate(&source, "photos", [TestObject::new("a.png", "1 KiB")]);
        let destination = MemoryDestination::new();
        let webhook = TraqWebhook::new(
            &Url::parse(&server.uri())?,
            "hook-id",
            SecretString::new("secret"),
        )?;

        let summary = job_builder(test_config(), &source, &destination, Box::new(webhook))
            .build()
            .await?
            .run_without_progress(futures::future::pending())
            .await?;

        let requests = server.received_requests().await.unwrap();
        assert_eq!(1, requests.len());

        let body = String::from_utf8(requests[0].body.clone())?;
        assert_eq!(summary.format_message(), body);
        assert!(body.contains("1 containers, 1 objects, 0 errors"), "{body}");
        assert!(body.contains("- photos -> photos-archive: 1/1 objects, 0 errors"), "{body}");

        Ok(())
    })
}

#[test]
fn webhook_failure_does_not_fail_the_run() -> Result<()> {
    test_with_logging(async move {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let source = MemorySource::new();
        populate(&source, "photos", [TestObject::new("a.png", "1 KiB")]);
        let destination = MemoryDestination::new();
        let webhook = TraqWebhook::new(
            &Url::parse(&server.uri())?,
            "hook-id",
            SecretString::new("secret"),
        )?;

        let summary = job_builder(test_config(), &source, &destination, Box::new(webhook))
            .build()
            .await?
            .run_without_progress(futures::future::pending())
            .await?;

        assert_eq!(1, summary.total_objects());
        assert_eq!(vec!["a.png"], destination.object_keys("photos-archive"));

        Ok(())
    })
}

/// A run against a mocked Swift account, authenticating with a pre-issued token
#[test]
fn swift_account_is_backed_up() -> Result<()> {
    test_with_logging(async move {
        let server = MockServer::start().await;
        let test_data = make_test_data([
            TestObject::new("a.png", "20 KiB"),
            TestObject::new("dir/b.png", "1 KiB"),
        ]);

        Mock::given(method("GET"))
            .and(path("/v1/AUTH_test"))
            .and(header("X-Auth-Token", "pre-issued"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Account-Container-Count", "1")
                    .set_body_string("photos\n"),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/AUTH_test/photos"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Container-Object-Count", "2")
                    .set_body_string("a.png\ndir/b.png\n"),
            )
            .expect(1)
            .mount(&server)
            .await;
        for object in test_data.values() {
            Mock::given(method("GET"))
                .and(path(format!("/v1/AUTH_test/photos/{}", object.name)))
                .and(header("X-Auth-Token", "pre-issued"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(object.data.to_vec()))
                .expect(1)
                .mount(&server)
                .await;
        }
        // A marker on the object listing would mean the listing wasn't complete after one page
        Mock::given(method("GET"))
            .and(query_param("marker", "dir/b.png"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let config = Config {
            swift_account_url: Some(format!("{}/v1/AUTH_test", server.uri()).parse()?),
            swift_auth_token: Some(SecretString::new("pre-issued")),
            ..test_config()
        };
        let destination = MemoryDestination::new();

        let summary = BackupJobBuilder::with_storage(
            config.clone(),
            Box::new(Swift::new(&config)?),
            Box::new(destination.clone()),
            Box::new(DisabledNotifier),
        )
        .build()
        .await?
        .run_without_progress(futures::future::pending())
        .await?;

        assert_eq!(2, summary.total_objects());
        assert_eq!(0, summary.total_errors());
        validate_backed_up_objects(
            &test_data,
            stored_objects(&destination, "photos-archive"),
            ["a.png", "dir/b.png"],
        )?;

        Ok(())
    })
}
