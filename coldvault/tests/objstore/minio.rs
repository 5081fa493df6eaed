//! Tests of the S3 destination against a local Minio S3-compatible object storage server.
//!
//! Minio has no cold storage classes of its own, so these use `REDUCED_REDUNDANCY` for uploads
//! and create their buckets directly rather than through the retention policy.
use crate::Result;
use assert_matches::assert_matches;
use coldvault::objstore::memory::MemorySource;
use coldvault::objstore::{DestinationStorage, SourceStorage, S3};
use coldvault::{ensure_bucket, BucketPolicy, ColdVaultError, Config, TransferPipeline};
use coldvault_testing::{minio::MinioServer, test_data};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn config_for_minio(server: &MinioServer) -> Config {
    Config {
        s3_endpoint: Some(server.endpoint_url()),
        region: "us-east-1".to_string(),
        storage_class: "REDUCED_REDUNDANCY".to_string(),
        multipart_chunk_size: byte_unit::Byte::from_bytes(5 * 1024 * 1024),
        ..Config::default()
    }
}

async fn s3_for_minio(server: &MinioServer) -> Result<S3> {
    Ok(S3::with_client(
        config_for_minio(server),
        server.aws_client().await?,
    ))
}

/// Create a versioned bucket the way an earlier run would have, minus the retention rule
async fn make_versioned_bucket(server: &MinioServer, name: &str) -> Result<String> {
    let bucket = MinioServer::unique_container_name(name);
    let client = server.aws_client().await?;

    client.create_bucket().bucket(&bucket).send().await?;
    server.wait_for_bucket(&bucket).await?;
    client
        .put_bucket_versioning()
        .bucket(&bucket)
        .versioning_configuration(
            aws_sdk_s3::types::VersioningConfiguration::builder()
                .status(aws_sdk_s3::types::BucketVersioningStatus::Enabled)
                .build(),
        )
        .send()
        .await?;

    Ok(bucket)
}

async fn make_pipeline(server: &MinioServer, source: &MemorySource) -> Result<TransferPipeline> {
    let token = source.authenticate().await?;

    Ok(TransferPipeline::new(
        &config_for_minio(server),
        Box::new(source.clone()),
        Box::new(s3_for_minio(server).await?),
        token,
        CancellationToken::new(),
    ))
}

async fn server() -> Result<Arc<MinioServer>> {
    MinioServer::get().await
}

#[test]
#[ignore = "requires minio"]
fn missing_bucket_is_not_found() -> Result<()> {
    coldvault_testing::logging::test_with_logging(async move {
        let server = server().await?;
        let s3 = s3_for_minio(&server).await?;

        let bucket = MinioServer::unique_container_name("missing");
        assert_eq!(None, s3.get_bucket(&bucket).await?);

        Ok(())
    })
}

#[test]
#[ignore = "requires minio"]
fn bucket_without_retention_rule_is_a_mismatch() -> Result<()> {
    coldvault_testing::logging::test_with_logging(async move {
        let server = server().await?;
        let s3 = s3_for_minio(&server).await?;
        let bucket = make_versioned_bucket(&server, "archive-2024").await?;

        let descriptor = s3.get_bucket(&bucket).await?.unwrap();
        assert_eq!("STANDARD", descriptor.storage_class);
        assert!(descriptor.versioning_enabled);
        assert_eq!("us-east-1", descriptor.region);
        assert_eq!(None, descriptor.retention_days);

        let policy = BucketPolicy {
            storage_class: "GLACIER".to_string(),
            region: "us-east-1".to_string(),
            versioning_enabled: true,
            retention_days: 90,
        };
        assert_matches!(
            ensure_bucket(&s3, &bucket, &policy).await,
            Err(ColdVaultError::ConfigMismatch { setting: "storage class", .. })
        );

        Ok(())
    })
}

#[test]
#[ignore = "requires minio"]
fn objects_are_uploaded_compressed() -> Result<()> {
    coldvault_testing::logging::test_with_logging(async move {
        let server = server().await?;
        let bucket = make_versioned_bucket(&server, "photos").await?;

        // The large object is half random data, so even compressed it takes more than one part
        let test_data = test_data::make_test_data([
            test_data::TestObject::new("small.png", "10 KiB"),
            test_data::TestObject::new("2024/large.mov", "16 MiB"),
            test_data::TestObject::new("empty", "0"),
        ]);
        let source = MemorySource::new();
        for object in test_data.values() {
            source.put_object("photos", &object.name, object.data.clone());
        }

        let pipeline = make_pipeline(&server, &source).await?;
        for object in test_data.keys() {
            let stats = pipeline
                .transfer_and_store("photos", object, &bucket)
                .await?;
            assert_eq!(test_data[object].data.len() as u64, stats.bytes_read);
        }

        let stored = test_data::read_bucket_objects(&server.aws_client().await?, &bucket).await?;
        test_data::validate_backed_up_objects(
            &test_data,
            stored,
            test_data.keys().map(String::as_str),
        )?;

        Ok(())
    })
}

#[test]
#[ignore = "requires minio"]
fn interrupted_multipart_upload_leaves_nothing_behind() -> Result<()> {
    coldvault_testing::logging::test_with_logging(async move {
        let server = server().await?;
        let bucket = make_versioned_bucket(&server, "videos").await?;

        // The first 6 MiB chunk compresses to more than one part before the read fails
        let test_data =
            test_data::make_test_data([test_data::TestObject::new("large.mov", "24 MiB")]);
        let source = MemorySource::new().with_chunk_size(6 * 1024 * 1024);
        source.put_object("videos", "large.mov", test_data["large.mov"].data.clone());
        source.interrupt_read("videos", "large.mov");

        let pipeline = make_pipeline(&server, &source).await?;
        assert_matches!(
            pipeline
                .transfer_and_store("videos", "large.mov", &bucket)
                .await,
            Err(ColdVaultError::ObjectReadInterrupted { .. })
        );

        let client = server.aws_client().await?;
        assert!(test_data::read_bucket_objects(&client, &bucket)
            .await?
            .is_empty());

        let uploads = client
            .list_multipart_uploads()
            .bucket(&bucket)
            .send()
            .await?;
        assert!(uploads.uploads().is_empty());

        Ok(())
    })
}
