use super::DestinationStorage;
use crate::provision::{BucketDescriptor, BucketPolicy};
use crate::writers::{await_decision, object_writer, read_chunk, PendingObject, UploadDecision};
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLifecycleConfiguration, BucketLocationConstraint, BucketVersioningStatus,
    CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration, ExpirationStatus,
    LifecycleExpiration, LifecycleRule, LifecycleRuleFilter, NoncurrentVersionExpiration,
    StorageClass, Transition, TransitionStorageClass, VersioningConfiguration,
};
use aws_types::region::Region;
use bytes::Bytes;
use snafu::{prelude::*, IntoError};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::oneshot;
use tracing::{debug, error, instrument, warn, Instrument};

/// ID of the lifecycle rule which puts objects into cold storage and expires them
const RETENTION_RULE_ID: &str = "coldvault-retention";

/// S3 error code returned when a bucket has no lifecycle configuration at all
const NO_LIFECYCLE_CODE: &str = "NoSuchLifecycleConfiguration";

/// Storage class of objects in a bucket without a retention rule
const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

/// Region of buckets whose location constraint is empty
const DEFAULT_REGION: &str = "us-east-1";

/// Implementation of [`DestinationStorage`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub struct S3 {
    inner: Arc<S3Inner>,
}

struct S3Inner {
    config: Config,
    client: aws_sdk_s3::Client,
}

impl S3 {
    /// Connect to the endpoint in the config, with credentials from the standard AWS chain
    pub async fn new(config: Config) -> Self {
        let client = make_s3_client(&config).await;

        Self::with_client(config, client)
    }

    /// Use an already configured client.  Only the upload settings are taken from `config`.
    pub fn with_client(config: Config, client: aws_sdk_s3::Client) -> Self {
        Self {
            inner: Arc::new(S3Inner { config, client }),
        }
    }

    async fn bucket_versioning_enabled(&self, bucket: &str) -> Result<bool> {
        let versioning = self
            .inner
            .client
            .get_bucket_versioning()
            .bucket(bucket)
            .send()
            .await
            .with_context(|_| crate::error::GetBucketVersioningSnafu { bucket })?;

        Ok(versioning.status() == Some(&BucketVersioningStatus::Enabled))
    }

    async fn bucket_region(&self, bucket: &str) -> Result<String> {
        let location = self
            .inner
            .client
            .get_bucket_location()
            .bucket(bucket)
            .send()
            .await
            .with_context(|_| crate::error::GetBucketLocationSnafu { bucket })?;

        Ok(location
            .location_constraint()
            .map(|constraint| constraint.as_str())
            .filter(|constraint| !constraint.is_empty())
            .unwrap_or(DEFAULT_REGION)
            .to_string())
    }

    async fn bucket_lifecycle_rules(&self, bucket: &str) -> Result<Vec<LifecycleRule>> {
        match self
            .inner
            .client
            .get_bucket_lifecycle_configuration()
            .bucket(bucket)
            .send()
            .await
        {
            Ok(output) => Ok(output.rules().to_vec()),
            Err(e) if e.code() == Some(NO_LIFECYCLE_CODE) => {
                debug!(bucket, "Bucket has no lifecycle configuration");
                Ok(vec![])
            }
            Err(e) => Err(e).with_context(|_| crate::error::GetBucketLifecycleSnafu { bucket }),
        }
    }

    /// Drain `reader` into the object `key`, making the object visible only once the owner of the
    /// [`PendingObject`] commits.
    ///
    /// Output that fits in a single chunk is held in memory and sent with one `PutObject` at
    /// commit time.  Anything larger is sent as a multipart upload as it is written, which is
    /// completed on commit and aborted otherwise.
    async fn upload_object(
        self,
        bucket: String,
        key: String,
        mut reader: DuplexStream,
        decision: oneshot::Receiver<UploadDecision>,
    ) -> Result<u64> {
        let chunk_size = self.inner.config.multipart_chunk_bytes();

        let first_chunk = read_chunk(&mut reader, chunk_size)
            .await
            .with_context(|_| crate::error::ReadUploadStreamSnafu {
                bucket: &bucket,
                key: &key,
            })?;

        if first_chunk.len() < chunk_size {
            // The writer was closed before a whole chunk was written, so this is the entire object
            match await_decision(decision).await {
                UploadDecision::Abort => {
                    debug!(%bucket, %key, "Upload aborted before commit; nothing was sent");
                    Ok(0)
                }
                UploadDecision::Commit => self.put_object(&bucket, &key, first_chunk).await,
            }
        } else {
            let response = self
                .inner
                .client
                .create_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .storage_class(StorageClass::from(self.inner.config.storage_class.as_str()))
                .send()
                .await
                .with_context(|_| crate::error::CreateMultipartUploadSnafu {
                    bucket: &bucket,
                    key: &key,
                })?;
            let upload_id = response
                .upload_id()
                .expect("BUG: multi-part uploads always have upload ID")
                .to_string();

            let result = self
                .multipart_upload(&bucket, &key, &upload_id, first_chunk, reader, decision)
                .await;

            match result {
                Ok(Some(len)) => Ok(len),
                Ok(None) => {
                    debug!(%bucket, %key, %upload_id, "Multi-part upload aborted before commit");
                    self.abort_multipart_upload(&bucket, &key, &upload_id).await;
                    Ok(0)
                }
                Err(e) => {
                    error!(?e, %bucket, %key, %upload_id,
                        "Multi-part upload failed; aborting multi-part upload on server side");
                    self.abort_multipart_upload(&bucket, &key, &upload_id).await;
                    Err(e)
                }
            }
        }
    }

    /// Upload every chunk of the object as a part, then wait for the decision.
    ///
    /// Returns `None` if the upload was aborted, in which case the caller must abort the multipart
    /// upload.
    #[instrument(skip(self, first_chunk, reader, decision))]
    async fn multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        first_chunk: Bytes,
        mut reader: DuplexStream,
        decision: oneshot::Receiver<UploadDecision>,
    ) -> Result<Option<u64>> {
        let chunk_size = self.inner.config.multipart_chunk_bytes();
        let mut completed_parts = Vec::new();
        let mut total_bytes = 0u64;
        let mut chunk = first_chunk;

        while !chunk.is_empty() {
            // S3 numbers parts from 1
            let part_number = completed_parts.len() + 1;
            let part_size = chunk.len();

            let response = self
                .inner
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number as i32)
                .body(ByteStream::from(chunk))
                .send()
                .instrument(tracing::debug_span!("upload part", part_number, part_size))
                .await
                .with_context(|_| crate::error::UploadPartSnafu {
                    bucket,
                    key,
                    part_number,
                })?;

            let e_tag = response
                .e_tag()
                .expect("BUG: uploaded part missing etag")
                .to_string();

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(e_tag)
                    .part_number(part_number as i32)
                    .build(),
            );
            total_bytes += part_size as u64;

            chunk = read_chunk(&mut reader, chunk_size)
                .await
                .with_context(|_| crate::error::ReadUploadStreamSnafu { bucket, key })?;
        }

        debug!(
            parts = completed_parts.len(),
            total_bytes, "All parts uploaded; waiting for commit"
        );

        match await_decision(decision).await {
            UploadDecision::Abort => Ok(None),
            UploadDecision::Commit => {
                self.inner
                    .client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(completed_parts))
                            .build(),
                    )
                    .send()
                    .await
                    .with_context(|_| crate::error::CompleteMultipartUploadSnafu { bucket, key })?;

                debug!(total_bytes, "Committed multi-part upload");

                Ok(Some(total_bytes))
            }
        }
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<u64> {
        let len = data.len() as u64;

        self.inner
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .storage_class(StorageClass::from(self.inner.config.storage_class.as_str()))
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::PutObjectSnafu { bucket, key })?;

        debug!(bucket, key, len, "Committed object with a single request");

        Ok(len)
    }

    /// Abort a multipart upload.  Failure is logged and otherwise ignored, as there's nothing
    /// more to do about it; the retention rule expires whatever is left behind.
    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) {
        if let Err(e) = self
            .inner
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            let e = crate::error::AbortMultipartUploadSnafu { bucket, key }.into_error(e);
            error!(error = %e.display_chain(), %upload_id,
                "Error aborting multi-part upload.  The parts will remain on the server unless a lifecycle policy removes them");
        }
    }
}

impl std::fmt::Debug for S3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S3")
    }
}

#[async_trait::async_trait]
impl DestinationStorage for S3 {
    #[instrument(skip(self))]
    async fn get_bucket(&self, name: &str) -> Result<Option<BucketDescriptor>> {
        match self.inner.client.head_bucket().bucket(name).send().await {
            Ok(_) => {}
            Err(e)
                if e
                    .as_service_error()
                    .map_or(false, |service_error| service_error.is_not_found()) =>
            {
                debug!("Bucket does not exist");
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|_| crate::error::HeadBucketSnafu { bucket: name });
            }
        }

        let versioning_enabled = self.bucket_versioning_enabled(name).await?;
        let region = self.bucket_region(name).await?;
        let rules = self.bucket_lifecycle_rules(name).await?;
        let (storage_class, retention_days) = read_retention_rule(&rules);

        let descriptor = BucketDescriptor {
            name: name.to_string(),
            storage_class,
            region,
            versioning_enabled,
            retention_days,
        };

        debug!(?descriptor, "Read existing bucket configuration");

        Ok(Some(descriptor))
    }

    #[instrument(skip(self))]
    async fn create_bucket(&self, name: &str, policy: &BucketPolicy) -> Result<BucketDescriptor> {
        let mut request = self.inner.client.create_bucket().bucket(name);

        // S3 rejects an explicit location constraint for its default region
        if policy.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(policy.region.as_str()))
                    .build(),
            );
        }

        request
            .send()
            .await
            .with_context(|_| crate::error::CreateBucketSnafu { bucket: name })?;

        debug!("Created bucket; applying versioning and retention policy");

        if policy.versioning_enabled {
            self.inner
                .client
                .put_bucket_versioning()
                .bucket(name)
                .versioning_configuration(
                    VersioningConfiguration::builder()
                        .status(BucketVersioningStatus::Enabled)
                        .build(),
                )
                .send()
                .await
                .with_context(|_| crate::error::PutBucketVersioningSnafu { bucket: name })?;
        }

        let lifecycle = BucketLifecycleConfiguration::builder()
            .rules(retention_rule(name, policy)?)
            .build()
            .with_context(|_| crate::error::BuildLifecycleRuleSnafu { bucket: name })?;

        self.inner
            .client
            .put_bucket_lifecycle_configuration()
            .bucket(name)
            .lifecycle_configuration(lifecycle)
            .send()
            .await
            .with_context(|_| crate::error::PutBucketLifecycleSnafu { bucket: name })?;

        Ok(BucketDescriptor::from_policy(name, policy))
    }

    async fn open_object_writer(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(DuplexStream, PendingObject)> {
        let me = self.clone();
        let bucket_name = bucket.to_string();
        let object_key = key.to_string();

        Ok(object_writer(bucket, key, move |reader, decision| {
            me.upload_object(bucket_name, object_key, reader, decision)
        }))
    }
}

/// The lifecycle rule which moves every object to the policy's storage class right away, and
/// deletes objects (current and noncurrent versions) once the retention period is over
fn retention_rule(bucket: &str, policy: &BucketPolicy) -> Result<LifecycleRule> {
    let retention_days = i32::try_from(policy.retention_days).unwrap_or(i32::MAX);

    LifecycleRule::builder()
        .id(RETENTION_RULE_ID)
        .status(ExpirationStatus::Enabled)
        .filter(LifecycleRuleFilter::builder().prefix("").build())
        .transitions(
            Transition::builder()
                .days(0)
                .storage_class(TransitionStorageClass::from(policy.storage_class.as_str()))
                .build(),
        )
        .expiration(LifecycleExpiration::builder().days(retention_days).build())
        .noncurrent_version_expiration(
            NoncurrentVersionExpiration::builder()
                .noncurrent_days(retention_days)
                .build(),
        )
        .build()
        .with_context(|_| crate::error::BuildLifecycleRuleSnafu { bucket })
}

/// Recover the storage class and retention period from a bucket's lifecycle rules.
///
/// S3 buckets don't have a storage class of their own; the storage class of a bucket is the one
/// its retention rule transitions objects to, or `STANDARD` if there is no such rule.
fn read_retention_rule(rules: &[LifecycleRule]) -> (String, Option<u32>) {
    let rule = rules.iter().find(|rule| {
        rule.id() == Some(RETENTION_RULE_ID) && rule.status() == &ExpirationStatus::Enabled
    });

    match rule {
        None => (DEFAULT_STORAGE_CLASS.to_string(), None),
        Some(rule) => {
            let storage_class = rule
                .transitions()
                .iter()
                .find_map(|transition| transition.storage_class())
                .map(|class| class.as_str().to_string())
                .unwrap_or_else(|| {
                    warn!("Retention rule has no storage class transition");
                    DEFAULT_STORAGE_CLASS.to_string()
                });
            let retention_days = rule
                .expiration()
                .and_then(|expiration| expiration.days())
                .and_then(|days| u32::try_from(days).ok());

            (storage_class, retention_days)
        }
    }
}

/// Create a new AWS SDK S3 client for the configured region, and the configured endpoint if
/// this isn't AWS itself
async fn make_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let region_provider = RegionProviderChain::first_try(Region::new(config.region.clone()));
    let aws_config = aws_config::defaults(BehaviorVersion::latest())
        .region(region_provider)
        .load()
        .await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // S3-compatible services generally don't support virtual-hosted bucket addressing
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.as_str().trim_end_matches('/'))
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}
