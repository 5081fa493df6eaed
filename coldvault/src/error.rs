use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::{
    abort_multipart_upload::AbortMultipartUploadError,
    complete_multipart_upload::CompleteMultipartUploadError,
    create_bucket::CreateBucketError, create_multipart_upload::CreateMultipartUploadError,
    get_bucket_lifecycle_configuration::GetBucketLifecycleConfigurationError,
    get_bucket_location::GetBucketLocationError, get_bucket_versioning::GetBucketVersioningError,
    head_bucket::HeadBucketError,
    put_bucket_lifecycle_configuration::PutBucketLifecycleConfigurationError,
    put_bucket_versioning::PutBucketVersioningError, put_object::PutObjectError,
    upload_part::UploadPartError,
};
use snafu::prelude::*;
use url::Url;

pub type Result<T, E = ColdVaultError> = std::result::Result<T, E>;

/// Broad classification of a [`ColdVaultError`], which determines how the backup run reacts to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ErrorKind {
    /// Authentication, listing or provisioning failed.  The run cannot continue.
    FatalSetup,

    /// A single object could not be copied.  The failure is recorded and the run continues.
    PerObjectTransfer,

    /// The end-of-run notification could not be delivered.  Logged and otherwise ignored.
    Notification,

    /// The run was aborted by the caller.
    Aborted,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ColdVaultError {
    #[snafu(display("Required setting '{setting}' is not configured"))]
    MissingConfig { setting: &'static str },

    #[snafu(display("Error constructing the HTTP client"))]
    BuildHttpClient { source: reqwest::Error },

    #[snafu(display("The URL '{url}' is not a valid base URL for an object store account"))]
    InvalidAccountUrl { url: Url },

    #[snafu(display("Error authenticating against identity service '{url}'"))]
    Authenticate { url: Url, source: reqwest::Error },

    #[snafu(display("Error listing containers in the source account"))]
    ListContainers { source: reqwest::Error },

    #[snafu(display("Error listing objects in source container '{container}'"))]
    ListObjects {
        container: String,
        source: reqwest::Error,
    },

    #[snafu(display(
        "The listing response from '{url}' has a missing or invalid '{header}' header"
    ))]
    MissingDeclaredTotal { url: Url, header: &'static str },

    #[snafu(display(
        "Listing of '{scope}' stopped making progress after {requests} requests: {accumulated} of {declared_total} names listed"
    ))]
    ListStalled {
        scope: String,
        accumulated: usize,
        declared_total: usize,
        requests: usize,
    },

    #[snafu(display("The container '{container}' does not exist in the source account"))]
    UnknownContainer { container: String },

    #[snafu(display("The container '{container}' does not exist in the source store"))]
    ContainerNotFound { container: String },

    #[snafu(display("Error fetching object '{object}' from source container '{container}'"))]
    FetchObject {
        container: String,
        object: String,
        source: reqwest::Error,
    },

    #[snafu(display(
        "Error reading the body of object '{object}' from source container '{container}'"
    ))]
    ReadObject {
        container: String,
        object: String,
        source: reqwest::Error,
    },

    #[snafu(display(
        "The source responded with HTTP status {status} when fetching object '{object}' from container '{container}'"
    ))]
    FetchObjectStatus {
        container: String,
        object: String,
        status: u16,
    },

    #[snafu(display("The object '{object}' does not exist in source container '{container}'"))]
    ObjectNotFound { container: String, object: String },

    #[snafu(display(
        "The connection was lost while reading object '{object}' from source container '{container}'"
    ))]
    ObjectReadInterrupted { container: String, object: String },

    #[snafu(display("The container name '{container}' maps to the invalid bucket name '{bucket}'"))]
    InvalidBucketName { container: String, bucket: String },

    #[snafu(display(
        "Containers '{first}' and '{second}' both map to destination bucket '{bucket}'.  Change the bucket name template so every container gets its own bucket"
    ))]
    BucketNameCollision {
        bucket: String,
        first: String,
        second: String,
    },

    #[snafu(display(
        "ConfigMismatchError: bucket '{bucket}' has {setting} '{actual}' but the backup policy requires '{expected}'.  Refusing to reconfigure a bucket that may hold backup data"
    ))]
    ConfigMismatch {
        bucket: String,
        setting: &'static str,
        expected: String,
        actual: String,
    },

    #[snafu(display("Error checking whether destination bucket '{bucket}' exists"))]
    HeadBucket {
        bucket: String,
        source: SdkError<HeadBucketError>,
    },

    #[snafu(display("Error checking if versioning is enabled on destination bucket '{bucket}'"))]
    GetBucketVersioning {
        bucket: String,
        source: SdkError<GetBucketVersioningError>,
    },

    #[snafu(display("Error reading the lifecycle rules of destination bucket '{bucket}'"))]
    GetBucketLifecycle {
        bucket: String,
        source: SdkError<GetBucketLifecycleConfigurationError>,
    },

    #[snafu(display("Error reading the region of destination bucket '{bucket}'"))]
    GetBucketLocation {
        bucket: String,
        source: SdkError<GetBucketLocationError>,
    },

    #[snafu(display("Error creating destination bucket '{bucket}'"))]
    CreateBucket {
        bucket: String,
        source: SdkError<CreateBucketError>,
    },

    #[snafu(display("Error enabling versioning on destination bucket '{bucket}'"))]
    PutBucketVersioning {
        bucket: String,
        source: SdkError<PutBucketVersioningError>,
    },

    #[snafu(display("Error applying the retention lifecycle rule to destination bucket '{bucket}'"))]
    PutBucketLifecycle {
        bucket: String,
        source: SdkError<PutBucketLifecycleConfigurationError>,
    },

    #[snafu(display("Error building the lifecycle configuration for bucket '{bucket}'"))]
    BuildLifecycleRule {
        bucket: String,
        source: aws_sdk_s3::error::BuildError,
    },

    #[snafu(display("Error starting multipart upload of '{key}' to bucket '{bucket}'"))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<CreateMultipartUploadError>,
    },

    #[snafu(display("Error uploading part {part_number} of '{key}' to bucket '{bucket}'"))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: usize,
        source: SdkError<UploadPartError>,
    },

    #[snafu(display("Error committing multipart upload of '{key}' to bucket '{bucket}'"))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<CompleteMultipartUploadError>,
    },

    #[snafu(display("Error aborting multipart upload of '{key}' to bucket '{bucket}'"))]
    AbortMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<AbortMultipartUploadError>,
    },

    #[snafu(display("Error committing object '{key}' to bucket '{bucket}'"))]
    PutObject {
        bucket: String,
        key: String,
        source: SdkError<PutObjectError>,
    },

    #[snafu(display("The destination rejected the commit of object '{key}' in bucket '{bucket}'"))]
    CommitRejected { bucket: String, key: String },

    #[snafu(display("The destination bucket '{bucket}' does not exist"))]
    DestinationBucketMissing { bucket: String },

    #[snafu(display(
        "The upload task for '{key}' in bucket '{bucket}' exited without reporting a result"
    ))]
    UploadAbandoned { bucket: String, key: String },

    #[snafu(display("Error reading the upload stream for '{key}' in bucket '{bucket}'"))]
    ReadUploadStream {
        bucket: String,
        key: String,
        source: std::io::Error,
    },

    #[snafu(display("Error compressing object '{object}' into bucket '{bucket}'"))]
    Compress {
        bucket: String,
        object: String,
        source: std::io::Error,
    },

    #[snafu(display("The compression worker for object '{object}' failed"))]
    CompressTaskFailed {
        object: String,
        source: tokio::task::JoinError,
    },

    #[snafu(display(
        "The name '{name}' in source container '{container}' can't be requested without the URL resolving to a different name"
    ))]
    UnaddressableName { container: String, name: String },

    #[snafu(display("The transfer of object '{object}' panicked"))]
    TransferPanicked { object: String },

    #[snafu(display("Error delivering the run summary notification to '{url}'"))]
    Notify { url: Url, source: reqwest::Error },

    #[snafu(display("The operation was aborted"))]
    Aborted,
}

impl ColdVaultError {
    /// Classify this error according to how the backup run must react to it
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FetchObject { .. }
            | Self::ReadObject { .. }
            | Self::FetchObjectStatus { .. }
            | Self::ObjectNotFound { .. }
            | Self::ObjectReadInterrupted { .. }
            | Self::UnaddressableName { .. }
            | Self::CreateMultipartUpload { .. }
            | Self::UploadPart { .. }
            | Self::CompleteMultipartUpload { .. }
            | Self::AbortMultipartUpload { .. }
            | Self::PutObject { .. }
            | Self::CommitRejected { .. }
            | Self::DestinationBucketMissing { .. }
            | Self::UploadAbandoned { .. }
            | Self::ReadUploadStream { .. }
            | Self::Compress { .. }
            | Self::CompressTaskFailed { .. }
            | Self::TransferPanicked { .. } => ErrorKind::PerObjectTransfer,

            Self::Notify { .. } => ErrorKind::Notification,

            Self::Aborted => ErrorKind::Aborted,

            _ => ErrorKind::FatalSetup,
        }
    }

    /// Render this error followed by every error in its source chain, separated by `: `.
    ///
    /// The `Display` impl of each variant only describes that level of the failure, which is
    /// rarely enough to act on when reading a report of failed objects.
    pub fn display_chain(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);

        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }

        message
    }
}
