use crate::provision::BucketPolicy;
use url::Url;

/// The configuration settings that control the behavior of a backup run.
///
/// A `Config` is built once (usually from the command line and the environment by the CLI) and
/// then handed to each component by value.  Nothing in this crate reads the process environment
/// on its own.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// The maximum number of objects that are transferred at the same time.
    ///
    /// Each in-flight transfer holds one connection to the source, one to the destination, and
    /// buffers at most one multipart chunk in memory.
    #[cfg_attr(feature = "clap", clap(long, default_value = "5"))]
    pub max_concurrent_transfers: usize,

    /// Report progress every time this many objects in a container have been processed.
    #[cfg_attr(feature = "clap", clap(long, default_value = "1000"))]
    pub progress_interval: usize,

    /// How many consecutive listing requests may come back without any new names before the
    /// listing is declared stalled.
    #[cfg_attr(feature = "clap", clap(long, default_value = "3"))]
    pub max_stalled_pages: usize,

    /// The number of source chunks buffered between the download and the compressor of a single
    /// object.
    #[cfg_attr(feature = "clap", clap(long, default_value = "8"))]
    pub relay_depth: usize,

    /// gzip compression level, from 0 (none) to 9 (best).
    #[cfg_attr(feature = "clap", clap(long, default_value = "6"))]
    pub compression_level: u32,

    /// The chunk size used for multipart uploads of compressed objects.
    ///
    /// Compressed objects smaller than this are uploaded with a single request when they are
    /// committed.  S3 requires this to be at least 5MiB.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB".
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB"))]
    pub multipart_chunk_size: byte_unit::Byte,

    /// URL of the Swift account to back up, for example
    /// `https://object-storage.tyo1.conoha.io/v1/nc_<tenant id>`.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "COLDVAULT_SWIFT_ACCOUNT_URL", value_name = "URL")
    )]
    pub swift_account_url: Option<Url>,

    /// URL of the Keystone v2 identity service used to obtain a token, for example
    /// `https://identity.tyo1.conoha.io/v2.0`.
    ///
    /// Not needed if `swift_auth_token` is set.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "COLDVAULT_SWIFT_IDENTITY_URL", value_name = "URL")
    )]
    pub swift_identity_url: Option<Url>,

    /// User name for the identity service
    #[cfg_attr(feature = "clap", clap(long, env = "CONOHA_USERNAME"))]
    pub swift_username: Option<String>,

    /// Password for the identity service
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "CONOHA_PASSWORD", hide_env_values = true)
    )]
    pub swift_password: Option<SecretString>,

    /// Tenant ID for the identity service
    #[cfg_attr(feature = "clap", clap(long, env = "CONOHA_TENANT_ID"))]
    pub swift_tenant_id: Option<String>,

    /// A pre-issued Swift token.  When set, the identity service is not contacted.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "SWIFT_AUTH_TOKEN", hide_env_values = true)
    )]
    pub swift_auth_token: Option<SecretString>,

    /// Only back up the named container.  May be repeated.  By default every container in the
    /// account is backed up.
    #[cfg_attr(feature = "clap", clap(long = "container", value_name = "NAME"))]
    pub containers: Vec<String>,

    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "COLDVAULT_S3_ENDPOINT", value_name = "URL")
    )]
    pub s3_endpoint: Option<Url>,

    /// The region in which destination buckets are created
    #[cfg_attr(feature = "clap", clap(long, default_value = "ap-northeast-1"))]
    pub region: String,

    /// The cold storage class objects are stored in, using the S3 storage class names, ie
    /// `GLACIER`, `DEEP_ARCHIVE` or `GLACIER_IR`
    #[cfg_attr(feature = "clap", clap(long, default_value = "GLACIER"))]
    pub storage_class: String,

    /// Backed up objects are deleted by a lifecycle rule this many days after they are written
    #[cfg_attr(feature = "clap", clap(long, default_value = "90"))]
    pub retention_days: u32,

    /// Template for destination bucket names.
    ///
    /// `{container}` is replaced by the source container name and `{date}` by the UTC date the
    /// run started, as `YYYY-MM-DD`.  The result is normalized to a valid S3 bucket name.
    #[cfg_attr(feature = "clap", clap(long, default_value = "{container}-{date}"))]
    pub bucket_name_template: String,

    /// Base URL of the traQ instance that receives the run summary
    #[cfg_attr(
        feature = "clap",
        clap(
            long,
            env = "TRAQ_BASE_URL",
            default_value = "https://q.trap.jp/",
            value_name = "URL"
        )
    )]
    pub webhook_base_url: Url,

    /// ID of the traQ webhook that receives the run summary.  If not set no summary is sent.
    #[cfg_attr(feature = "clap", clap(long, env = "TRAQ_WEBHOOK_ID"))]
    pub webhook_id: Option<String>,

    /// Secret used to sign webhook messages
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "TRAQ_WEBHOOK_SECRET", hide_env_values = true)
    )]
    pub webhook_secret: Option<SecretString>,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: Unfortunately this is duplicated here and in the `clap` attributes.  There's no
        // better way unless we unconditionally take a clap dependency in the lib crate.
        Self {
            max_concurrent_transfers: 5,
            progress_interval: 1000,
            max_stalled_pages: 3,
            relay_depth: 8,
            compression_level: 6,
            multipart_chunk_size: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            swift_account_url: None,
            swift_identity_url: None,
            swift_username: None,
            swift_password: None,
            swift_tenant_id: None,
            swift_auth_token: None,
            containers: vec![],
            s3_endpoint: None,
            region: "ap-northeast-1".to_string(),
            storage_class: "GLACIER".to_string(),
            retention_days: 90,
            bucket_name_template: "{container}-{date}".to_string(),
            webhook_base_url: "https://q.trap.jp/"
                .parse()
                .expect("BUG: default webhook URL is valid"),
            webhook_id: None,
            webhook_secret: None,
        }
    }
}

impl Config {
    /// The policy every destination bucket is created with, or validated against
    pub fn bucket_policy(&self) -> BucketPolicy {
        BucketPolicy {
            storage_class: self.storage_class.clone(),
            region: self.region.clone(),
            versioning_enabled: true,
            retention_days: self.retention_days,
        }
    }

    /// Multipart chunk size in bytes
    pub(crate) fn multipart_chunk_bytes(&self) -> usize {
        self.multipart_chunk_size.get_bytes() as usize
    }
}

/// A configuration value that must not end up in log output.
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

impl std::str::FromStr for SecretString {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}
