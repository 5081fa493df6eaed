//! The object storage systems on either side of a backup.
//!
//! The source is a Swift-compatible store whose containers are copied, and the destination is an
//! S3-compatible store where each container lands in its own cold-storage bucket.  Both are
//! abstracted behind traits so that the migration engine can be exercised against the in-memory
//! implementations in [`memory`].
use crate::provision::{BucketDescriptor, BucketPolicy};
use crate::writers::PendingObject;
use crate::{Config, Result};
use bytes::Bytes;
use dyn_clone::DynClone;
use futures::Stream;
use std::pin::Pin;
use tokio::io::DuplexStream;

pub mod memory;
mod s3;
mod swift;

pub use s3::S3;
pub use swift::Swift;

/// A stream of chunks of an object's body, in order
pub type ObjectByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// An opaque credential issued by [`SourceStorage::authenticate`] and passed to every subsequent
/// source request.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// One page of a marker-paginated listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListingPage {
    /// The names on this page, in ascending order
    pub names: Vec<String>,

    /// The total number of names the store claims to hold at the time this page was produced.
    ///
    /// This is a snapshot; if the listing is being mutated concurrently it may be stale.
    pub declared_total: usize,
}

/// The store objects are backed up from.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait SourceStorage: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Obtain a credential for the subsequent requests
    async fn authenticate(&self) -> Result<AuthToken>;

    /// List one page of container names in the account, starting after `marker`
    async fn list_container_page(
        &self,
        token: &AuthToken,
        marker: Option<&str>,
    ) -> Result<ListingPage>;

    /// List one page of object names in `container`, starting after `marker`
    async fn list_object_page(
        &self,
        token: &AuthToken,
        container: &str,
        marker: Option<&str>,
    ) -> Result<ListingPage>;

    /// Start reading an object.
    ///
    /// Errors establishing the read are returned directly; errors that happen after the first
    /// byte are yielded by the stream.
    async fn fetch_object_stream(
        &self,
        token: &AuthToken,
        container: &str,
        object: &str,
    ) -> Result<ObjectByteStream>;
}

dyn_clone::clone_trait_object!(SourceStorage);

/// The store that receives the backups.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait DestinationStorage: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Describe an existing bucket, or return `None` if there is no bucket called `name`
    async fn get_bucket(&self, name: &str) -> Result<Option<BucketDescriptor>>;

    /// Create a new bucket configured according to `policy`
    async fn create_bucket(&self, name: &str, policy: &BucketPolicy) -> Result<BucketDescriptor>;

    /// Construct a [`DuplexStream`] that will upload all written data to the object `key` in
    /// `bucket`.
    ///
    /// The written data don't become visible at the destination until
    /// [`PendingObject::commit`] succeeds.  Calling [`PendingObject::abort`] or just dropping the
    /// `PendingObject` discards everything written.
    ///
    /// In the event there is some error with the upload, writes to the stream will fail with a
    /// BrokenPipe error, in which case callers should consult the `PendingObject` to get the
    /// actual error details.
    async fn open_object_writer(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(DuplexStream, PendingObject)>;
}

dyn_clone::clone_trait_object!(DestinationStorage);

/// Constructs the [`SourceStorage`] and [`DestinationStorage`] implementations a [`Config`]
/// describes.
#[derive(Debug)]
pub(crate) struct ObjectStorageFactory {
    config: Config,
}

impl ObjectStorageFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// The Swift account named in the config
    pub fn source(&self) -> Result<Box<dyn SourceStorage>> {
        Ok(Box::new(Swift::new(&self.config)?))
    }

    /// The S3 (or S3-compatible) endpoint named in the config
    pub async fn destination(&self) -> Box<dyn DestinationStorage> {
        // Every call makes a new client instead of caching one in a static.  Clients hold on to
        // connection pool resources tied to the tokio runtime they were created in, so sharing
        // one across runtimes (as happens in tests) can panic.
        Box::new(S3::new(self.config.clone()).await)
    }
}
