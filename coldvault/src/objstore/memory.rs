//! In-memory implementations of the source and destination stores.
//!
//! These back the tests of the migration engine, and are useful for dry runs of the engine
//! against synthetic data.  Both can be told to fail in specific ways so that the error handling
//! of the engine can be exercised.
use super::{AuthToken, DestinationStorage, ListingPage, ObjectByteStream, SourceStorage};
use crate::provision::{BucketDescriptor, BucketPolicy};
use crate::writers::{await_decision, object_writer, PendingObject, UploadDecision};
use crate::Result;
use bytes::Bytes;
use snafu::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};
use tracing::debug;

/// Largest listing page the Swift API returns by default
const DEFAULT_PAGE_SIZE: usize = 10_000;

/// Size of the chunks object bodies are streamed in
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Account-level listings are recorded under this scope in [`MemorySource::listing_markers`]
pub const ACCOUNT_SCOPE: &str = "<account>";

/// A source store holding its containers in memory.
///
/// Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    inner: Arc<MemorySourceInner>,
}

#[derive(Debug, Default)]
struct MemorySourceInner {
    state: Mutex<MemorySourceState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetches: AtomicUsize,
}

#[derive(Debug)]
struct MemorySourceState {
    containers: BTreeMap<String, BTreeMap<String, Bytes>>,
    page_size: usize,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    failing_fetches: HashSet<(String, String)>,
    interrupted_reads: HashSet<(String, String)>,
    listing_markers: Vec<(String, Option<String>)>,
}

impl Default for MemorySourceState {
    fn default() -> Self {
        Self {
            containers: BTreeMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: None,
            failing_fetches: HashSet::new(),
            interrupted_reads: HashSet::new(),
            listing_markers: Vec::new(),
        }
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve at most `page_size` names per listing request
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.state().page_size = page_size.max(1);
        self
    }

    /// Stream object bodies in chunks of `chunk_size` bytes
    pub fn with_chunk_size(self, chunk_size: usize) -> Self {
        self.state().chunk_size = chunk_size.max(1);
        self
    }

    /// Sleep this long before yielding each chunk of an object body
    pub fn with_chunk_delay(self, delay: Duration) -> Self {
        self.state().chunk_delay = Some(delay);
        self
    }

    /// Create an empty container, if it doesn't exist yet
    pub fn add_container(&self, container: impl Into<String>) {
        self.state().containers.entry(container.into()).or_default();
    }

    /// Store an object, creating its container if needed
    pub fn put_object(
        &self,
        container: impl Into<String>,
        object: impl Into<String>,
        data: impl Into<Bytes>,
    ) {
        self.state()
            .containers
            .entry(container.into())
            .or_default()
            .insert(object.into(), data.into());
    }

    /// Make fetching an object fail outright, as if the store responded with a server error
    pub fn fail_fetch(&self, container: impl Into<String>, object: impl Into<String>) {
        self.state()
            .failing_fetches
            .insert((container.into(), object.into()));
    }

    /// Make reading an object fail after the first chunk of its body
    pub fn interrupt_read(&self, container: impl Into<String>, object: impl Into<String>) {
        self.state()
            .interrupted_reads
            .insert((container.into(), object.into()));
    }

    /// The marker of every listing request made against `scope`, which is either a container
    /// name or [`ACCOUNT_SCOPE`]
    pub fn listing_markers(&self, scope: &str) -> Vec<Option<String>> {
        self.state()
            .listing_markers
            .iter()
            .filter(|(s, _)| s == scope)
            .map(|(_, marker)| marker.clone())
            .collect()
    }

    /// The largest number of object bodies that were being read at the same time
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// How many fetches were started
    pub fn fetches(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemorySourceState> {
        self.inner
            .state
            .lock()
            .expect("BUG: memory source mutex poisoned")
    }

    fn page<'a>(
        state: &mut MemorySourceState,
        scope: &str,
        names: impl Iterator<Item = &'a String>,
        total: usize,
        marker: Option<&str>,
    ) -> ListingPage {
        let page_size = state.page_size;
        let names = names
            .filter(|name| marker.map_or(true, |marker| name.as_str() > marker))
            .take(page_size)
            .cloned()
            .collect();

        state
            .listing_markers
            .push((scope.to_string(), marker.map(str::to_string)));

        ListingPage {
            names,
            declared_total: total,
        }
    }
}

/// Tracks one in-flight read of an object body, for [`MemorySource::max_in_flight`]
struct InFlightGuard {
    inner: Arc<MemorySourceInner>,
}

impl InFlightGuard {
    fn new(inner: Arc<MemorySourceInner>) -> Self {
        let in_flight = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        inner.fetches.fetch_add(1, Ordering::SeqCst);

        Self { inner }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl SourceStorage for MemorySource {
    async fn authenticate(&self) -> Result<AuthToken> {
        Ok(AuthToken::new("memory"))
    }

    async fn list_container_page(
        &self,
        _token: &AuthToken,
        marker: Option<&str>,
    ) -> Result<ListingPage> {
        let mut state = self.state();
        let names = state.containers.keys().cloned().collect::<Vec<_>>();

        Ok(Self::page(
            &mut state,
            ACCOUNT_SCOPE,
            names.iter(),
            names.len(),
            marker,
        ))
    }

    async fn list_object_page(
        &self,
        _token: &AuthToken,
        container: &str,
        marker: Option<&str>,
    ) -> Result<ListingPage> {
        let mut state = self.state();
        let names = match state.containers.get(container) {
            Some(objects) => objects.keys().cloned().collect::<Vec<_>>(),
            None => {
                return crate::error::ContainerNotFoundSnafu { container }.fail();
            }
        };

        Ok(Self::page(
            &mut state,
            container,
            names.iter(),
            names.len(),
            marker,
        ))
    }

    async fn fetch_object_stream(
        &self,
        _token: &AuthToken,
        container: &str,
        object: &str,
    ) -> Result<ObjectByteStream> {
        let (data, chunk_size, delay, interrupted) = {
            let state = self.state();
            let key = (container.to_string(), object.to_string());

            if state.failing_fetches.contains(&key) {
                return crate::error::FetchObjectStatusSnafu {
                    container,
                    object,
                    status: 500u16,
                }
                .fail();
            }

            let data = state
                .containers
                .get(container)
                .and_then(|objects| objects.get(object))
                .cloned()
                .ok_or_else(|| {
                    crate::error::ObjectNotFoundSnafu { container, object }.build()
                })?;

            (
                data,
                state.chunk_size,
                state.chunk_delay,
                state.interrupted_reads.contains(&key),
            )
        };

        let guard = InFlightGuard::new(self.inner.clone());

        let mut items = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk_size).min(data.len());
            items.push(Ok(data.slice(offset..end)));
            offset = end;
        }

        if interrupted {
            debug!(container, object, "Simulating an interrupted read");
            items.truncate(1);
            items.push(
                crate::error::ObjectReadInterruptedSnafu { container, object }.fail(),
            );
        }

        let stream = futures::stream::unfold(
            (items.into_iter(), guard, delay),
            |(mut items, guard, delay)| async move {
                let item = items.next()?;

                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }

                Some((item, (items, guard, delay)))
            },
        );

        Ok(Box::pin(stream))
    }
}

/// A destination store holding its buckets in memory.
///
/// Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct MemoryDestination {
    inner: Arc<MemoryDestinationInner>,
}

#[derive(Debug, Default)]
struct MemoryDestinationInner {
    buckets: Mutex<HashMap<String, MemoryBucket>>,
    failing_commits: Mutex<HashSet<(String, String)>>,
    failing_uploads: Mutex<HashSet<(String, String)>>,
    create_bucket_calls: AtomicUsize,
    aborted_uploads: AtomicUsize,
}

#[derive(Debug)]
struct MemoryBucket {
    descriptor: BucketDescriptor,
    objects: BTreeMap<String, Bytes>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bucket as it exists before a run
    pub fn insert_bucket(&self, descriptor: BucketDescriptor) {
        self.buckets().insert(
            descriptor.name.clone(),
            MemoryBucket {
                descriptor,
                objects: BTreeMap::new(),
            },
        );
    }

    pub fn bucket(&self, name: &str) -> Option<BucketDescriptor> {
        self.buckets()
            .get(name)
            .map(|bucket| bucket.descriptor.clone())
    }

    pub fn bucket_names(&self) -> Vec<String> {
        let mut names = self.buckets().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Make the commit of this object fail
    pub fn fail_commit(&self, bucket: impl Into<String>, key: impl Into<String>) {
        self.inner
            .failing_commits
            .lock()
            .expect("BUG: memory destination mutex poisoned")
            .insert((bucket.into(), key.into()));
    }

    /// Make the upload of this object fail before it reads any data, as if the connection to the
    /// destination was lost
    pub fn fail_upload(&self, bucket: impl Into<String>, key: impl Into<String>) {
        self.inner
            .failing_uploads
            .lock()
            .expect("BUG: memory destination mutex poisoned")
            .insert((bucket.into(), key.into()));
    }

    /// How many times `create_bucket` was called
    pub fn create_bucket_calls(&self) -> usize {
        self.inner.create_bucket_calls.load(Ordering::SeqCst)
    }

    /// How many uploads ended without being committed
    pub fn aborted_uploads(&self) -> usize {
        self.inner.aborted_uploads.load(Ordering::SeqCst)
    }

    /// The committed contents of an object
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.buckets()
            .get(bucket)
            .and_then(|bucket| bucket.objects.get(key).cloned())
    }

    /// The keys of every committed object in a bucket, in order
    pub fn object_keys(&self, bucket: &str) -> Vec<String> {
        self.buckets()
            .get(bucket)
            .map(|bucket| bucket.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn buckets(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryBucket>> {
        self.inner
            .buckets
            .lock()
            .expect("BUG: memory destination mutex poisoned")
    }
}

#[async_trait::async_trait]
impl DestinationStorage for MemoryDestination {
    async fn get_bucket(&self, name: &str) -> Result<Option<BucketDescriptor>> {
        Ok(self.bucket(name))
    }

    async fn create_bucket(&self, name: &str, policy: &BucketPolicy) -> Result<BucketDescriptor> {
        self.inner.create_bucket_calls.fetch_add(1, Ordering::SeqCst);

        let descriptor = BucketDescriptor::from_policy(name, policy);
        self.insert_bucket(descriptor.clone());

        Ok(descriptor)
    }

    async fn open_object_writer(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(DuplexStream, PendingObject)> {
        if !self.buckets().contains_key(bucket) {
            return crate::error::DestinationBucketMissingSnafu { bucket }.fail();
        }

        let me = self.clone();
        let bucket_name = bucket.to_string();
        let object_key = key.to_string();
        let upload_fails = self
            .inner
            .failing_uploads
            .lock()
            .expect("BUG: memory destination mutex poisoned")
            .contains(&(bucket_name.clone(), object_key.clone()));

        Ok(object_writer(
            bucket,
            key,
            move |mut reader, decision| async move {
                let (bucket, key) = (bucket_name, object_key);

                if upload_fails {
                    drop(reader);
                    me.inner.aborted_uploads.fetch_add(1, Ordering::SeqCst);
                    return crate::error::CommitRejectedSnafu { bucket, key }.fail();
                }

                let mut data = Vec::new();
                reader
                    .read_to_end(&mut data)
                    .await
                    .context(crate::error::ReadUploadStreamSnafu {
                        bucket: &bucket,
                        key: &key,
                    })?;

                match await_decision(decision).await {
                    UploadDecision::Abort => {
                        me.inner.aborted_uploads.fetch_add(1, Ordering::SeqCst);
                        Ok(0)
                    }
                    UploadDecision::Commit => {
                        let failing = me
                            .inner
                            .failing_commits
                            .lock()
                            .expect("BUG: memory destination mutex poisoned")
                            .contains(&(bucket.clone(), key.clone()));

                        if failing {
                            me.inner.aborted_uploads.fetch_add(1, Ordering::SeqCst);
                            return crate::error::CommitRejectedSnafu { bucket, key }.fail();
                        }

                        let len = data.len() as u64;
                        let mut buckets = me.buckets();
                        let target = buckets.get_mut(&bucket).ok_or_else(|| {
                            crate::error::DestinationBucketMissingSnafu {
                                bucket: bucket.clone(),
                            }
                            .build()
                        })?;
                        target.objects.insert(key, Bytes::from(data));

                        Ok(len)
                    }
                }
            },
        ))
    }
}
