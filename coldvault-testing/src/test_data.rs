//! Generate test objects, and verify what a backup run left at the destination
use crate::Result;
use bytes::Bytes;
use color_eyre::eyre::eyre;
use futures::StreamExt;
use rand::prelude::*;
use sha2::Digest;
use std::{
    collections::{HashMap, HashSet},
    io::Read,
};

/// Max concurrent S3 operations when validating test data
const MAX_CONCURRENCY: usize = 10;

#[derive(Clone, Debug)]
pub struct TestObject {
    pub name: String,
    pub size: usize,
}

impl TestObject {
    /// Make a new test object spec with the size specified as a string so we can use
    /// human-friendly units like "10 KB" or "20 MiB"
    pub fn new(name: impl Into<String>, size: impl AsRef<str>) -> Self {
        let name = name.into();

        let size = byte_unit::Byte::from_str(size).unwrap();

        Self {
            name,
            size: size.get_bytes() as usize,
        }
    }
}

/// The same test object as in [`TestObject`], but with the data that the object holds in the
/// source store
#[derive(Clone, Debug)]
pub struct TestObjectWithData {
    pub name: String,
    pub data: Bytes,
    pub hash: [u8; 32],
}

/// Generate random contents for each of the test objects.
///
/// The key to the resulting hash table is the object name.  Half of every object is random data
/// and the other half is repetitive, so that compression visibly shrinks it but can't make it
/// disappear entirely.
pub fn make_test_data(
    objects: impl IntoIterator<Item = TestObject>,
) -> HashMap<String, TestObjectWithData> {
    let mut rand = rand::thread_rng();
    let mut test_objects = HashMap::new();

    for object in objects {
        let mut data = vec![0u8; object.size];
        let random_len = object.size / 2;
        rand.fill(&mut data[..random_len]);
        for (index, byte) in data[random_len..].iter_mut().enumerate() {
            *byte = (index % 16) as u8;
        }

        let object = TestObjectWithData {
            hash: sha256(&data),
            name: object.name,
            data: Bytes::from(data),
        };

        assert!(
            test_objects
                .insert(object.name.clone(), object.clone())
                .is_none(),
            "BUG: test data contains the same name '{}' more than once",
            object.name
        );
    }

    test_objects
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());

    hash
}

/// Decompress a gzip stream in full
pub fn gunzip(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(compressed);
    let mut data = Vec::new();
    decoder.read_to_end(&mut data)?;

    Ok(data)
}

/// Validate that the objects stored at the destination are exactly the expected test objects,
/// each one gzip-compressed.
///
/// `stored` is every key present at the destination with its stored (compressed) contents.
#[track_caller]
pub fn validate_backed_up_objects<'a>(
    test_data: &HashMap<String, TestObjectWithData>,
    stored: impl IntoIterator<Item = (String, Bytes)>,
    expected_names: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let mut expected_names = expected_names.into_iter().collect::<HashSet<_>>();

    for (key, compressed) in stored {
        assert!(
            expected_names.remove(key.as_str()),
            "Destination contains object '{key}' which is not among the expected test data"
        );

        let test_object = test_data.get(&key).unwrap_or_else(|| {
            panic!("BUG: test expects object '{key}' but the `test_data` collection doesn't have such an entry")
        });

        let data = gunzip(&compressed)
            .map_err(|e| eyre!("Object '{key}' is not a valid gzip stream: {e}"))?;

        assert_eq!(
            test_object.hash,
            sha256(&data),
            "Object '{key}' doesn't decompress to the source data"
        );
    }

    if !expected_names.is_empty() {
        let mut missing = expected_names.into_iter().collect::<Vec<_>>();
        missing.sort_unstable();

        panic!(
            "One or more test data objects were not found at the destination: {}",
            missing.join(",")
        )
    }

    Ok(())
}

/// Download every object in an S3 bucket, for validation with [`validate_backed_up_objects`]
pub async fn read_bucket_objects(
    client: &aws_sdk_s3::Client,
    bucket: &str,
) -> Result<Vec<(String, Bytes)>> {
    let mut keys = Vec::new();

    let mut pages = client
        .list_objects_v2()
        .bucket(bucket)
        .into_paginator()
        .send();

    while let Some(page) = pages.next().await {
        for object in page?.contents.unwrap_or_default() {
            keys.push(
                object
                    .key
                    .ok_or_else(|| eyre!("Listed object in '{bucket}' has no key"))?,
            );
        }
    }

    let downloads = keys.into_iter().map(|key| async move {
        let response = client.get_object().bucket(bucket).key(&key).send().await?;
        let body = response.body.collect().await?.into_bytes();

        Result::<_>::Ok((key, body))
    });

    futures::stream::iter(downloads)
        .buffer_unordered(MAX_CONCURRENCY)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect()
}
