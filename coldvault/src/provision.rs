//! Idempotent provisioning of destination buckets.
//!
//! Each source container is backed up into its own destination bucket.  The first run creates the
//! bucket with the backup policy; every later run only checks that the bucket still matches the
//! policy.  A bucket that doesn't match is never reconfigured, because it may already hold backup
//! data that a changed lifecycle rule or storage class would put at risk.
use crate::objstore::DestinationStorage;
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use snafu::prelude::*;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

/// The configuration a destination bucket must have
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketPolicy {
    /// The cold storage class backed up objects are stored in
    pub storage_class: String,

    /// The region the bucket is created in
    pub region: String,

    /// Whether object versioning must be enabled
    pub versioning_enabled: bool,

    /// Objects are deleted this many days after they are written
    pub retention_days: u32,
}

/// The actual configuration of an existing destination bucket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketDescriptor {
    pub name: String,
    pub storage_class: String,
    pub region: String,
    pub versioning_enabled: bool,

    /// The expiration of the retention lifecycle rule, if the bucket has one
    pub retention_days: Option<u32>,
}

impl BucketDescriptor {
    /// The descriptor of a bucket created from `policy`
    pub fn from_policy(name: impl Into<String>, policy: &BucketPolicy) -> Self {
        Self {
            name: name.into(),
            storage_class: policy.storage_class.clone(),
            region: policy.region.clone(),
            versioning_enabled: policy.versioning_enabled,
            retention_days: Some(policy.retention_days),
        }
    }
}

/// Whether [`ensure_bucket`] had to create the bucket
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provisioned {
    Created,
    Validated,
}

/// Make sure the bucket `name` exists and is configured according to `policy`.
///
/// A missing bucket is created.  An existing bucket is checked: a storage class or versioning
/// setting that differs from the policy fails with [`crate::ColdVaultError::ConfigMismatch`] and
/// the bucket is left untouched.  Region and retention differences are only logged.
#[instrument(skip(destination, policy))]
pub async fn ensure_bucket(
    destination: &dyn DestinationStorage,
    name: &str,
    policy: &BucketPolicy,
) -> Result<(BucketDescriptor, Provisioned)> {
    match destination.get_bucket(name).await? {
        None => {
            debug!(bucket = name, ?policy, "Bucket does not exist; creating it");

            let descriptor = destination.create_bucket(name, policy).await?;

            info!(bucket = name, storage_class = %descriptor.storage_class, region = %descriptor.region, "Created bucket");

            Ok((descriptor, Provisioned::Created))
        }
        Some(descriptor) => {
            debug!(bucket = name, ?descriptor, "Bucket exists; validating policy");

            validate(&descriptor, policy)?;

            Ok((descriptor, Provisioned::Validated))
        }
    }
}

fn validate(descriptor: &BucketDescriptor, policy: &BucketPolicy) -> Result<()> {
    ensure!(
        descriptor.storage_class.eq_ignore_ascii_case(&policy.storage_class),
        crate::error::ConfigMismatchSnafu {
            bucket: &descriptor.name,
            setting: "storage class",
            expected: &policy.storage_class,
            actual: &descriptor.storage_class,
        }
    );

    ensure!(
        descriptor.versioning_enabled == policy.versioning_enabled,
        crate::error::ConfigMismatchSnafu {
            bucket: &descriptor.name,
            setting: "versioning",
            expected: versioning_label(policy.versioning_enabled),
            actual: versioning_label(descriptor.versioning_enabled),
        }
    );

    if descriptor.region != policy.region {
        warn!(bucket = %descriptor.name, expected = %policy.region, actual = %descriptor.region,
            "Existing bucket is in a different region than the backup policy specifies");
    }

    if descriptor.retention_days != Some(policy.retention_days) {
        warn!(bucket = %descriptor.name, expected = policy.retention_days, actual = ?descriptor.retention_days,
            "Existing bucket has a different retention rule than the backup policy specifies");
    }

    Ok(())
}

fn versioning_label(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

/// Derive the destination bucket name for a container from the configured template.
///
/// `{container}` and `{date}` in the template are substituted, then the result is normalized to
/// the S3 bucket naming rules: lowercase letters, digits, `.` and `-`, starting and ending with a
/// letter or digit, 3 to 63 characters.
pub fn bucket_name_for(template: &str, container: &str, date: chrono::NaiveDate) -> Result<String> {
    static INVALID_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9a-z.\-]+").unwrap());
    static REPEATED_DOTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.{2,}").unwrap());

    let raw = template
        .replace("{container}", container)
        .replace("{date}", &date.format("%Y-%m-%d").to_string());

    let lowercase = raw.to_lowercase();
    let name = INVALID_CHARS.replace_all(&lowercase, "-");
    let name = REPEATED_DOTS.replace_all(&name, ".");
    let name = name.trim_matches(|c: char| c == '-' || c == '.');

    ensure!(
        (3..=63).contains(&name.len()),
        crate::error::InvalidBucketNameSnafu {
            container,
            bucket: name,
        }
    );

    Ok(name.to_string())
}

/// Derive the destination bucket of every container, in order.
///
/// Normalization folds case and punctuation, so distinct containers such as `Photos` and
/// `photos` can map to the same bucket.  Their objects would overwrite each other, so that fails
/// with [`crate::ColdVaultError::BucketNameCollision`].
pub fn bucket_names_for<'a>(
    template: &str,
    containers: impl IntoIterator<Item = &'a str>,
    date: chrono::NaiveDate,
) -> Result<Vec<String>> {
    let mut owners: HashMap<String, &'a str> = HashMap::new();
    let mut buckets = Vec::new();

    for container in containers {
        let bucket = bucket_name_for(template, container, date)?;

        if let Some(first) = owners.insert(bucket.clone(), container) {
            return crate::error::BucketNameCollisionSnafu {
                bucket,
                first,
                second: container,
            }
            .fail();
        }

        buckets.push(bucket);
    }

    Ok(buckets)
}
