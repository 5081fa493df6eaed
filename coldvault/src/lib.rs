#![doc = include_str!("../README.md")]

mod backup;
mod config;
mod error;
mod failures;
mod lister;
mod notify;
pub mod objstore;
mod pipeline;
mod progress;
mod provision;
mod relay;
mod writers;

pub use backup::*;
pub use config::{Config, SecretString};
pub use error::{ColdVaultError, ErrorKind, Result};
pub use failures::TransferFailures;
pub use lister::{list_all_containers, list_all_objects, Listing};
pub use notify::{sign, DisabledNotifier, Notifier, TraqWebhook};
pub use pipeline::{ContainerTransfer, TransferOutcome, TransferPipeline, TransferStats};
pub use progress::*;
pub use provision::{
    bucket_name_for, bucket_names_for, ensure_bucket, BucketDescriptor, BucketPolicy, Provisioned,
};
pub use writers::{PendingObject, UploadDecision};
