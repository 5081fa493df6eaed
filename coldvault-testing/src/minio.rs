//! Wrapper around the `minio` server binary to run ephemeral instances of S3-compatible object
//! storage for testing the destination side of a backup

use crate::Result;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::config::Credentials;
use color_eyre::eyre::eyre;
use duct::Handle;
use once_cell::sync::Lazy;
use rand::prelude::*;
use regex::Regex;
use std::{
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::debug;
use which::which;

/// Access key and secret key of a freshly started minio server
pub const MINIO_CREDENTIALS: (&str, &str) = ("minioadmin", "minioadmin");

pub struct MinioServer {
    #[allow(dead_code)] // Never used, but needs to stay in scope so the temp dir isn't deleted
    temp_dir: TempDir,
    handle: Handle,
    endpoint: SocketAddr,
}

impl MinioServer {
    /// Re-use the instance other tests are using if there is one, otherwise start a new one.
    pub async fn get() -> Result<Arc<Self>> {
        // The lock is held across await points so this needs a tokio Mutex
        static INSTANCE: Lazy<Mutex<Option<Weak<MinioServer>>>> = Lazy::new(|| Mutex::new(None));

        let mut instance = INSTANCE.lock().await;

        let server = match instance.as_ref().and_then(Weak::upgrade) {
            Some(strong) => strong,
            None => {
                let strong = Arc::new(Self::start().await?);
                *instance = Some(Arc::downgrade(&strong));

                strong
            }
        };

        debug!(endpoint = %server.endpoint, "get() found minio server");

        server.wait_for_service_start().await?;

        Ok(server)
    }

    /// Start a new minio server on a random high port.
    ///
    /// First the env var `MINIO_PATH` is checked, and if that's not set then it's assumed that
    /// `minio` is in your path.  If that doesn't work then this will fail.
    pub async fn start() -> Result<Self> {
        let path = Self::find_minio()?;

        let endpoint = Self::random_endpoint()?;

        let temp_dir = Self::temp_data_dir()?;

        let handle = duct::cmd!(
            path,
            "server",
            temp_dir.path(),
            "--address",
            endpoint.to_string(),
            "--quiet"
        )
        .start()?;

        let minio_server = Self {
            temp_dir,
            handle,
            endpoint,
        };

        debug!(endpoint = %minio_server.endpoint, "Waiting for minio service to start");

        minio_server.wait_for_service_start().await?;

        debug!(endpoint = %minio_server.endpoint, "Minio started");

        Ok(minio_server)
    }

    /// The S3 API endpoint URL where the server is listening
    pub fn endpoint_url(&self) -> url::Url {
        format!("http://{}/", self.endpoint)
            .parse()
            .expect("BUG: socket address is a valid URL host")
    }

    /// Get [`aws_sdk_s3::Client`] instance that is configured to use this Minio server instance
    pub async fn aws_client(&self) -> Result<aws_sdk_s3::Client> {
        let (access_key, secret_key) = MINIO_CREDENTIALS;
        let region_provider = RegionProviderChain::first_try("us-east-1");
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(region_provider)
            .credentials_provider(Credentials::from_keys(access_key, secret_key, None))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .endpoint_url(self.endpoint_url().to_string())
            .force_path_style(true)
            .build();

        Ok(aws_sdk_s3::Client::from_conf(s3_config))
    }

    /// Generate a bucket-safe container name with a random prefix.
    ///
    /// Backups create their own buckets named after the source container, and many tests share
    /// the same minio server, so container names used against minio need to be unique.
    pub fn unique_container_name(name: impl AsRef<str>) -> String {
        static REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9a-z\-]+").unwrap());

        let name = name.as_ref().to_lowercase();
        let name = REGEX.replace_all(&name, "-");

        // Leave room for the random prefix and a `-YYYY-MM-DD` suffix
        let name = &name[..name.len().min(63 - 9 - 11)];

        format!("{:08x}-{name}", rand::thread_rng().next_u32())
    }

    /// Wait until the bucket can be seen by a `HeadBucket` request.
    ///
    /// Freshly created buckets are sometimes not immediately accessible.
    pub async fn wait_for_bucket(&self, bucket: &str) -> Result<()> {
        let policy = again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1));

        let client = self.aws_client().await?;

        policy
            .retry(|| client.head_bucket().bucket(bucket).send())
            .await
            .map_err(|e| eyre!("The bucket {bucket} is not accessible.  Last error was: \n{e}"))?;

        Ok(())
    }

    /// Block until able to successfully connect to the minio server or a timeout ocurrs
    async fn wait_for_service_start(&self) -> Result<()> {
        // On slow CI boxes startup can be agonizingly long
        let policy = again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1));

        let client = self.aws_client().await?;

        policy.retry(|| client.list_buckets().send()).await.map_err(|e| {
            eyre!("The minio server didn't come online in the allowed time.  The last error reported by ListBuckets against the server was:\n{e}")
        })?;

        Ok(())
    }

    fn find_minio() -> Result<PathBuf> {
        std::env::var_os("MINIO_PATH").map(PathBuf::from)
            .or_else(|| which("minio").ok())
            .ok_or_else(|| eyre!("Unable to find `minio`, either set the MINIO_PATH env var or put place the Minio executable in your PATH"))
    }

    /// Find a socket address on localhost that is free for minio to listen on
    fn random_endpoint() -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        Ok(addr)
    }

    /// Get a temporary directory for Minio data.
    ///
    /// Minio can't use a data directory on `tmpfs` (like `/tmp` on most Linux distros) because it
    /// requires `O_DIRECT`, so the directory is made in your home directory instead.
    fn temp_data_dir() -> Result<TempDir> {
        let home = dirs::home_dir().ok_or_else(|| eyre!("Unable to determine home directory"))?;

        Ok(tempfile::Builder::new()
            .prefix("coldvault-minio-")
            .tempdir_in(home)?)
    }
}

impl Drop for MinioServer {
    fn drop(&mut self) {
        debug!(pids = ?self.handle.pids(), "Killing minio process(es)");

        if let Err(e) = self.handle.kill() {
            eprintln!("Error killing minio process: {}", e);
        }
    }
}
