//! Delivery of the end-of-run summary to a chat webhook.
use crate::config::SecretString;
use crate::{Config, Result};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use snafu::prelude::*;
use tracing::{debug, info, instrument};
use url::Url;

type HmacSha1 = Hmac<Sha1>;

/// Header carrying the body signature which traQ uses to authenticate webhook posts
const SIGNATURE_HEADER: &str = "X-TRAQ-Signature";

/// Something the summary of a run can be posted to
#[async_trait::async_trait]
pub trait Notifier: dyn_clone::DynClone + std::fmt::Debug + Sync + Send + 'static {
    async fn post_message(&self, text: &str) -> Result<()>;
}

dyn_clone::clone_trait_object!(Notifier);

/// Notifier used when no webhook is configured.  Messages are only logged.
#[derive(Clone, Debug, Default)]
pub struct DisabledNotifier;

#[async_trait::async_trait]
impl Notifier for DisabledNotifier {
    async fn post_message(&self, text: &str) -> Result<()> {
        info!(
            message_len = text.len(),
            "No webhook is configured; the run summary will not be posted"
        );

        Ok(())
    }
}

/// Posts messages to a traQ incoming webhook, signed with the webhook secret
#[derive(Clone, Debug)]
pub struct TraqWebhook {
    client: reqwest::Client,
    url: Url,
    secret: SecretString,
}

impl TraqWebhook {
    pub fn new(base_url: &Url, webhook_id: &str, secret: SecretString) -> Result<Self> {
        let mut url = base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                crate::error::InvalidAccountUrlSnafu {
                    url: base_url.clone(),
                }
                .build()
            })?
            .pop_if_empty()
            .extend(["api", "v3", "webhooks", webhook_id]);

        let client = reqwest::Client::builder()
            .build()
            .context(crate::error::BuildHttpClientSnafu)?;

        Ok(Self {
            client,
            url,
            secret,
        })
    }

    /// The notifier the config describes: a [`TraqWebhook`] if both the webhook ID and secret are
    /// set, otherwise a [`DisabledNotifier`]
    pub fn from_config(config: &Config) -> Result<Box<dyn Notifier>> {
        match (&config.webhook_id, &config.webhook_secret) {
            (Some(id), Some(secret)) => Ok(Box::new(Self::new(
                &config.webhook_base_url,
                id,
                secret.clone(),
            )?)),
            _ => {
                debug!("Webhook ID or secret not configured; notifications disabled");
                Ok(Box::new(DisabledNotifier))
            }
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait::async_trait]
impl Notifier for TraqWebhook {
    #[instrument(skip(self, text), fields(url = %self.url))]
    async fn post_message(&self, text: &str) -> Result<()> {
        let signature = sign(self.secret.expose(), text);

        let response = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(SIGNATURE_HEADER, signature)
            .body(text.to_string())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .with_context(|_| crate::error::NotifySnafu {
                url: self.url.clone(),
            })?;

        info!(status = %response.status(), "Posted run summary to webhook");

        Ok(())
    }
}

/// Lowercase hex of the HMAC-SHA1 of `body` keyed with `secret`
pub fn sign(secret: &str, body: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .expect("BUG: HMAC accepts keys of any length");
    mac.update(body.as_bytes());

    hex::encode(mac.finalize().into_bytes())
}
