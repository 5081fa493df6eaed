//! [`SourceStorage`] for OpenStack Swift compatible object stores, spoken to directly over HTTP.
use super::{AuthToken, ListingPage, ObjectByteStream, SourceStorage};
use crate::config::SecretString;
use crate::{Config, Result};
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{header::HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const CONTAINER_COUNT_HEADER: &str = "X-Account-Container-Count";
const OBJECT_COUNT_HEADER: &str = "X-Container-Object-Count";

/// Characters escaped in a single path segment, besides controls and non-ASCII.  Backslash is
/// escaped because URL parsing treats it as a separator.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Implementation of [`SourceStorage`] for a Swift account
#[derive(Clone)]
pub struct Swift {
    inner: Arc<SwiftInner>,
}

struct SwiftInner {
    client: reqwest::Client,

    /// The storage URL of the account, which container names are appended to
    account_url: Url,

    credentials: Credentials,
}

enum Credentials {
    /// A token issued out of band
    Token(SecretString),

    /// Keystone v2 password credentials, exchanged for a token on [`Swift::authenticate`]
    Password {
        identity_url: Url,
        username: String,
        password: SecretString,
        tenant_id: String,
    },
}

impl Swift {
    pub fn new(config: &Config) -> Result<Self> {
        let account_url = config
            .swift_account_url
            .clone()
            .context(crate::error::MissingConfigSnafu {
                setting: "swift_account_url",
            })?;

        ensure!(
            !account_url.cannot_be_a_base(),
            crate::error::InvalidAccountUrlSnafu { url: account_url }
        );

        let credentials = match &config.swift_auth_token {
            Some(token) => Credentials::Token(token.clone()),
            None => Credentials::Password {
                identity_url: config.swift_identity_url.clone().context(
                    crate::error::MissingConfigSnafu {
                        setting: "swift_identity_url",
                    },
                )?,
                username: config.swift_username.clone().context(
                    crate::error::MissingConfigSnafu {
                        setting: "swift_username",
                    },
                )?,
                password: config.swift_password.clone().context(
                    crate::error::MissingConfigSnafu {
                        setting: "swift_password",
                    },
                )?,
                tenant_id: config.swift_tenant_id.clone().context(
                    crate::error::MissingConfigSnafu {
                        setting: "swift_tenant_id",
                    },
                )?,
            },
        };

        let client = reqwest::Client::builder()
            .build()
            .context(crate::error::BuildHttpClientSnafu)?;

        Ok(Self {
            inner: Arc::new(SwiftInner {
                client,
                account_url,
                credentials,
            }),
        })
    }

    /// URL of a container, or of an object within it if `object` is given.
    ///
    /// Object names may contain `/`, which Swift treats as an ordinary character of the name, so
    /// each `/`-separated part is encoded as its own path segment.  URL parsing resolves `.` and
    /// `..` segments (even percent-encoded ones), so a name containing such a segment can't be
    /// requested as itself and fails with [`crate::ColdVaultError::UnaddressableName`].
    fn url_for(&self, container: &str, object: Option<&str>) -> Result<Url> {
        let mut path = self.inner.account_url.path().trim_end_matches('/').to_string();

        let name = object.unwrap_or(container);
        let segments = std::iter::once(container)
            .chain(object.into_iter().flat_map(|object| object.split('/')));
        for segment in segments {
            path.push('/');
            path.extend(utf8_percent_encode(segment, PATH_SEGMENT));
        }

        let mut url = self.inner.account_url.clone();
        url.set_path(&path);

        ensure!(
            url.path() == path,
            crate::error::UnaddressableNameSnafu { container, name }
        );

        Ok(url)
    }

    fn with_marker(mut url: Url, marker: Option<&str>) -> Url {
        if let Some(marker) = marker {
            url.query_pairs_mut().append_pair("marker", marker);
        }

        url
    }

    /// Split a plain-text listing body into names, one per line
    fn parse_listing(body: &str) -> Vec<String> {
        body.lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn declared_total(url: &Url, headers: &HeaderMap, header: &'static str) -> Result<usize> {
        headers
            .get(header)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<usize>().ok())
            .context(crate::error::MissingDeclaredTotalSnafu {
                url: url.clone(),
                header,
            })
    }
}

impl std::fmt::Debug for Swift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swift")
            .field("account_url", &self.inner.account_url)
            .field("client", &"<...>")
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    auth: TokenRequestAuth<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequestAuth<'a> {
    password_credentials: PasswordCredentials<'a>,
    tenant_id: &'a str,
}

#[derive(Serialize)]
struct PasswordCredentials<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access: TokenResponseAccess,
}

#[derive(Deserialize)]
struct TokenResponseAccess {
    token: TokenResponseToken,
}

#[derive(Deserialize)]
struct TokenResponseToken {
    id: String,
}

#[async_trait::async_trait]
impl SourceStorage for Swift {
    async fn authenticate(&self) -> Result<AuthToken> {
        match &self.inner.credentials {
            Credentials::Token(token) => {
                debug!("Using pre-issued Swift token");
                Ok(AuthToken::new(token.expose()))
            }
            Credentials::Password {
                identity_url,
                username,
                password,
                tenant_id,
            } => {
                let mut url = identity_url.clone();
                url.path_segments_mut()
                    .map_err(|_| {
                        crate::error::InvalidAccountUrlSnafu {
                            url: identity_url.clone(),
                        }
                        .build()
                    })?
                    .pop_if_empty()
                    .push("tokens");

                debug!(%url, %username, %tenant_id, "Requesting token from identity service");

                let request = TokenRequest {
                    auth: TokenRequestAuth {
                        password_credentials: PasswordCredentials {
                            username,
                            password: password.expose(),
                        },
                        tenant_id,
                    },
                };

                let response = self
                    .inner
                    .client
                    .post(url.clone())
                    .json(&request)
                    .send()
                    .await
                    .and_then(|response| response.error_for_status())
                    .with_context(|_| crate::error::AuthenticateSnafu { url: url.clone() })?
                    .json::<TokenResponse>()
                    .await
                    .with_context(|_| crate::error::AuthenticateSnafu { url: url.clone() })?;

                debug!("Obtained Swift token");

                Ok(AuthToken::new(response.access.token.id))
            }
        }
    }

    #[instrument(skip(self, token))]
    async fn list_container_page(
        &self,
        token: &AuthToken,
        marker: Option<&str>,
    ) -> Result<ListingPage> {
        let url = Self::with_marker(self.inner.account_url.clone(), marker);

        let response = self
            .inner
            .client
            .get(url.clone())
            .header(AUTH_TOKEN_HEADER, token.as_str())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .context(crate::error::ListContainersSnafu)?;

        let declared_total =
            Self::declared_total(&url, response.headers(), CONTAINER_COUNT_HEADER)?;
        let body = response
            .text()
            .await
            .context(crate::error::ListContainersSnafu)?;

        Ok(ListingPage {
            names: Self::parse_listing(&body),
            declared_total,
        })
    }

    #[instrument(skip(self, token))]
    async fn list_object_page(
        &self,
        token: &AuthToken,
        container: &str,
        marker: Option<&str>,
    ) -> Result<ListingPage> {
        let url = Self::with_marker(self.url_for(container, None)?, marker);

        let response = self
            .inner
            .client
            .get(url.clone())
            .header(AUTH_TOKEN_HEADER, token.as_str())
            .send()
            .await
            .context(crate::error::ListObjectsSnafu { container })?;

        ensure!(
            response.status() != StatusCode::NOT_FOUND,
            crate::error::ContainerNotFoundSnafu { container }
        );

        let response = response
            .error_for_status()
            .context(crate::error::ListObjectsSnafu { container })?;

        let declared_total = Self::declared_total(&url, response.headers(), OBJECT_COUNT_HEADER)?;
        let body = response
            .text()
            .await
            .context(crate::error::ListObjectsSnafu { container })?;

        Ok(ListingPage {
            names: Self::parse_listing(&body),
            declared_total,
        })
    }

    #[instrument(skip(self, token))]
    async fn fetch_object_stream(
        &self,
        token: &AuthToken,
        container: &str,
        object: &str,
    ) -> Result<ObjectByteStream> {
        let url = self.url_for(container, Some(object))?;

        let response = self
            .inner
            .client
            .get(url)
            .header(AUTH_TOKEN_HEADER, token.as_str())
            .send()
            .await
            .context(crate::error::FetchObjectSnafu { container, object })?;

        let status = response.status();
        ensure!(
            status != StatusCode::NOT_FOUND,
            crate::error::ObjectNotFoundSnafu { container, object }
        );
        ensure!(
            status.is_success(),
            crate::error::FetchObjectStatusSnafu {
                container,
                object,
                status: status.as_u16(),
            }
        );

        debug!(content_length = ?response.content_length(), "Reading object body");

        let container = container.to_string();
        let object = object.to_string();

        Ok(Box::pin(response.bytes_stream().map(move |chunk| {
            chunk.context(crate::error::ReadObjectSnafu {
                container: &container,
                object: &object,
            })
        })))
    }
}
