use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    ContentKey, ContentMetadata, ExternalError, ExternalResult,
    IdentityAttributes, IdentityService, LicenseRecord, ProductRecord,
    SourceSystem, SubscriptionRecord,
};

const SESSION_HEADER: &str = "X-Session-Token";

#[derive(Debug, Clone)]
pub struct HttpDirectoryConfig {
    pub identity_url: String,
    pub source_url: Option<String>,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

/// HTTP client for the identity service and the source system. The session
/// token is obtained on first use and shared by every later lookup.
pub struct HttpDirectory {
    client: Client,
    identity_url: Url,
    source_url: Option<Url>,
    username: String,
    password: String,
    token: Mutex<Option<String>>,
}

impl HttpDirectory {
    pub fn new(config: HttpDirectoryConfig) -> ExternalResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("ustat-etl/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()?;
        let identity_url = parse_base(&config.identity_url)?;
        let source_url = config
            .source_url
            .as_deref()
            .map(parse_base)
            .transpose()?;
        Ok(Self {
            client,
            identity_url,
            source_url,
            username: config.username,
            password: config.password,
            token: Mutex::new(None),
        })
    }

    async fn token(&self) -> ExternalResult<String> {
        let mut token = self.token.lock().await;
        if let Some(t) = token.as_ref() {
            return Ok(t.clone());
        }
        let url = join(&self.identity_url, &["session"])?;
        let response = self
            .client
            .post(url)
            .json(&LoginRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await?;
        let login: LoginResponse = handle_response(response).await?;
        info!("obtained identity service session");
        *token = Some(login.token.clone());
        Ok(login.token)
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        url: &Url,
    ) -> ExternalResult<T> {
        let token = self.token().await?;
        let response = self
            .client
            .get(url.clone())
            .header(SESSION_HEADER, token)
            .send()
            .await?;
        handle_response(response).await
    }

    /// GET with a single re-login when the service reports the session
    /// inactive.
    async fn get<T: DeserializeOwned>(&self, url: Url) -> ExternalResult<T> {
        match self.get_once(&url).await {
            Err(ExternalError::SessionInactive) => {
                debug!("identity service session inactive, logging in again");
                self.token.lock().await.take();
                self.get_once(&url).await
            }
            other => other,
        }
    }

    async fn entity<T: DeserializeOwned>(
        &self,
        segments: &[&str],
    ) -> ExternalResult<T> {
        let url = join(&self.identity_url, segments)?;
        self.get(url).await
    }
}

fn parse_base(raw: &str) -> ExternalResult<Url> {
    Url::parse(raw).map_err(|e| ExternalError::InvalidUrl(e.to_string()))
}

fn join(base: &Url, segments: &[&str]) -> ExternalResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ExternalError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn handle_response<T: DeserializeOwned>(
    response: Response,
) -> ExternalResult<T> {
    let status = response.status();
    if status.is_success() {
        let text = response.text().await?;
        return Ok(serde_json::from_str(&text)?);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(ExternalError::SessionInactive),
        StatusCode::NOT_FOUND => {
            Err(ExternalError::not_found(response.url().as_str()))
        }
        _ => {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(ExternalError::api_error(status.as_u16(), text))
        }
    }
}

#[async_trait]
impl IdentityService for HttpDirectory {
    async fn identity(&self, id: &str) -> ExternalResult<IdentityAttributes> {
        self.entity(&["identities", id]).await
    }

    async fn ancestor_paths(
        &self,
        id: &str,
    ) -> ExternalResult<Vec<Vec<String>>> {
        self.entity(&["identities", id, "paths"]).await
    }

    async fn descendants(&self, id: &str) -> ExternalResult<Vec<String>> {
        self.entity(&["identities", id, "descendants"]).await
    }

    async fn license(&self, id: &str) -> ExternalResult<LicenseRecord> {
        self.entity(&["licenses", id]).await
    }

    async fn subscription(
        &self,
        id: &str,
    ) -> ExternalResult<SubscriptionRecord> {
        self.entity(&["subscriptions", id]).await
    }

    async fn product(&self, id: &str) -> ExternalResult<ProductRecord> {
        self.entity(&["products", id]).await
    }
}

#[async_trait]
impl SourceSystem for HttpDirectory {
    async fn content(
        &self,
        key: &ContentKey,
    ) -> ExternalResult<Option<ContentMetadata>> {
        let Some(base) = &self.source_url else {
            return Ok(None);
        };
        let mut segments = vec!["content", key.publication.as_str()];
        segments.extend(
            [&key.volume, &key.issue, &key.article]
                .into_iter()
                .map_while(|p| p.as_deref()),
        );
        let url = join(base, &segments)?;
        match self.get(url).await {
            Ok(meta) => Ok(Some(meta)),
            Err(ExternalError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
