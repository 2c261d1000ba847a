use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{StorageBackend, StorageError, StorageResult, remove_each, validate_segment};
use crate::config::SwiftConfig;

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// Token and object-store endpoint from a Keystone login.
#[derive(Debug, Clone)]
struct SwiftSession {
    token: String,
    endpoint: Url,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ContainerInfo {
    name: String,
    last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectInfo {
    name: String,
}

/// OpenStack Swift object store.
pub struct SwiftStorage {
    client: Client,
    config: SwiftConfig,
    session: RwLock<Option<SwiftSession>>,
}

impl SwiftStorage {
    /// Authenticate once up front so bad credentials fail at startup.
    pub async fn connect(config: SwiftConfig) -> StorageResult<Self> {
        let storage = Self {
            client: Client::builder().build()?,
            config,
            session: RwLock::new(None),
        };
        storage.session(true).await?;
        Ok(storage)
    }

    async fn session(&self, refresh: bool) -> StorageResult<SwiftSession> {
        if !refresh {
            if let Some(session) = self.session.read().await.as_ref() {
                return Ok(session.clone());
            }
        }
        let session = self.authenticate().await?;
        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    async fn authenticate(&self) -> StorageResult<SwiftSession> {
        let url = format!("{}/auth/tokens", self.config.auth_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&auth_request(&self.config))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::Auth(format!(
                "keystone returned {}",
                response.status()
            )));
        }
        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::Auth(format!("missing {SUBJECT_TOKEN_HEADER} header")))?;
        let body: TokenResponse = response.json().await?;
        let endpoint = object_store_endpoint(&body.token.catalog)?;
        debug!(endpoint = %endpoint, "authenticated against keystone");
        Ok(SwiftSession { token, endpoint })
    }

    /// Send a request built against the object-store endpoint, logging in
    /// again once if the token has expired.
    async fn send<F>(&self, build: F) -> StorageResult<Response>
    where
        F: Fn(&Client, &SwiftSession) -> StorageResult<RequestBuilder>,
    {
        let session = self.session(false).await?;
        let response = build(&self.client, &session)?
            .header(AUTH_TOKEN_HEADER, &session.token)
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let session = self.session(true).await?;
        Ok(build(&self.client, &session)?
            .header(AUTH_TOKEN_HEADER, &session.token)
            .send()
            .await?)
    }

    async fn list_json<T>(&self, segments: &[&str]) -> StorageResult<Vec<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self
            .send(|client, session| {
                let mut url = object_url(&session.endpoint, segments)?;
                url.query_pairs_mut().append_pair("format", "json");
                Ok(client.get(url))
            })
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let response = check_status(response)?;
        Ok(response.json().await?)
    }

    /// Delete every object of a container, then the container.
    async fn remove_container(&self, name: &str) -> StorageResult<()> {
        let objects: Vec<ObjectInfo> = self.list_json(&[name]).await?;
        for object in &objects {
            let mut segments = vec![name];
            segments.extend(object.name.split('/'));
            self.delete(&segments).await?;
        }
        self.delete(&[name]).await
    }

    async fn delete(&self, segments: &[&str]) -> StorageResult<()> {
        let response = self
            .send(|client, session| {
                Ok(client.request(Method::DELETE, object_url(&session.endpoint, segments)?))
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response)?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SwiftStorage {
    async fn upload(&self, namespace: &str, path: &str, data: Vec<u8>) -> StorageResult<String> {
        validate_segment("namespace", namespace)?;
        validate_segment("path", path)?;

        let response = self
            .send(|client, session| Ok(client.put(object_url(&session.endpoint, &[namespace])?)))
            .await?;
        check_status(response)?;

        let mut segments = vec![namespace];
        segments.extend(path.split('/'));
        let response = self
            .send(|client, session| {
                Ok(client
                    .put(object_url(&session.endpoint, &segments)?)
                    .body(data.clone()))
            })
            .await?;
        let url = check_status(response)?.url().to_string();
        debug!(url = %url, "uploaded artifact");
        Ok(url)
    }

    async fn remove_older_than(&self, age: Duration) -> StorageResult<Vec<String>> {
        let now = Utc::now();
        let containers: Vec<ContainerInfo> = self.list_json(&[]).await?;
        let mut expired = Vec::new();
        for container in containers {
            let Some(raw) = container.last_modified.as_deref() else {
                warn!(namespace = %container.name, "container has no last_modified; skipping");
                continue;
            };
            let last_modified = match parse_last_modified(&container.name, raw) {
                Ok(last_modified) => last_modified,
                Err(err) => {
                    warn!(error = %err, "skipping container");
                    continue;
                }
            };
            let elapsed = (now - last_modified).to_std().unwrap_or_default();
            if elapsed > age {
                info!(namespace = %container.name, age_secs = elapsed.as_secs(), "removing expired container");
                expired.push(container.name);
            }
        }

        Ok(remove_each(expired, |name| async move { self.remove_container(&name).await }).await)
    }
}

fn auth_request(config: &SwiftConfig) -> serde_json::Value {
    json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": config.user,
                        "domain": { "name": config.domain },
                        "password": config.api_key,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": config.tenant,
                    "domain": { "name": config.domain },
                }
            }
        }
    })
}

fn object_store_endpoint(catalog: &[CatalogEntry]) -> StorageResult<Url> {
    let url = catalog
        .iter()
        .filter(|entry| entry.kind == "object-store")
        .flat_map(|entry| entry.endpoints.iter())
        .find(|endpoint| endpoint.interface == "public")
        .map(|endpoint| endpoint.url.as_str())
        .ok_or_else(|| StorageError::Auth("no public object-store endpoint in catalog".into()))?;
    Url::parse(url).map_err(|err| StorageError::Auth(format!("bad endpoint {url}: {err}")))
}

fn object_url(endpoint: &Url, segments: &[&str]) -> StorageResult<Url> {
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .map_err(|_| StorageError::InvalidPath(endpoint.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn check_status(response: Response) -> StorageResult<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(StorageError::Status {
            url: response.url().to_string(),
            status: response.status().as_u16(),
        })
    }
}

/// Swift reports container times as naive UTC, e.g. `2025-04-08T11:09:15.123450`.
fn parse_last_modified(namespace: &str, value: &str) -> StorageResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| StorageError::Timestamp {
            namespace: namespace.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn config() -> SwiftConfig {
        SwiftConfig {
            user: "vmtest".to_string(),
            api_key: "secret".to_string(),
            auth_url: "https://keystone.example.com/v3".to_string(),
            domain: "Default".to_string(),
            tenant: "qa".to_string(),
        }
    }

    #[test]
    fn auth_request_scopes_to_tenant() {
        let body = auth_request(&config());
        assert_eq!(
            body["auth"]["identity"]["password"]["user"]["name"],
            "vmtest"
        );
        assert_eq!(
            body["auth"]["identity"]["password"]["user"]["password"],
            "secret"
        );
        assert_eq!(body["auth"]["scope"]["project"]["name"], "qa");
        assert_eq!(body["auth"]["scope"]["project"]["domain"]["name"], "Default");
    }

    #[test]
    fn catalog_picks_public_object_store() {
        let response: TokenResponse = serde_json::from_value(json!({
            "token": {
                "catalog": [
                    {
                        "type": "identity",
                        "endpoints": [{ "interface": "public", "url": "https://keystone" }]
                    },
                    {
                        "type": "object-store",
                        "endpoints": [
                            { "interface": "internal", "url": "http://10.0.0.1/v1/AUTH_x" },
                            { "interface": "public", "url": "https://swift.example.com/v1/AUTH_x" }
                        ]
                    }
                ]
            }
        }))
        .expect("parse token");

        let endpoint = object_store_endpoint(&response.token.catalog).expect("endpoint");
        assert_eq!(endpoint.as_str(), "https://swift.example.com/v1/AUTH_x");
    }

    #[test]
    fn catalog_without_object_store_is_an_auth_error() {
        let err = object_store_endpoint(&[]).unwrap_err();
        assert!(matches!(err, StorageError::Auth(_)));
    }

    #[test]
    fn object_url_encodes_segments() {
        let endpoint = Url::parse("https://swift.example.com/v1/AUTH_x/").expect("url");
        let url = object_url(&endpoint, &["job", "a b.tar.gz"]).expect("object url");
        assert_eq!(
            url.as_str(),
            "https://swift.example.com/v1/AUTH_x/job/a%20b.tar.gz"
        );
    }

    #[test]
    fn last_modified_parses_fractional_seconds() {
        let parsed = parse_last_modified("job", "2025-04-08T11:09:15.123450").expect("parse");
        assert_eq!(
            parsed.timestamp(),
            Utc.with_ymd_and_hms(2025, 4, 8, 11, 9, 15).unwrap().timestamp()
        );
        assert!(parse_last_modified("job", "Tue, 08 Apr 2025 11:09:15 GMT").is_err());
    }
}
