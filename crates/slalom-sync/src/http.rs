//! HTTP implementation of [`SyncApi`] over `reqwest`.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use slalom_core::RecordKind;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::api::{
    endpoint, DeleteBody, DeleteResponse, FetchQuery, FetchResponse, PostBody, PostResponse,
    SyncApi,
};
use crate::auth::AuthProvider;
use crate::config::CloudSettings;
use crate::error::{SyncError, SyncResult};

pub struct HttpSyncApi {
    base_url: Url,
    client: Client,
    auth: Arc<dyn AuthProvider>,
    timeout: Duration,
}

impl HttpSyncApi {
    pub fn new(settings: &CloudSettings, auth: Arc<dyn AuthProvider>) -> SyncResult<Self> {
        let mut base_url = Url::parse(&settings.api_url)?;
        // `join` replaces the last segment unless the base ends with a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let timeout = Duration::from_millis(settings.request_timeout_ms);
        let client = Client::builder().timeout(timeout).build()?;

        Ok(HttpSyncApi {
            base_url,
            client,
            auth,
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, kind: RecordKind, pairs: &[(&str, String)]) -> SyncResult<Url> {
        let mut url = self.base_url.join(endpoint(kind))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in pairs {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn authorized(&self, method: Method, url: Url) -> SyncResult<RequestBuilder> {
        let mut request = self.client.request(method, url);
        if let Some(token) = self.auth.authorization().await? {
            request = request.bearer_auth(token);
        }
        Ok(request)
    }

    async fn execute<R: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        race_id: &str,
    ) -> SyncResult<R> {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if let Some(err) = classify_status(status, &body, race_id) {
            debug!(status = status.as_u16(), error = %err, "Sync request failed");
            return Err(err);
        }

        serde_json::from_str(&body).map_err(|e| SyncError::Malformed(e.to_string()))
    }

    fn transport_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.timeout.as_millis() as u64)
        } else {
            SyncError::from(err)
        }
    }
}

/// Maps a non-success HTTP status to an error. Returns `None` for 2xx.
fn classify_status(status: StatusCode, body: &str, race_id: &str) -> Option<SyncError> {
    if status.is_success() {
        return None;
    }

    let json: Option<Value> = serde_json::from_str(body).ok();
    let flag = |name: &str| {
        json.as_ref()
            .and_then(|v| v.get(name))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    };
    let message = json
        .as_ref()
        .and_then(|v| v.get("error").or_else(|| v.get("message")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.chars().take(200).collect());

    let err = if status == StatusCode::UNAUTHORIZED {
        if flag("expired") {
            SyncError::AuthExpired
        } else {
            SyncError::Unauthorized
        }
    } else if flag("deleted") {
        SyncError::RaceDeleted(race_id.to_string())
    } else if status.is_server_error() {
        SyncError::Server {
            status: status.as_u16(),
            message,
        }
    } else {
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(race_id = %race_id, "Sync API is rate limiting this device");
        }
        SyncError::Rejected {
            status: status.as_u16(),
            message,
        }
    };
    Some(err)
}

#[async_trait]
impl SyncApi for HttpSyncApi {
    async fn fetch(&self, kind: RecordKind, query: &FetchQuery) -> SyncResult<FetchResponse> {
        let url = self.url(kind, &query.pairs())?;
        let request = self.authorized(Method::GET, url).await?;
        self.execute(request, &query.race_id).await
    }

    async fn post(
        &self,
        kind: RecordKind,
        race_id: &str,
        body: &PostBody,
    ) -> SyncResult<PostResponse> {
        let url = self.url(kind, &[("raceId", race_id.to_string())])?;
        let request = self.authorized(Method::POST, url).await?.json(body);
        self.execute(request, race_id).await
    }

    async fn delete(
        &self,
        kind: RecordKind,
        race_id: &str,
        body: &DeleteBody,
    ) -> SyncResult<DeleteResponse> {
        let url = self.url(kind, &[("raceId", race_id.to_string())])?;
        let request = self.authorized(Method::DELETE, url).await?.json(body);
        self.execute(request, race_id).await
    }
}
