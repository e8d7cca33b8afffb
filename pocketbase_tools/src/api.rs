use std::{
    collections::VecDeque,
    sync::{Arc, RwLock},
    time::Duration,
};

use cb_common::Secret;
use futures::{stream::BoxStream, StreamExt};
use log::*;
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Client,
    Method,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::{
    config::PocketBaseConfig,
    data_objects::{AuthResponse, CreateRecordResponse, ListRecordsResponse, RealtimeSubscriptions, SuperUserRecord},
    sse::{SseFrame, SseParser},
    PocketBaseApiError,
};

const AUTH_PATH: &str = "api/collections/_superusers/auth-with-password";
const AUTH_REFRESH_PATH: &str = "api/collections/_superusers/auth-refresh";
const REALTIME_PATH: &str = "api/realtime";
pub const PB_CONNECT: &str = "PB_CONNECT";

#[derive(Default)]
struct AuthState {
    token: Secret<String>,
    superuser: SuperUserRecord,
}

#[derive(Clone)]
pub struct PocketBaseApi {
    config: PocketBaseConfig,
    client: Client,
    auth: Arc<RwLock<AuthState>>,
}

impl PocketBaseApi {
    pub fn new(config: PocketBaseConfig) -> Result<Self, PocketBaseApiError> {
        let mut headers = HeaderMap::with_capacity(1);
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| PocketBaseApiError::Initialization(e.to_string()))?;
        Ok(Self { config, client, auth: Arc::new(RwLock::new(AuthState::default())) })
    }

    /// Creates the client and logs in as the configured superuser.
    pub async fn connect(config: PocketBaseConfig) -> Result<Self, PocketBaseApiError> {
        let api = Self::new(config)?;
        api.authenticate().await?;
        Ok(api)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.url)
    }

    pub fn config(&self) -> &PocketBaseConfig {
        &self.config
    }

    pub fn superuser(&self) -> SuperUserRecord {
        self.auth.read().map(|a| a.superuser.clone()).unwrap_or_default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.read().map(|a| !a.token.is_empty()).unwrap_or(false)
    }

    fn token(&self) -> Secret<String> {
        self.auth.read().map(|a| a.token.clone()).unwrap_or_default()
    }

    fn store_auth(&self, response: AuthResponse) -> Result<(), PocketBaseApiError> {
        if response.token.is_empty() {
            return Err(PocketBaseApiError::AuthError("PocketBase returned an empty token".into()));
        }
        let mut auth = self.auth.write().map_err(|e| PocketBaseApiError::AuthError(e.to_string()))?;
        auth.token = Secret::new(response.token);
        auth.superuser = response.record;
        Ok(())
    }

    /// Logs in with the superuser email and password.
    pub async fn authenticate(&self) -> Result<(), PocketBaseApiError> {
        let body = serde_json::json!({
            "identity": self.config.email,
            "password": self.config.password.reveal(),
        });
        debug!("🗄️ Authenticating with PocketBase as {}", self.config.email);
        let response = self
            .rest_query::<AuthResponse, Value>(Method::POST, AUTH_PATH, &[], Some(body))
            .await
            .map_err(|e| PocketBaseApiError::AuthError(e.to_string()))?;
        self.store_auth(response)?;
        info!("🗄️ Authenticated with PocketBase at {}", self.config.url);
        Ok(())
    }

    /// Exchanges the current token for a fresh one.
    pub async fn refresh_auth(&self) -> Result<(), PocketBaseApiError> {
        let response = self
            .rest_query::<AuthResponse, ()>(Method::POST, AUTH_REFRESH_PATH, &[], None)
            .await
            .map_err(|e| PocketBaseApiError::AuthError(e.to_string()))?;
        self.store_auth(response)?;
        debug!("🗄️ PocketBase token refreshed");
        Ok(())
    }

    /// Refreshes the token every `every`, falling back to a full login if the refresh is refused. Do not await the
    /// returned JoinHandle, as it will run until aborted.
    pub fn spawn_auth_refresh(&self, every: Duration) -> JoinHandle<()> {
        let api = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(every);
            timer.tick().await;
            loop {
                timer.tick().await;
                if let Err(e) = api.refresh_auth().await {
                    warn!("🗄️ Could not refresh the PocketBase token. {e}. Logging in again.");
                    if let Err(e) = api.authenticate().await {
                        error!("🗄️ Could not log in to PocketBase. {e}");
                    }
                }
            }
        })
    }

    pub async fn rest_query<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
        body: Option<B>,
    ) -> Result<T, PocketBaseApiError> {
        let url = self.url(path);
        trace!("🗄️ Sending REST query: {method} {url}");
        let mut req = self.client.request(method, url);
        let token = self.token();
        if !token.is_empty() {
            req = req.header("Authorization", token.reveal().as_str());
        }
        if !params.is_empty() {
            req = req.query(params);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let response = req.send().await.map_err(|e| PocketBaseApiError::RestRequestError(e.to_string()))?;
        if response.status().is_success() {
            trace!("🗄️ REST query successful. {}", response.status());
            let text = response.text().await.map_err(|e| PocketBaseApiError::RestResponseError(e.to_string()))?;
            // Some endpoints answer 204 with no body
            let text = if text.trim().is_empty() { "null" } else { text.as_str() };
            serde_json::from_str::<T>(text).map_err(|e| PocketBaseApiError::JsonError(e.to_string()))
        } else {
            let status = response.status().as_u16();
            let message =
                response.text().await.map_err(|e| PocketBaseApiError::RestResponseError(e.to_string()))?;
            Err(PocketBaseApiError::QueryError { status, message })
        }
    }

    /// Partially updates a record. Returns the updated record.
    pub async fn update_record(
        &self,
        collection: &str,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<Value, PocketBaseApiError> {
        let path = format!("api/collections/{collection}/records/{id}");
        self.rest_query::<Value, _>(Method::PATCH, &path, &[], Some(fields)).await
    }

    pub async fn create_record(
        &self,
        collection: &str,
        fields: &Map<String, Value>,
    ) -> Result<CreateRecordResponse, PocketBaseApiError> {
        let path = format!("api/collections/{collection}/records");
        self.rest_query::<CreateRecordResponse, _>(Method::POST, &path, &[], Some(fields)).await
    }

    pub async fn get_record<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<T, PocketBaseApiError> {
        let path = format!("api/collections/{collection}/records/{id}");
        self.rest_query::<T, ()>(Method::GET, &path, &[], None).await
    }

    /// Fetches one page of records matching `filter`. Pages start at 1.
    pub async fn list_records<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: &str,
        page: u32,
        per_page: u32,
    ) -> Result<ListRecordsResponse<T>, PocketBaseApiError> {
        let path = format!("api/collections/{collection}/records");
        let page = page.to_string();
        let per_page = per_page.to_string();
        let mut params = vec![("page", page.as_str()), ("perPage", per_page.as_str()), ("skipTotal", "false")];
        if !filter.is_empty() {
            params.push(("filter", filter));
        }
        self.rest_query::<ListRecordsResponse<T>, ()>(Method::GET, &path, &params, None).await
    }

    /// Fetches every record matching `filter`, walking all pages.
    pub async fn list_all_records<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: &str,
    ) -> Result<Vec<T>, PocketBaseApiError> {
        let mut result = Vec::new();
        let mut page = 1;
        loop {
            let list = self.list_records::<T>(collection, filter, page, self.config.page_size).await?;
            let last = list.is_last_page();
            trace!("🗄️ Fetched page {page}/{} of {collection} ({} items)", list.total_pages, list.items.len());
            result.extend(list.items);
            if last {
                break;
            }
            page += 1;
        }
        Ok(result)
    }

    /// Opens the realtime event stream. The first frame on the stream is `PB_CONNECT`, which carries the client id to
    /// pass to [`Self::realtime_subscribe`].
    pub async fn realtime_connect(&self) -> Result<RealtimeStream, PocketBaseApiError> {
        let token = self.token();
        let response = self
            .client
            .get(self.url(REALTIME_PATH))
            .header("Accept", "text/event-stream")
            .header("Authorization", token.reveal().as_str())
            .send()
            .await
            .map_err(|e| PocketBaseApiError::RealtimeError(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(PocketBaseApiError::QueryError { status, message });
        }
        debug!("🗄️ Realtime stream opened");
        let body = response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed();
        Ok(RealtimeStream { body, parser: SseParser::new(), pending: VecDeque::new() })
    }

    /// Sets the topics a realtime client is subscribed to.
    pub async fn realtime_subscribe(
        &self,
        client_id: &str,
        subscriptions: &[String],
    ) -> Result<(), PocketBaseApiError> {
        let body = RealtimeSubscriptions { client_id, subscriptions };
        self.rest_query::<Value, _>(Method::POST, REALTIME_PATH, &[], Some(body)).await?;
        debug!("🗄️ Realtime client {client_id} subscribed to {}", subscriptions.join(", "));
        Ok(())
    }
}

/// A live realtime connection.
pub struct RealtimeStream {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    parser: SseParser,
    pending: VecDeque<SseFrame>,
}

impl RealtimeStream {
    /// Waits for the next event. `None` means the server closed the stream.
    pub async fn next_frame(&mut self) -> Option<Result<SseFrame, PocketBaseApiError>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(Ok(frame));
            }
            match self.body.next().await? {
                Ok(chunk) => self.pending.extend(self.parser.feed(&chunk)),
                Err(e) => return Some(Err(PocketBaseApiError::RealtimeError(e.to_string()))),
            }
        }
    }
}
