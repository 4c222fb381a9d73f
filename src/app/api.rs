//! HTTP client for the opportunity backend.
//!
//! Every request goes through [`ApiClient::send`], which attaches the bearer
//! token and applies the sign-out policy on `401` before any caller sees the
//! response.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use url::Url;

use super::session::SessionStore;
use super::types::{
    AppEvent, CrawlRequest, Opportunity, PageRequest, PageResult, PaginationMeta, SignOutReason,
};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{message}")]
    Server { status: u16, message: String },
    #[error("not authorized: {message}")]
    Unauthorized { message: String, locked: bool },
    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }
}

/// The `{ success, message }` wrapper every JSON endpoint shares.
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    locked: bool,
}

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    opportunities: Vec<Opportunity>,
    #[serde(default)]
    pagination: Option<PaginationMeta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub password_expired: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Serialize)]
struct Credentials<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct PasswordChange<'a> {
    old_password: &'a str,
    new_password: &'a str,
}

#[async_trait]
pub trait DashboardApi: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError>;

    async fn change_password(&self, old_password: &str, new_password: &str)
    -> Result<(), ApiError>;

    async fn fetch_page(&self, request: PageRequest) -> Result<PageResult, ApiError>;

    async fn run_crawler(&self, request: &CrawlRequest) -> Result<(), ApiError>;

    async fn export_opportunities(&self) -> Result<Vec<u8>, ApiError>;

    async fn health(&self) -> Result<HealthStatus, ApiError>;
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    session: Arc<SessionStore>,
    events: Option<UnboundedSender<AppEvent>>,
}

impl ApiClient {
    pub fn new(base_url: &str, session: Arc<SessionStore>) -> Result<Self, ApiError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("samdash/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url,
            session,
            events: None,
        })
    }

    /// Routes sign-out notices from the `401` policy into the UI loop.
    pub fn with_events(mut self, events: UnboundedSender<AppEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.session.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        self.send_with(builder, "session expired").await
    }

    /// `fallback` names the rejection when a `401` body carries no message.
    async fn send_with(
        &self,
        builder: RequestBuilder,
        fallback: &str,
    ) -> Result<Response, ApiError> {
        let response = builder.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let err = unauthorized(response, fallback).await;
            self.sign_out();
            return Err(err);
        }
        Ok(response)
    }

    fn sign_out(&self) {
        warn!("server rejected credentials; clearing session");
        if let Err(err) = self.session.clear() {
            warn!(error = %err, "failed to clear persisted session");
        }
        if let Some(events) = &self.events {
            let _ = events.send(AppEvent::SignedOut(SignOutReason::SessionExpired));
        }
    }
}

async fn unauthorized(response: Response, fallback: &str) -> ApiError {
    let body = response.bytes().await.unwrap_or_default();
    let envelope = serde_json::from_slice::<Envelope>(&body).unwrap_or_default();
    ApiError::Unauthorized {
        message: envelope.message.unwrap_or_else(|| fallback.to_string()),
        locked: envelope.locked,
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(server_error(status, &body));
    }
    Ok(serde_json::from_slice(&body)?)
}

fn server_error(status: StatusCode, body: &[u8]) -> ApiError {
    let message = serde_json::from_slice::<Envelope>(body)
        .ok()
        .and_then(|envelope| envelope.message)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string()
        });
    ApiError::Server {
        status: status.as_u16(),
        message,
    }
}

fn rejected(status: StatusCode, message: Option<String>) -> ApiError {
    ApiError::Server {
        status: status.as_u16(),
        message: message.unwrap_or_else(|| "request was not successful".to_string()),
    }
}

#[async_trait]
impl DashboardApi for ApiClient {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let url = self.endpoint("api/login")?;
        let builder = self.http.post(url).json(&Credentials { username, password });
        let response = self
            .send_with(builder, "invalid username or password")
            .await?;
        read_json(response).await
    }

    async fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), ApiError> {
        let url = self.endpoint("api/change-password")?;
        let response = self
            .send(self.authorized(self.http.post(url).json(&PasswordChange {
                old_password,
                new_password,
            })))
            .await?;
        let status = response.status();
        let envelope: Envelope = read_json(response).await?;
        if envelope.success {
            Ok(())
        } else {
            Err(rejected(status, envelope.message))
        }
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<PageResult, ApiError> {
        let url = self.endpoint("api/sam-opportunities")?;
        debug!(page = request.page, per_page = request.page_size.get(), "fetching page");
        let builder = self.http.get(url).query(&[
            ("page", request.page),
            ("per_page", request.page_size.get()),
        ]);
        let response = self.send(self.authorized(builder)).await?;
        let status = response.status();
        let listing: ListingResponse = read_json(response).await?;
        if !listing.success {
            return Err(rejected(status, listing.message));
        }
        Ok(PageResult::from_listing(
            listing.opportunities,
            listing.pagination,
            request,
        ))
    }

    async fn run_crawler(&self, request: &CrawlRequest) -> Result<(), ApiError> {
        let url = self.endpoint("api/run-crawler")?;
        let response = self
            .send(self.authorized(self.http.post(url).json(request)))
            .await?;
        let status = response.status();
        let envelope: Envelope = read_json(response).await?;
        if envelope.success {
            Ok(())
        } else {
            Err(rejected(status, envelope.message))
        }
    }

    async fn export_opportunities(&self) -> Result<Vec<u8>, ApiError> {
        let url = self.endpoint("api/export-opportunities")?;
        let response = self.send(self.authorized(self.http.get(url))).await?;
        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/json"));
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(server_error(status, &body));
        }
        if is_json {
            // A JSON body on this endpoint is always an error envelope.
            let envelope = serde_json::from_slice::<Envelope>(&body).unwrap_or_default();
            return Err(rejected(status, envelope.message));
        }
        if body.is_empty() {
            return Err(rejected(status, Some("export returned an empty file".to_string())));
        }
        Ok(body.to_vec())
    }

    async fn health(&self) -> Result<HealthStatus, ApiError> {
        let url = self.endpoint("api/health")?;
        let response = self.send(self.http.get(url)).await?;
        read_json(response).await
    }
}

#[cfg(test)]
pub mod testing {
    //! In-process stand-ins for the backend.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;

    /// Scripted [`DashboardApi`]; each queue is consumed front to back and the
    /// last entry repeats. Transport errors repeat as `Server` errors.
    #[derive(Default)]
    pub struct FakeApi {
        pub pages: Mutex<VecDeque<Result<PageResult, ApiError>>>,
        pub crawl: Mutex<VecDeque<Result<(), ApiError>>>,
        pub export: Mutex<VecDeque<Result<Vec<u8>, ApiError>>>,
        pub login: Mutex<VecDeque<Result<LoginResponse, ApiError>>>,
        pub page_calls: Mutex<Vec<(PageRequest, tokio::time::Instant)>>,
        pub crawl_calls: Mutex<Vec<CrawlRequest>>,
    }

    fn next<T>(
        queue: &Mutex<VecDeque<Result<T, ApiError>>>,
        fallback: impl FnOnce() -> Result<T, ApiError>,
    ) -> Result<T, ApiError>
    where
        T: Clone,
    {
        let mut queue = queue.lock().expect("fake api lock");
        match queue.len() {
            0 => fallback(),
            1 => clone_result(queue.front().expect("one entry")),
            _ => queue.pop_front().expect("entry"),
        }
    }

    fn clone_result<T: Clone>(result: &Result<T, ApiError>) -> Result<T, ApiError> {
        let err = match result {
            Ok(value) => return Ok(value.clone()),
            Err(err) => err,
        };
        Err(match err {
            ApiError::Validation(message) => ApiError::Validation(message.clone()),
            ApiError::Server { status, message } => ApiError::Server {
                status: *status,
                message: message.clone(),
            },
            ApiError::Unauthorized { message, locked } => ApiError::Unauthorized {
                message: message.clone(),
                locked: *locked,
            },
            other => ApiError::Server {
                status: 500,
                message: other.to_string(),
            },
        })
    }

    impl FakeApi {
        pub fn with_pages(pages: Vec<Result<PageResult, ApiError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                ..Self::default()
            }
        }

        pub fn page_call_count(&self) -> usize {
            self.page_calls.lock().expect("fake api lock").len()
        }
    }

    #[async_trait]
    impl DashboardApi for FakeApi {
        async fn login(&self, _username: &str, _password: &str) -> Result<LoginResponse, ApiError> {
            next(&self.login, || {
                Err(ApiError::Validation("no login scripted".to_string()))
            })
        }

        async fn change_password(&self, _old: &str, _new: &str) -> Result<(), ApiError> {
            Ok(())
        }

        async fn fetch_page(&self, request: PageRequest) -> Result<PageResult, ApiError> {
            self.page_calls
                .lock()
                .expect("fake api lock")
                .push((request, tokio::time::Instant::now()));
            next(&self.pages, || {
                Ok(PageResult {
                    opportunities: Vec::new(),
                    total_items: 0,
                    total_pages: 1,
                })
            })
        }

        async fn run_crawler(&self, request: &CrawlRequest) -> Result<(), ApiError> {
            self.crawl_calls
                .lock()
                .expect("fake api lock")
                .push(request.clone());
            next(&self.crawl, || Ok(()))
        }

        async fn export_opportunities(&self) -> Result<Vec<u8>, ApiError> {
            next(&self.export, || Ok(b"PK\x03\x04".to_vec()))
        }

        async fn health(&self) -> Result<HealthStatus, ApiError> {
            Ok(HealthStatus {
                status: "healthy".to_string(),
                version: None,
            })
        }
    }

    /// Serves one canned HTTP response per connection on loopback and hands
    /// back each raw request it received.
    pub async fn stub_server(
        responses: Vec<(u16, &'static str, Vec<u8>)>,
    ) -> (String, UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for (status, content_type, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut raw = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    raw.extend_from_slice(&buf[..n]);
                    if request_complete(&raw) {
                        break;
                    }
                }
                let _ = tx.send(String::from_utf8_lossy(&raw).into_owned());
                let head = format!(
                    "HTTP/1.1 {status} STUB\r\nContent-Type: {content_type}\r\n\
                    Content-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(&body).await;
                let _ = stream.shutdown().await;
            }
        });
        (format!("http://{addr}"), rx)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(split) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..split]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        raw.len() >= split + 4 + content_length
    }
}
