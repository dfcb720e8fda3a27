use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::db::to_epoch_ms;
use crate::models::Session;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Classified upload failures. The pipeline's retry policy hangs off this:
/// `Unauthorized` stops the periodic timer, everything transient waits for
/// the next scheduled cycle.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("collector rejected the credential (401)")]
    Unauthorized,
    #[error("collector rejected the payload (400): {0}")]
    BadRequest(String),
    #[error("batch exceeds the collector's limit (413)")]
    BatchTooLarge,
    #[error("collector failure ({0})")]
    Server(u16),
    #[error("unexpected collector response: {0}")]
    InvalidResponse(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Per-batch acceptance receipt from the collector.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SyncAck {
    pub accepted: u64,
    pub sync_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct SyncEnvelope<'a> {
    sessions: Vec<SessionPayload<'a>>,
}

/// Wire view of a finalized session. `end_time` is derivable from
/// `start_time + duration` and intentionally never sent.
#[derive(Serialize)]
struct SessionPayload<'a> {
    id: &'a str,
    app_name: &'a str,
    window_title: &'a str,
    url: Option<&'a str>,
    start_time: i64,
    duration: i64,
    bundle_id: Option<&'a str>,
    tab_title: Option<&'a str>,
    tab_count: Option<u32>,
    document_path: Option<&'a str>,
    is_full_screen: bool,
    is_minimized: bool,
}

impl<'a> From<&'a Session> for SessionPayload<'a> {
    fn from(session: &'a Session) -> Self {
        let browser = session.browser.as_ref();
        Self {
            id: &session.id,
            app_name: &session.app_name,
            window_title: &session.window_title,
            url: browser.map(|b| b.url.as_str()),
            start_time: to_epoch_ms(session.start_time),
            duration: session.duration_ms,
            bundle_id: session.bundle_id.as_deref(),
            tab_title: browser.and_then(|b| b.tab_title.as_deref()),
            tab_count: browser.and_then(|b| b.tab_count),
            document_path: session.document_path.as_deref(),
            is_full_screen: session.is_full_screen,
            is_minimized: session.is_minimized,
        }
    }
}

/// Seam between the pipeline and the transport; tests script this.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, batch: &[Session]) -> Result<SyncAck, SyncError>;
}

/// HTTP uploader for the remote collector.
pub struct SyncClient {
    http: reqwest::Client,
    server_url: String,
    api_token: String,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, api_token: impl Into<String>) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            server_url: server_url.into(),
            api_token: api_token.into(),
        })
    }
}

#[async_trait]
impl Uploader for SyncClient {
    async fn upload(&self, batch: &[Session]) -> Result<SyncAck, SyncError> {
        let url = format!("{}/api/sync", self.server_url.trim_end_matches('/'));
        let envelope = SyncEnvelope {
            sessions: batch.iter().map(SessionPayload::from).collect(),
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&envelope)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        interpret_response(status, &body)
    }
}

/// Pure status/body classification so the taxonomy is testable without a
/// live collector.
fn interpret_response(status: StatusCode, body: &str) -> Result<SyncAck, SyncError> {
    match status {
        StatusCode::OK | StatusCode::ACCEPTED => serde_json::from_str(body).map_err(|_| {
            SyncError::InvalidResponse(format!(
                "malformed acceptance body: {}",
                truncate(body, 200)
            ))
        }),
        StatusCode::UNAUTHORIZED => Err(SyncError::Unauthorized),
        StatusCode::BAD_REQUEST => {
            let message = serde_json::from_str::<ErrorBody>(body)
                .map(|e| e.error)
                .unwrap_or_else(|_| truncate(body, 200));
            Err(SyncError::BadRequest(message))
        }
        StatusCode::PAYLOAD_TOO_LARGE => Err(SyncError::BatchTooLarge),
        status if status.is_server_error() => Err(SyncError::Server(status.as_u16())),
        status => Err(SyncError::InvalidResponse(format!(
            "unexpected status {status}"
        ))),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}
