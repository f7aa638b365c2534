use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.worklog.app";
const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Error)]
pub enum WorklogError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Validation,
    LimitExceeded,
    NotFound,
    Conflict,
    Permanent,
}

/// The record collections the ledger API exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Earning,
    Expense,
    Shift,
}

impl EntryKind {
    pub fn collection(&self) -> &'static str {
        match self {
            EntryKind::Earning => "earnings",
            EntryKind::Expense => "expenses",
            EntryKind::Shift => "shifts",
        }
    }
}

#[derive(Clone)]
pub struct WorklogClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl WorklogClient {
    pub fn new(token: impl Into<String>) -> Result<Self, WorklogError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, WorklogError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Create a record. The client-generated `record_id` is part of the body
    /// so the server can deduplicate replays; the `Idempotency-Key` header
    /// carries the per-operation key.
    pub async fn create_entry(
        &self,
        kind: EntryKind,
        record_id: &str,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<RecordEnvelope, WorklogError> {
        let url = self.endpoint(&format!("/v1/{}", kind.collection()))?;
        let mut body = payload.clone();
        if let serde_json::Value::Object(fields) = &mut body {
            fields.insert(
                "id".to_string(),
                serde_json::Value::String(record_id.to_string()),
            );
        }
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn update_entry(
        &self,
        kind: EntryKind,
        record_id: &str,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<RecordEnvelope, WorklogError> {
        let url = self.endpoint(&format!("/v1/{}/{record_id}", kind.collection()))?;
        let response = self
            .http
            .patch(url)
            .header("Authorization", self.auth_header_value())
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .json(payload)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_entry(
        &self,
        kind: EntryKind,
        record_id: &str,
        idempotency_key: &str,
    ) -> Result<(), WorklogError> {
        let url = self.endpoint(&format!("/v1/{}/{record_id}", kind.collection()))?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::error_from_response(response).await)
    }

    pub async fn get_account(&self) -> Result<crate::plan::AccountInfo, WorklogError> {
        let url = self.endpoint("/v1/account")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Cheap reachability check used by the connectivity monitor.
    pub async fn ping(&self) -> Result<(), WorklogError> {
        let url = self.endpoint("/v1/ping")?;
        let response = self.http.get(url).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::error_from_response(response).await)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, WorklogError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, WorklogError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::error_from_response(response).await)
        }
    }

    async fn error_from_response(response: reqwest::Response) -> WorklogError {
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        WorklogError::Api {
            status,
            body,
            retry_after,
        }
    }
}

impl WorklogError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            WorklogError::Api { status, body, .. } => Some(classify_api_error(*status, body)),
            WorklogError::Request(_) => Some(ApiErrorClass::Transient),
            WorklogError::Url(_) => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    /// Server-requested delay before the next attempt, when one was sent.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            WorklogError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_error(status: StatusCode, body: &str) -> ApiErrorClass {
    if status == StatusCode::PAYMENT_REQUIRED
        || (status == StatusCode::FORBIDDEN && body.contains("limit_exceeded"))
    {
        return ApiErrorClass::LimitExceeded;
    }
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status == StatusCode::CONFLICT {
        ApiErrorClass::Conflict
    } else if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
        ApiErrorClass::NotFound
    } else if matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY) {
        ApiErrorClass::Validation
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(std::time::SystemTime::now())
        .ok()
        .map(|delay| delay.as_secs())
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecordEnvelope {
    pub id: String,
    #[serde(default)]
    pub modified: Option<String>,
}
