use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::reports::{RawReport, RawRow, ReportKind};

const DEFAULT_API_BASE: &str = "https://analyticsdata.googleapis.com/v1beta";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Tokens this close to expiry are refreshed before use.
pub const REFRESH_BUFFER_SECS: i64 = 5 * 60;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("access token rejected")]
    Unauthorized,

    #[error("refresh token revoked or expired: {0}")]
    InvalidGrant(String),

    #[error("provider returned {status}: {body}")]
    Api { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed provider response: {0}")]
    Decode(String),
}

/// A freshly exchanged access token.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// What one report request asks the provider for.
#[derive(Debug, Clone)]
pub struct ReportRequest<'a> {
    pub property_id: &'a str,
    pub kind: ReportKind,
    pub days: u32,
}

#[allow(async_fn_in_trait)]
pub trait ReportProvider {
    async fn run_report(
        &self,
        access_token: &str,
        request: &ReportRequest<'_>,
    ) -> Result<RawReport, ProviderError>;

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_base: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout: Duration,
}

impl ProviderConfig {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            client_id,
            client_secret,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunReportResponse {
    #[serde(default)]
    rows: Vec<WireRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRow {
    #[serde(default)]
    dimension_values: Vec<WireValue>,
    #[serde(default)]
    metric_values: Vec<WireValue>,
}

#[derive(Debug, Deserialize)]
struct WireValue {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl From<RunReportResponse> for RawReport {
    fn from(resp: RunReportResponse) -> Self {
        let values = |v: Vec<WireValue>| -> Vec<String> { v.into_iter().map(|w| w.value).collect() };
        RawReport {
            rows: resp
                .rows
                .into_iter()
                .map(|row| RawRow {
                    dimensions: values(row.dimension_values),
                    metrics: values(row.metric_values),
                })
                .collect(),
        }
    }
}

/// Build the JSON body for a `runReport` call.
pub fn report_body(request: &ReportRequest<'_>) -> serde_json::Value {
    let names = |list: &[&str]| {
        list.iter()
            .map(|name| serde_json::json!({ "name": name }))
            .collect::<Vec<_>>()
    };

    serde_json::json!({
        "dateRanges": [{
            "startDate": format!("{}daysAgo", request.days),
            "endDate": "today",
        }],
        "dimensions": names(request.kind.dimensions()),
        "metrics": names(request.kind.metrics()),
        "orderBys": [{ "dimension": { "dimensionName": "date" } }],
        "limit": request.kind.row_limit(),
    })
}

/// Strip an optional `properties/` prefix and require a numeric id.
pub fn normalize_property_id(raw: &str) -> Option<&str> {
    let id = raw.trim();
    let id = id.strip_prefix("properties/").unwrap_or(id);
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) && id.bytes().any(|b| b != b'0') {
        Some(id)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct AnalyticsClient {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl AnalyticsClient {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

impl ReportProvider for AnalyticsClient {
    async fn run_report(
        &self,
        access_token: &str,
        request: &ReportRequest<'_>,
    ) -> Result<RawReport, ProviderError> {
        let url = format!(
            "{}/properties/{}:runReport",
            self.config.api_base.trim_end_matches('/'),
            request.property_id
        );

        let resp = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&report_body(request))
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Unauthorized);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        let parsed: RunReportResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(parsed.into())
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        let resp = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_token_error(status, body));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        let lifetime = token.expires_in.unwrap_or(3600);

        Ok(TokenGrant {
            access_token: token.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime),
        })
    }
}

fn classify_token_error(status: StatusCode, body: String) -> ProviderError {
    match serde_json::from_str::<TokenErrorResponse>(&body) {
        Ok(err) if err.error == "invalid_grant" => ProviderError::InvalidGrant(
            err.error_description
                .unwrap_or_else(|| "token has been expired or revoked".to_string()),
        ),
        _ => ProviderError::Api { status, body },
    }
}
