use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::daily;
use crate::models::{ConnectionStatus, Credentials, IngestState};
use crate::provider::{
    normalize_property_id, ProviderError, ReportProvider, ReportRequest, REFRESH_BUFFER_SECS,
};
use crate::reports::{self, RawReport, ReportKind, ReportSet};
use crate::store::MetricStore;
use crate::weekly;

pub const MAX_DAYS: u32 = 365;

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub user_id: Uuid,
    pub property_id: String,
    pub days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Success { days_processed: usize },
    Failure { error: String },
}

impl IngestOutcome {
    /// `{success, days_processed}` or `{success: false, error}`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            IngestOutcome::Success { days_processed } => {
                json!({ "success": true, "days_processed": days_processed })
            }
            IngestOutcome::Failure { error } => json!({ "success": false, "error": error }),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("user id is required")]
    MissingUser,

    #[error("property id is required")]
    MissingProperty,

    #[error("invalid property id {0:?}; connect a real analytics property")]
    InvalidProperty(String),

    #[error("days must be between 1 and {max}, got {0}", max = MAX_DAYS)]
    InvalidDays(u32),

    #[error("no analytics credentials found; connect an analytics account first")]
    NoCredentials,

    #[error("analytics access was revoked; reconnect the account ({0})")]
    CredentialsRevoked(String),

    #[error("failed to refresh access token: {0}")]
    Refresh(#[source] ProviderError),

    #[error("failed to fetch {report} report: {source}")]
    Fetch {
        report: &'static str,
        #[source]
        source: ProviderError,
    },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

fn validate(request: &IngestRequest) -> Result<String, IngestError> {
    if request.user_id.is_nil() {
        return Err(IngestError::MissingUser);
    }
    if request.property_id.trim().is_empty() {
        return Err(IngestError::MissingProperty);
    }
    if request.days == 0 || request.days > MAX_DAYS {
        return Err(IngestError::InvalidDays(request.days));
    }
    normalize_property_id(&request.property_id)
        .map(str::to_string)
        .ok_or_else(|| IngestError::InvalidProperty(request.property_id.clone()))
}

/// Access-token lifecycle for one run.
struct TokenSession<'a, S, P> {
    store: &'a S,
    provider: &'a P,
    credentials: Credentials,
}

impl<'a, S: MetricStore, P: ReportProvider> TokenSession<'a, S, P> {
    async fn ensure_fresh(&mut self, now: DateTime<Utc>) -> Result<(), IngestError> {
        if self.credentials.token_expiry <= now + Duration::seconds(REFRESH_BUFFER_SECS) {
            info!(user_id = %self.credentials.user_id, "Access token expired, refreshing");
            self.refresh().await?;
        }
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), IngestError> {
        let user_id = self.credentials.user_id;
        match self
            .provider
            .refresh_access_token(&self.credentials.refresh_token)
            .await
        {
            Ok(grant) => {
                self.store
                    .save_access_token(user_id, &grant.access_token, grant.expires_at)
                    .await?;
                self.credentials.access_token = grant.access_token;
                self.credentials.token_expiry = grant.expires_at;
                Ok(())
            }
            Err(ProviderError::InvalidGrant(reason)) => {
                warn!(user_id = %user_id, reason = %reason, "Refresh token rejected, marking connection invalid");
                if let Err(e) = self.store.mark_credentials_invalid(user_id, &reason).await {
                    error!(user_id = %user_id, error = %e, "Failed to mark credentials invalid");
                }
                Err(IngestError::CredentialsRevoked(reason))
            }
            Err(e) => Err(IngestError::Refresh(e)),
        }
    }

    /// Fetch one report, refreshing and retrying once on a rejected token.
    async fn fetch(&mut self, request: &ReportRequest<'_>) -> Result<RawReport, IngestError> {
        let fetch_error = |source| IngestError::Fetch {
            report: request.kind.name(),
            source,
        };

        match self
            .provider
            .run_report(&self.credentials.access_token, request)
            .await
        {
            Ok(report) => Ok(report),
            Err(ProviderError::Unauthorized) => {
                warn!(report = request.kind.name(), "Access token rejected mid-run, refreshing once");
                self.refresh().await?;
                self.provider
                    .run_report(&self.credentials.access_token, request)
                    .await
                    .map_err(fetch_error)
            }
            Err(e) => Err(fetch_error(e)),
        }
    }
}

async fn report_status<S: MetricStore>(
    store: &S,
    user_id: Uuid,
    state: IngestState,
    message: &str,
    days_processed: usize,
) {
    let days = i32::try_from(days_processed).unwrap_or(i32::MAX);
    if let Err(e) = store.set_status(user_id, state, message, days).await {
        warn!(user_id = %user_id, error = %e, "Failed to update ingest status");
    }
}

/// Run the full pipeline for one user and record the outcome in the status
/// table.
pub async fn run_ingestion<S: MetricStore, P: ReportProvider>(
    store: &S,
    provider: &P,
    request: &IngestRequest,
) -> IngestOutcome {
    run_ingestion_at(store, provider, request, Utc::now()).await
}

pub async fn run_ingestion_at<S: MetricStore, P: ReportProvider>(
    store: &S,
    provider: &P,
    request: &IngestRequest,
    now: DateTime<Utc>,
) -> IngestOutcome {
    match ingest(store, provider, request, now).await {
        Ok(days_processed) => IngestOutcome::Success { days_processed },
        Err(e) => {
            let message = e.to_string();
            error!(user_id = %request.user_id, error = %message, "Ingestion failed");
            if !request.user_id.is_nil() {
                report_status(
                    store,
                    request.user_id,
                    IngestState::Error,
                    &format!("Sync failed: {message}"),
                    0,
                )
                .await;
            }
            IngestOutcome::Failure { error: message }
        }
    }
}

async fn ingest<S: MetricStore, P: ReportProvider>(
    store: &S,
    provider: &P,
    request: &IngestRequest,
    now: DateTime<Utc>,
) -> Result<usize, IngestError> {
    let property_id = validate(request)?;
    let user_id = request.user_id;

    report_status(store, user_id, IngestState::Pending, "Sync queued", 0).await;

    let credentials = store
        .load_credentials(user_id)
        .await?
        .ok_or(IngestError::NoCredentials)?;
    if normalize_property_id(&credentials.property_id) != Some(property_id.as_str()) {
        warn!(
            user_id = %user_id,
            requested = %property_id,
            connected = %credentials.property_id,
            "Requested property differs from the connected one"
        );
    }
    if credentials.status == ConnectionStatus::Invalid {
        return Err(IngestError::CredentialsRevoked(
            "connection previously marked invalid".to_string(),
        ));
    }

    let mut session = TokenSession {
        store,
        provider,
        credentials,
    };
    session.ensure_fresh(now).await?;

    let mut fetched = ReportSet::default();
    for (i, kind) in ReportKind::ALL.into_iter().enumerate() {
        report_status(
            store,
            user_id,
            IngestState::Fetching,
            &format!(
                "Fetching {} report ({} of {}) for the last {} days",
                kind.name(),
                i + 1,
                ReportKind::ALL.len(),
                request.days
            ),
            0,
        )
        .await;

        let report_request = ReportRequest {
            property_id: &property_id,
            kind,
            days: request.days,
        };
        let report = session.fetch(&report_request).await?;
        info!(user_id = %user_id, report = kind.name(), rows = report.rows.len(), "Fetched report");
        *fetched.get_mut(kind) = report;
    }

    report_status(store, user_id, IngestState::Processing, "Processing analytics data", 0).await;

    let grouped = reports::group_reports(&fetched);
    let stats = grouped.stats;
    let batches = grouped.into_batches();
    let total_days = batches.len();

    let mut days_processed = 0usize;
    for batch in &batches {
        match store.upsert_day(user_id, batch).await {
            Ok(_) => days_processed += 1,
            Err(e) => {
                warn!(user_id = %user_id, date = %batch.date(), error = %format!("{e:#}"), "Skipping day that failed to save");
            }
        }
    }

    info!(
        user_id = %user_id,
        days_processed,
        total_days,
        rows_skipped = stats.skipped,
        "Metrics persisted"
    );

    report_status(
        store,
        user_id,
        IngestState::Processing,
        &format!("Saved {days_processed} of {total_days} days, generating insights"),
        days_processed,
    )
    .await;

    let today = now.date_naive();
    if let Err(e) = daily::run_daily_detection(store, user_id, today).await {
        error!(user_id = %user_id, error = %format!("{e:#}"), "Daily event detection failed");
    }
    if let Err(e) = weekly::run_weekly_detection(store, user_id, today).await {
        error!(user_id = %user_id, error = %format!("{e:#}"), "Weekly insight detection failed");
    }

    let mut message = if total_days == 0 {
        format!("Sync complete: no data returned for the last {} days", request.days)
    } else {
        format!("Sync complete: {days_processed} of {total_days} days saved")
    };
    if stats.skipped > 0 {
        message.push_str(&format!(" ({} malformed rows skipped)", stats.skipped));
    }
    report_status(store, user_id, IngestState::Complete, &message, days_processed).await;

    Ok(days_processed)
}
