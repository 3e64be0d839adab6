use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyMetric {
    pub id: Uuid,
    pub user_id: Uuid,
    pub date: NaiveDate,
    pub visitors: i64,
    pub page_views: i64,
    pub avg_session_duration: f64,
    pub bounce_rate: f64,
}

/// Totals for one day as reported by the provider, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyTotals {
    pub date: NaiveDate,
    pub visitors: i64,
    pub page_views: i64,
    pub avg_session_duration: f64,
    pub bounce_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferrerRecord {
    pub date: NaiveDate,
    pub source: String,
    pub visitors: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopPageRecord {
    pub date: NaiveDate,
    pub page_path: String,
    pub page_views: i64,
    pub avg_engagement_time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeographyRecord {
    pub date: NaiveDate,
    pub country: String,
    pub country_code: String,
    pub city: String,
    pub visitors: i64,
    pub page_views: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub date: NaiveDate,
    pub device_category: String,
    pub browser: String,
    pub operating_system: String,
    pub visitors: i64,
    pub page_views: i64,
}

/// Everything one date contributes to storage: the aggregate row plus the
/// replacement set of child rows.
#[derive(Debug, Clone, PartialEq)]
pub struct DayBatch {
    pub totals: DailyTotals,
    pub referrers: Vec<ReferrerRecord>,
    pub pages: Vec<TopPageRecord>,
    pub geography: Vec<GeographyRecord>,
    pub devices: Vec<DeviceRecord>,
}

impl DayBatch {
    pub fn date(&self) -> NaiveDate {
        self.totals.date
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Spike,
    Drop,
    Milestone,
    Streak,
    WeeklyMomentum,
    QualityTraffic,
    ReferrerMilestone,
    GrowthAcceleration,
    ReferrerRisk,
}

impl EventType {
    pub const DAILY: [EventType; 4] = [
        EventType::Spike,
        EventType::Drop,
        EventType::Milestone,
        EventType::Streak,
    ];

    pub const WEEKLY: [EventType; 5] = [
        EventType::WeeklyMomentum,
        EventType::QualityTraffic,
        EventType::ReferrerMilestone,
        EventType::GrowthAcceleration,
        EventType::ReferrerRisk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Spike => "spike",
            EventType::Drop => "drop",
            EventType::Milestone => "milestone",
            EventType::Streak => "streak",
            EventType::WeeklyMomentum => "weekly_momentum",
            EventType::QualityTraffic => "quality_traffic",
            EventType::ReferrerMilestone => "referrer_milestone",
            EventType::GrowthAcceleration => "growth_acceleration",
            EventType::ReferrerRisk => "referrer_risk",
        }
    }

    pub fn is_weekly(&self) -> bool {
        Self::WEEKLY.contains(self)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::DAILY
            .iter()
            .chain(Self::WEEKLY.iter())
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightEvent {
    pub user_id: Uuid,
    pub date: NaiveDate,
    pub event_type: EventType,
    /// Distinguishes several events of one type on one date (milestone
    /// threshold, referrer source). Empty when the type occurs once per day.
    pub event_key: String,
    pub title: String,
    pub description: String,
    pub value: f64,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Invalid,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Invalid => "invalid",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "invalid" => ConnectionStatus::Invalid,
            _ => ConnectionStatus::Active,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: Uuid,
    pub property_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expiry: DateTime<Utc>,
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Pending,
    Fetching,
    Processing,
    Complete,
    Error,
}

impl IngestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestState::Pending => "pending",
            IngestState::Fetching => "fetching",
            IngestState::Processing => "processing",
            IngestState::Complete => "complete",
            IngestState::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestStatus {
    pub status: String,
    pub message: String,
    pub days_processed: i32,
    pub updated_at: DateTime<Utc>,
}
