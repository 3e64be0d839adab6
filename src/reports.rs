use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::dates::{self, DateError};
use crate::models::{
    DailyTotals, DayBatch, DeviceRecord, GeographyRecord, ReferrerRecord, TopPageRecord,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
}

impl RawRow {
    #[cfg(test)]
    pub fn new(dimensions: &[&str], metrics: &[&str]) -> Self {
        Self {
            dimensions: dimensions.iter().map(|s| s.to_string()).collect(),
            metrics: metrics.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawReport {
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    Totals,
    Referrers,
    Pages,
    Geography,
    Devices,
}

impl ReportKind {
    pub const ALL: [ReportKind; 5] = [
        ReportKind::Totals,
        ReportKind::Referrers,
        ReportKind::Pages,
        ReportKind::Geography,
        ReportKind::Devices,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ReportKind::Totals => "totals",
            ReportKind::Referrers => "referrers",
            ReportKind::Pages => "pages",
            ReportKind::Geography => "geography",
            ReportKind::Devices => "devices",
        }
    }

    /// Provider dimension names, in the order rows carry them.
    pub fn dimensions(&self) -> &'static [&'static str] {
        match self {
            ReportKind::Totals => &["date"],
            ReportKind::Referrers => &["date", "sessionSource"],
            ReportKind::Pages => &["date", "pagePath"],
            ReportKind::Geography => &["date", "country", "countryId", "city"],
            ReportKind::Devices => &["date", "deviceCategory", "browser", "operatingSystem"],
        }
    }

    /// Provider metric names, in the order rows carry them.
    pub fn metrics(&self) -> &'static [&'static str] {
        match self {
            ReportKind::Totals => &[
                "activeUsers",
                "screenPageViews",
                "averageSessionDuration",
                "bounceRate",
            ],
            ReportKind::Referrers => &["activeUsers"],
            ReportKind::Pages => &["screenPageViews", "averageSessionDuration"],
            ReportKind::Geography => &["activeUsers", "screenPageViews"],
            ReportKind::Devices => &["activeUsers", "screenPageViews"],
        }
    }

    /// Row cap requested from the provider.
    pub fn row_limit(&self) -> u32 {
        match self {
            ReportKind::Totals => 1000,
            ReportKind::Referrers => 5000,
            ReportKind::Pages | ReportKind::Geography | ReportKind::Devices => 10000,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RowError {
    #[error("{kind} row has {found} dimensions, expected {expected}")]
    Dimensions {
        kind: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{kind} row has {found} metrics, expected {expected}")]
    Metrics {
        kind: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Date(#[from] DateError),

    #[error("metric {name} is not numeric: {value:?}")]
    Number { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportRecord {
    Totals(DailyTotals),
    Referrer(ReferrerRecord),
    Page(TopPageRecord),
    Geography(GeographyRecord),
    Device(DeviceRecord),
}

impl ReportRecord {
    pub fn date(&self) -> NaiveDate {
        match self {
            ReportRecord::Totals(r) => r.date,
            ReportRecord::Referrer(r) => r.date,
            ReportRecord::Page(r) => r.date,
            ReportRecord::Geography(r) => r.date,
            ReportRecord::Device(r) => r.date,
        }
    }
}

/// Parse one raw row into the typed record for `kind`.
pub fn parse_row(kind: ReportKind, row: &RawRow) -> Result<ReportRecord, RowError> {
    let dims_expected = kind.dimensions().len();
    let metrics_expected = kind.metrics().len();
    if row.dimensions.len() < dims_expected {
        return Err(RowError::Dimensions {
            kind: kind.name(),
            expected: dims_expected,
            found: row.dimensions.len(),
        });
    }
    if row.metrics.len() < metrics_expected {
        return Err(RowError::Metrics {
            kind: kind.name(),
            expected: metrics_expected,
            found: row.metrics.len(),
        });
    }

    let date = dates::parse_report_date(&row.dimensions[0])?;
    let dim = |i: usize| row.dimensions[i].trim().to_string();
    let names = kind.metrics();
    let int = |i: usize| parse_count(names[i], &row.metrics[i]);
    let float = |i: usize| parse_float(names[i], &row.metrics[i]);

    let record = match kind {
        ReportKind::Totals => ReportRecord::Totals(DailyTotals {
            date,
            visitors: int(0)?,
            page_views: int(1)?,
            avg_session_duration: float(2)?,
            bounce_rate: float(3)?,
        }),
        ReportKind::Referrers => ReportRecord::Referrer(ReferrerRecord {
            date,
            source: dim(1),
            visitors: int(0)?,
        }),
        ReportKind::Pages => ReportRecord::Page(TopPageRecord {
            date,
            page_path: dim(1),
            page_views: int(0)?,
            avg_engagement_time: float(1)?,
        }),
        ReportKind::Geography => ReportRecord::Geography(GeographyRecord {
            date,
            country: dim(1),
            country_code: dim(2),
            city: dim(3),
            visitors: int(0)?,
            page_views: int(1)?,
        }),
        ReportKind::Devices => ReportRecord::Device(DeviceRecord {
            date,
            device_category: dim(1),
            browser: dim(2),
            operating_system: dim(3),
            visitors: int(0)?,
            page_views: int(1)?,
        }),
    };

    Ok(record)
}

fn parse_float(name: &'static str, value: &str) -> Result<f64, RowError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| RowError::Number {
            name,
            value: value.to_string(),
        })
}

/// Counts must be non-negative and fit in `i64` once rounded.
fn parse_count(name: &'static str, value: &str) -> Result<i64, RowError> {
    let invalid = || RowError::Number {
        name,
        value: value.to_string(),
    };
    if let Ok(v) = value.trim().parse::<i64>() {
        return if v >= 0 { Ok(v) } else { Err(invalid()) };
    }
    let v = parse_float(name, value)?.round();
    if (0.0..i64::MAX as f64).contains(&v) {
        Ok(v as i64)
    } else {
        Err(invalid())
    }
}

/// Counts of rows accepted and skipped per grouping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupingStats {
    pub accepted: usize,
    pub skipped: usize,
}

/// The five provider reports as fetched for one run.
#[derive(Debug, Clone, Default)]
pub struct ReportSet {
    pub totals: RawReport,
    pub referrers: RawReport,
    pub pages: RawReport,
    pub geography: RawReport,
    pub devices: RawReport,
}

impl ReportSet {
    pub fn get(&self, kind: ReportKind) -> &RawReport {
        match kind {
            ReportKind::Totals => &self.totals,
            ReportKind::Referrers => &self.referrers,
            ReportKind::Pages => &self.pages,
            ReportKind::Geography => &self.geography,
            ReportKind::Devices => &self.devices,
        }
    }

    pub fn get_mut(&mut self, kind: ReportKind) -> &mut RawReport {
        match kind {
            ReportKind::Totals => &mut self.totals,
            ReportKind::Referrers => &mut self.referrers,
            ReportKind::Pages => &mut self.pages,
            ReportKind::Geography => &mut self.geography,
            ReportKind::Devices => &mut self.devices,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupedReports {
    pub totals: BTreeMap<NaiveDate, DailyTotals>,
    pub referrers: BTreeMap<NaiveDate, Vec<ReferrerRecord>>,
    pub pages: BTreeMap<NaiveDate, Vec<TopPageRecord>>,
    pub geography: BTreeMap<NaiveDate, Vec<GeographyRecord>>,
    pub devices: BTreeMap<NaiveDate, Vec<DeviceRecord>>,
    pub stats: GroupingStats,
}

impl GroupedReports {
    /// One batch per date of the totals report, ascending. Children for
    /// dates the totals report lacks are dropped.
    pub fn into_batches(mut self) -> Vec<DayBatch> {
        let totals = std::mem::take(&mut self.totals);
        totals
            .into_values()
            .map(|totals| {
                let date = totals.date;
                DayBatch {
                    totals,
                    referrers: self.referrers.remove(&date).unwrap_or_default(),
                    pages: self.pages.remove(&date).unwrap_or_default(),
                    geography: self.geography.remove(&date).unwrap_or_default(),
                    devices: self.devices.remove(&date).unwrap_or_default(),
                }
            })
            .collect()
    }
}

/// Parse every row of `report`, skipping malformed ones.
pub fn parse_report(kind: ReportKind, report: &RawReport) -> (Vec<ReportRecord>, GroupingStats) {
    let mut stats = GroupingStats::default();
    let mut records = Vec::with_capacity(report.rows.len());

    for (index, row) in report.rows.iter().enumerate() {
        match parse_row(kind, row) {
            Ok(record) => {
                stats.accepted += 1;
                records.push(record);
            }
            Err(e) => {
                stats.skipped += 1;
                warn!(report = kind.name(), row = index, error = %e, "Skipping malformed report row");
            }
        }
    }

    (records, stats)
}

/// Group all five reports by date.
pub fn group_reports(reports: &ReportSet) -> GroupedReports {
    let mut grouped = GroupedReports::default();

    for kind in ReportKind::ALL {
        let (records, stats) = parse_report(kind, reports.get(kind));
        grouped.stats.accepted += stats.accepted;
        grouped.stats.skipped += stats.skipped;

        for record in records {
            let date = record.date();
            match record {
                ReportRecord::Totals(t) => merge_totals(&mut grouped.totals, t),
                ReportRecord::Referrer(r) => grouped.referrers.entry(date).or_default().push(r),
                ReportRecord::Page(p) => grouped.pages.entry(date).or_default().push(p),
                ReportRecord::Geography(g) => grouped.geography.entry(date).or_default().push(g),
                ReportRecord::Device(d) => grouped.devices.entry(date).or_default().push(d),
            }
        }
    }

    grouped
}

/// Several totals rows for one date are summed; rates are visitor-weighted.
fn merge_totals(totals: &mut BTreeMap<NaiveDate, DailyTotals>, row: DailyTotals) {
    match totals.get_mut(&row.date) {
        None => {
            totals.insert(row.date, row);
        }
        Some(existing) => {
            let combined = existing.visitors.saturating_add(row.visitors);
            if combined > 0 {
                let weight = |a: f64, wa: i64, b: f64, wb: i64| {
                    (a * wa as f64 + b * wb as f64) / combined as f64
                };
                existing.avg_session_duration = weight(
                    existing.avg_session_duration,
                    existing.visitors,
                    row.avg_session_duration,
                    row.visitors,
                );
                existing.bounce_rate =
                    weight(existing.bounce_rate, existing.visitors, row.bounce_rate, row.visitors);
            }
            existing.visitors = combined;
            existing.page_views = existing.page_views.saturating_add(row.page_views);
        }
    }
}
