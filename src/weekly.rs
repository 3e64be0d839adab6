use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::models::{DailyMetric, EventType, InsightEvent, ReferrerRecord};
use crate::store::MetricStore;

pub const WINDOW_WEEKS: i64 = 8;
pub const MOMENTUM_THRESHOLD_PCT: f64 = 15.0;
pub const QUALITY_SCORE_MIN: f64 = 7.0;
pub const QUALITY_DAYS_MIN: u32 = 3;
pub const QUALITY_BOUNCE_MAX: f64 = 0.4;
pub const QUALITY_DURATION_MIN_SECS: f64 = 180.0;
pub const REFERRER_SHARE_PCT: f64 = 20.0;
pub const REFERRER_RISK_PCT: f64 = 50.0;
pub const REFERRER_CRITICAL_PCT: f64 = 70.0;
pub const ACCELERATION_FACTOR: f64 = 1.1;

/// Get the Monday of the week containing the given date
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// Get the Sunday of the week containing the given date
pub fn week_end(date: NaiveDate) -> NaiveDate {
    week_start(date) + Duration::days(6)
}

/// The last `WINDOW_WEEKS` complete weeks before the week containing `today`.
pub fn detection_window(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let end = week_start(today) - Duration::days(1);
    let start = week_start(end) - Duration::weeks(WINDOW_WEEKS - 1);
    (start, end)
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeekAggregate {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub iso_week: u32,
    pub days: u32,
    pub visitors: i64,
    pub page_views: i64,
    pub avg_bounce_rate: f64,
    pub avg_session_duration: f64,
    pub quality_days: u32,
}

impl WeekAggregate {
    fn range_label(&self) -> String {
        format!("{} – {}", self.week_start, self.week_end)
    }
}

/// Aggregate daily rows into weeks, oldest first. Empty weeks are absent.
pub fn aggregate_weeks(metrics: &[DailyMetric]) -> Vec<WeekAggregate> {
    let mut buckets: BTreeMap<NaiveDate, Vec<&DailyMetric>> = BTreeMap::new();
    for m in metrics {
        buckets.entry(week_start(m.date)).or_default().push(m);
    }

    buckets
        .into_iter()
        .map(|(start, days)| {
            let n = days.len() as f64;
            WeekAggregate {
                week_start: start,
                week_end: week_end(start),
                iso_week: start.iso_week().week(),
                days: days.len() as u32,
                visitors: days.iter().map(|d| d.visitors).sum(),
                page_views: days.iter().map(|d| d.page_views).sum(),
                avg_bounce_rate: days.iter().map(|d| d.bounce_rate).sum::<f64>() / n,
                avg_session_duration: days.iter().map(|d| d.avg_session_duration).sum::<f64>() / n,
                quality_days: days
                    .iter()
                    .filter(|d| {
                        d.bounce_rate < QUALITY_BOUNCE_MAX
                            && d.avg_session_duration > QUALITY_DURATION_MIN_SECS
                    })
                    .count() as u32,
            }
        })
        .collect()
}

/// Referred visitors per source within `[from, to]`, largest first.
fn referrer_totals(referrers: &[ReferrerRecord], from: NaiveDate, to: NaiveDate) -> Vec<(String, i64)> {
    let mut totals: BTreeMap<&str, i64> = BTreeMap::new();
    for r in referrers.iter().filter(|r| r.date >= from && r.date <= to) {
        *totals.entry(r.source.as_str()).or_default() += r.visitors;
    }

    let mut sorted: Vec<(String, i64)> = totals
        .into_iter()
        .map(|(source, visitors)| (source.to_string(), visitors))
        .collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn momentum(user_id: Uuid, previous: &WeekAggregate, current: &WeekAggregate) -> Option<InsightEvent> {
    if previous.visitors <= 0 {
        return None;
    }
    let change = (current.visitors - previous.visitors) as f64 / previous.visitors as f64 * 100.0;
    if change.abs() <= MOMENTUM_THRESHOLD_PCT {
        return None;
    }

    let pct = change.abs().round();
    let (direction, title, description) = if change > 0.0 {
        (
            "up",
            format!("Traffic up {pct:.0}% week over week"),
            format!(
                "Momentum is building: {} visitors in the week of {}, up from {}",
                current.visitors, current.week_start, previous.visitors
            ),
        )
    } else {
        (
            "down",
            format!("Traffic down {pct:.0}% week over week"),
            format!(
                "Traffic cooled off: {} visitors in the week of {}, down from {}",
                current.visitors, current.week_start, previous.visitors
            ),
        )
    };

    Some(InsightEvent {
        user_id,
        date: current.week_end,
        event_type: EventType::WeeklyMomentum,
        event_key: String::new(),
        title,
        description,
        value: round1(change),
        metadata: json!({
            "direction": direction,
            "previous_visitors": previous.visitors,
            "visitors": current.visitors,
            "percent_change": round1(change),
            "previous_page_views": previous.page_views,
            "page_views": current.page_views,
            "iso_week": current.iso_week,
            "week_start": current.week_start,
            "week_end": current.week_end,
        }),
    })
}

fn quality_traffic(user_id: Uuid, week: &WeekAggregate) -> Option<InsightEvent> {
    let avg_minutes = week.avg_session_duration / 60.0;
    let engagement_score = (avg_minutes / 2.0).min(10.0);
    let bounce_score = (10.0 - week.avg_bounce_rate * 25.0).max(0.0);
    let score = (engagement_score + bounce_score) / 2.0;
    if score < QUALITY_SCORE_MIN || week.quality_days < QUALITY_DAYS_MIN {
        return None;
    }

    Some(InsightEvent {
        user_id,
        date: week.week_end,
        event_type: EventType::QualityTraffic,
        event_key: String::new(),
        title: "High-quality traffic week".to_string(),
        description: format!(
            "Visitors stayed {:.1} minutes on average with a {:.0}% bounce rate; {} days met the quality bar ({})",
            avg_minutes,
            week.avg_bounce_rate * 100.0,
            week.quality_days,
            week.range_label()
        ),
        value: round1(score),
        metadata: json!({
            "engagement_score": round1(engagement_score),
            "bounce_score": round1(bounce_score),
            "quality_score": round1(score),
            "quality_days": week.quality_days,
            "days_with_data": week.days,
            "avg_session_minutes": round1(avg_minutes),
            "avg_bounce_rate": week.avg_bounce_rate,
            "week_start": week.week_start,
            "week_end": week.week_end,
        }),
    })
}

fn referrer_milestones(
    user_id: Uuid,
    week: &WeekAggregate,
    sources: &[(String, i64)],
    referred: i64,
) -> Vec<InsightEvent> {
    if referred <= 0 {
        return Vec::new();
    }

    sources
        .iter()
        .filter_map(|(source, visitors)| {
            let share = *visitors as f64 / referred as f64 * 100.0;
            if share <= REFERRER_SHARE_PCT {
                return None;
            }
            Some(InsightEvent {
                user_id,
                date: week.week_end,
                event_type: EventType::ReferrerMilestone,
                event_key: source.clone(),
                title: format!("{source} is a top traffic source"),
                description: format!(
                    "{source} sent {share:.0}% of referred visitors ({visitors} of {referred}) in the week of {}",
                    week.week_start
                ),
                value: round1(share),
                metadata: json!({
                    "source": source,
                    "visitors": visitors,
                    "referred_visitors": referred,
                    "share_percent": round1(share),
                    "week_start": week.week_start,
                    "week_end": week.week_end,
                }),
            })
        })
        .collect()
}

fn acceleration(
    user_id: Uuid,
    w1: &WeekAggregate,
    w2: &WeekAggregate,
    w3: &WeekAggregate,
) -> Option<InsightEvent> {
    let g1 = w2.visitors - w1.visitors;
    let g2 = w3.visitors - w2.visitors;
    if g1 <= 0 || (g2 as f64) <= g1 as f64 * ACCELERATION_FACTOR {
        return None;
    }

    let pct = (g2 - g1) as f64 / g1 as f64 * 100.0;
    Some(InsightEvent {
        user_id,
        date: w3.week_end,
        event_type: EventType::GrowthAcceleration,
        event_key: String::new(),
        title: "Growth is accelerating".to_string(),
        description: format!(
            "Weekly growth rose from +{g1} to +{g2} visitors ({pct:.0}% faster) by the week of {}",
            w3.week_start
        ),
        value: round1(pct),
        metadata: json!({
            "weekly_visitors": [w1.visitors, w2.visitors, w3.visitors],
            "previous_growth": g1,
            "growth": g2,
            "acceleration_percent": round1(pct),
            "week_start": w3.week_start,
            "week_end": w3.week_end,
        }),
    })
}

fn referrer_risk(
    user_id: Uuid,
    week: &WeekAggregate,
    sources: &[(String, i64)],
    referred: i64,
) -> Vec<InsightEvent> {
    if referred <= 0 {
        return Vec::new();
    }

    sources
        .iter()
        .filter_map(|(source, visitors)| {
            let share = *visitors as f64 / referred as f64 * 100.0;
            if share <= REFERRER_RISK_PCT {
                return None;
            }
            let severity = if share > REFERRER_CRITICAL_PCT {
                "critical"
            } else {
                "warning"
            };
            Some(InsightEvent {
                user_id,
                date: week.week_end,
                event_type: EventType::ReferrerRisk,
                event_key: source.clone(),
                title: format!("Traffic depends heavily on {source}"),
                description: format!(
                    "{share:.0}% of last week's referred visitors came from {source}; a change there would hit traffic hard"
                ),
                value: round1(share),
                metadata: json!({
                    "source": source,
                    "visitors": visitors,
                    "referred_visitors": referred,
                    "share_percent": round1(share),
                    "severity": severity,
                    "week_start": week.week_start,
                    "week_end": week.week_end,
                }),
            })
        })
        .collect()
}

/// Run every weekly rule over data already limited to the detection window.
pub fn detect_weekly_insights(
    user_id: Uuid,
    metrics: &[DailyMetric],
    referrers: &[ReferrerRecord],
) -> Vec<InsightEvent> {
    let weeks = aggregate_weeks(metrics);
    let mut events = Vec::new();

    for pair in weeks.windows(2) {
        events.extend(momentum(user_id, &pair[0], &pair[1]));
    }

    for week in &weeks {
        events.extend(quality_traffic(user_id, week));

        let sources = referrer_totals(referrers, week.week_start, week.week_end);
        let referred: i64 = sources.iter().map(|(_, v)| v).sum();
        events.extend(referrer_milestones(user_id, week, &sources, referred));
    }

    for triple in weeks.windows(3) {
        events.extend(acceleration(user_id, &triple[0], &triple[1], &triple[2]));
    }

    if let Some(latest) = weeks.last() {
        let sources = referrer_totals(referrers, latest.week_start, latest.week_end);
        let referred: i64 = sources.iter().map(|(_, v)| v).sum();
        events.extend(referrer_risk(user_id, latest, &sources, referred));
    }

    events
}

/// Regenerate the weekly insights for the window ending before `today`'s week.
pub async fn run_weekly_detection<S: MetricStore>(
    store: &S,
    user_id: Uuid,
    today: NaiveDate,
) -> anyhow::Result<usize> {
    let (from, to) = detection_window(today);
    let metrics = store.metrics_between(user_id, from, to).await?;
    let referrers = store.referrers_between(user_id, from, to).await?;
    let events = detect_weekly_insights(user_id, &metrics, &referrers);

    store
        .replace_events(user_id, &EventType::WEEKLY, from, to, &events)
        .await?;

    info!(
        user_id = %user_id,
        window_start = %from,
        window_end = %to,
        events = events.len(),
        "Weekly detection complete"
    );
    Ok(events.len())
}
